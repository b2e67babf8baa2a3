// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Engine configuration.
//!
//! Configuration is loaded from, in increasing priority:
//!   1. Built-in defaults.
//!   2. An optional TOML file pointed to by the `MOSAIC_CONFIG_PATH`
//!      environment variable.
//!   3. `MOSAIC_*` environment variables (highest priority).
//!
//! Example:
//! ```toml
//! num_workers = 4
//! work_stealing = true
//! sleep_time = 0.005
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// ENV used to point at an optional TOML configuration file
const CONFIG_PATH_ENV: &str = "MOSAIC_CONFIG_PATH";

/// Prefix for configuration environment variables
const ENV_PREFIX: &str = "MOSAIC_";

/// Settings for a master and its fixed worker fleet.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of workers in the fleet. The peer set is `num_workers + 1`
    /// ranks; rank 0 is the master.
    pub num_workers: usize,

    /// Allow the rebalancer to migrate pending tasks to idle workers.
    pub work_stealing: bool,

    /// Seconds to sleep when a non-blocking probe finds no message.
    pub sleep_time: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            work_stealing: false,
            sleep_time: 0.001,
        }
    }
}

impl EngineConfig {
    /// Load settings from defaults, the optional TOML file and the
    /// environment.
    pub fn from_settings() -> anyhow::Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            figment = figment.merge(Toml::file(path));
        }
        let config: EngineConfig = figment.merge(Env::prefixed(ENV_PREFIX)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// The probe back-off as a [`Duration`].
    pub fn sleep_duration(&self) -> Duration {
        Duration::from_secs_f64(self.sleep_time)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.num_workers == 0 {
            anyhow::bail!("num_workers must be at least 1");
        }
        if !self.sleep_time.is_finite() || self.sleep_time < 0.0 {
            anyhow::bail!("sleep_time must be a non-negative number of seconds");
        }
        Ok(())
    }
}
