// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Mosaic logging module.
//!
//! Logging can take two forms: `READABLE` or `JSONL`. The default is
//! `READABLE`; `JSONL` can be enabled by setting the `MOSAIC_LOG_JSONL`
//! environment variable to `1`.
//!
//! Filters are configured through the `MOSAIC_LOG` environment variable using
//! the usual `tracing_subscriber::EnvFilter` syntax, e.g.
//! `MOSAIC_LOG=info,mosaic_runtime::master=debug`. The default level is
//! `info`.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// ENV used to set the log filter
const FILTER_ENV: &str = "MOSAIC_LOG";

/// ENV used to switch to JSONL output
const JSONL_ENV: &str = "MOSAIC_LOG_JSONL";

/// Default log level applied when `MOSAIC_LOG` is unset or unparsable
const DEFAULT_FILTER_LEVEL: &str = "info";

/// Once instance to ensure the logger is only initialized once
static INIT: Once = Once::new();

/// Initialize the process-wide tracing subscriber.
///
/// Safe to call more than once; only the first call installs a subscriber.
/// Library code never calls this on its own. Binaries and tests opt in.
pub fn init() {
    INIT.call_once(setup_logging);
}

fn setup_logging() {
    let filter = EnvFilter::try_from_env(FILTER_ENV)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER_LEVEL));

    let jsonl = std::env::var(JSONL_ENV).map(|v| v == "1").unwrap_or(false);

    if jsonl {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
