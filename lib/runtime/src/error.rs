// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Mosaic Error System
//!
//! This module provides a standardized error type for the engine with support for:
//! - Categorized error types via the [`ErrorKind`] enum
//! - Error chaining via the standard [`std::error::Error::source()`] method
//! - Serialization for network transmission via serde
//!
//! Every fatal condition in the control plane falls into one of four
//! categories: a misconfigured run ([`ErrorKind::Config`]), a failed startup
//! ([`ErrorKind::Bootstrap`]), a broken scheduling invariant
//! ([`ErrorKind::Invariant`]) or a failed message exchange
//! ([`ErrorKind::Transport`]). Soft conditions (an idle worker, a steal
//! refused by the cost model) are not errors; they are logged and ignored.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorizes fatal engine errors into a fixed set of standard kinds.
///
/// Callers inspect the kind to decide how loudly to die, rather than the
/// error defining its own behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// A run referenced an unknown kernel, method or table, or a registry
    /// collision occurred. Fatal at run start.
    Config,
    /// Startup preconditions were not met: too few peers, missing worker
    /// registrations. Fatal at master construction.
    Bootstrap,
    /// A scheduling invariant was violated: task double-finish, completion
    /// for a task never dispatched, a run started before the previous one
    /// drained.
    Invariant,
    /// A message send, broadcast or receive failed.
    Transport,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Config => write!(f, "Config"),
            ErrorKind::Bootstrap => write!(f, "Bootstrap"),
            ErrorKind::Invariant => write!(f, "Invariant"),
            ErrorKind::Transport => write!(f, "Transport"),
        }
    }
}

/// The standardized error type for the engine.
///
/// `EngineError` is a serializable, chainable error that carries an
/// [`ErrorKind`] for categorization and supports error chaining via
/// [`std::error::Error::source()`]. `Display` shows only the current error
/// (standard Rust convention); use `source()` to walk the cause chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineError {
    kind: ErrorKind,
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    caused_by: Option<Box<EngineError>>,
}

impl EngineError {
    /// Create a new error with the given kind, message, and optional cause.
    pub fn new(
        kind: ErrorKind,
        message: impl Into<String>,
        cause: Option<impl std::error::Error + 'static>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            caused_by: cause.map(|e| {
                Box::new(EngineError {
                    kind,
                    message: e.to_string(),
                    caused_by: None,
                })
            }),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::msg(ErrorKind::Config, message)
    }

    pub fn bootstrap(message: impl Into<String>) -> Self {
        Self::msg(ErrorKind::Bootstrap, message)
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::msg(ErrorKind::Invariant, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::msg(ErrorKind::Transport, message)
    }

    fn msg(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            caused_by: None,
        }
    }

    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.caused_by
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Extract the [`ErrorKind`] from an [`anyhow::Error`] chain, if any link in
/// the chain is an [`EngineError`].
pub fn kind_of(err: &anyhow::Error) -> Option<ErrorKind> {
    err.chain()
        .find_map(|e| e.downcast_ref::<EngineError>())
        .map(|e| e.kind())
}
