//! Configuration for agents.
//!
//! [`AgentSettings`] is read from TOML and carries the loop limits and the
//! execution backend of one agent. Every key has a default, so an empty
//! document is a valid configuration.

#![warn(missing_docs, clippy::pedantic)]

mod settings;

use std::path::PathBuf;

use agent_sandbox::SandboxError;
use thiserror::Error;

pub use settings::{AgentSection, AgentSettings, ExecutorKind, ExecutorSection};

/// Errors produced while loading settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The settings file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that was being read.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The document is not valid TOML or has unknown keys.
    #[error("invalid settings document: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid `{field}`: {reason}")]
    Invalid {
        /// Dotted key of the offending value.
        field: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The execution backend could not be built.
    #[error("executor configuration failed: {0}")]
    Executor(#[from] SandboxError),
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.to_owned(),
            reason: reason.into(),
        }
    }
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
