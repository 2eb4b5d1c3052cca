//! Error types for the memory subsystem.

use serde_json::Error as SerdeError;
use thiserror::Error;

/// Errors emitted by memory components.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Underlying I/O failure while reading or writing journal files.
    #[error("i/o error: {source}")]
    Io {
        /// Source [`std::io::Error`].
        #[from]
        source: std::io::Error,
    },
    /// Serialization or deserialization error.
    #[error("serialization error: {source}")]
    Serialization {
        /// Source [`serde_json::Error`].
        #[from]
        source: SerdeError,
    },
    /// The operation is only allowed between runs.
    #[error("memory cannot be modified this way while a run is in progress")]
    RunInProgress,
    /// A run was ended without having been started.
    #[error("no run is in progress")]
    NoRunInProgress,
    /// Appending the record would break the log's ordering rules.
    #[error("out-of-order record: {reason}")]
    OutOfOrder {
        /// Which rule the record broke.
        reason: String,
    },
}

impl MemoryError {
    pub(crate) fn out_of_order(reason: impl Into<String>) -> Self {
        Self::OutOfOrder {
            reason: reason.into(),
        }
    }
}

/// Result type alias for memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;
