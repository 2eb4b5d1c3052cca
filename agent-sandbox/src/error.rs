use thiserror::Error;

/// Result alias for sandbox lifecycle operations.
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Errors raised while acquiring or releasing execution resources.
///
/// Failures of the executed code itself are not errors at this level; they
/// are reported through [`ExecutionResult`](agent_primitives::ExecutionResult).
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The backend configuration is unusable.
    #[error("invalid executor configuration: {reason}")]
    Configuration {
        /// Description of the problem.
        reason: String,
    },

    /// Starting the sandbox session failed.
    #[error("failed to launch sandbox session: {reason}")]
    Launch {
        /// Description of the failure.
        reason: String,
    },

    /// Tearing down the sandbox session failed.
    #[error("failed to shut down sandbox session `{session}`: {reason}")]
    Shutdown {
        /// Session identifier.
        session: String,
        /// Description of the failure.
        reason: String,
    },

    /// Underlying I/O failure.
    #[error("sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),
}
