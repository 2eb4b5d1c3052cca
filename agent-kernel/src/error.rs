//! Run-level errors.

use agent_adapters::AdapterError;
use agent_config::ConfigError;
use agent_memory::MemoryError;
use agent_primitives::ErrorInfo;
use agent_prompts::TemplateError;
use agent_sandbox::SandboxError;
use agent_tools::ToolError;
use thiserror::Error;

use crate::lifecycle::LifecycleError;

/// Result alias used by the kernel.
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors surfaced to the caller of an agent.
///
/// Recoverable problems inside a run never appear here: they are fed back to
/// the model as observations. These are configuration mistakes and failures
/// that end a run.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The agent was configured inconsistently.
    #[error("invalid agent configuration: {reason}")]
    Configuration {
        /// Description of the problem.
        reason: String,
    },

    /// A managed agent (transitively) manages the agent being configured.
    #[error("delegation cycle: {}", path.join(" -> "))]
    DelegationCycle {
        /// Agent names along the cycle, starting and ending at the same agent.
        path: Vec<String>,
    },

    /// Two capabilities share a name.
    #[error("capability `{name}` is defined more than once")]
    DuplicateCapability {
        /// Offending name.
        name: String,
    },

    /// The run ended on an unrecoverable error.
    #[error("run failed: {error}")]
    RunFailed {
        /// Error that ended the run.
        error: ErrorInfo,
    },

    /// The step loop was driven out of order.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// The memory log rejected an operation.
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// The model adapter failed.
    #[error(transparent)]
    Model(#[from] AdapterError),

    /// A prompt template could not be rendered.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// The executor could not be built or released.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// A tool could not be registered.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// Settings were rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A capability descriptor was invalid.
    #[error(transparent)]
    Descriptor(#[from] agent_primitives::Error),
}

impl AgentError {
    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }
}
