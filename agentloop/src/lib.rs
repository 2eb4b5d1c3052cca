//! Agent execution runtime.
//!
//! Depend on this crate via `cargo add agentloop`. It bundles the runtime
//! crates behind feature flags; `kernel` pulls in everything the step loop
//! needs.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use agentloop::prelude::*;
//!
//! # async fn demo() -> Result<(), AgentError> {
//! let model = Arc::new(ScriptedAdapter::new([ScriptedResponse::code("final_answer(2 + 2)")]));
//! let mut agent = Agent::builder("calculator", model).build()?;
//! let answer = agent.run("What is 2+2?").await?;
//! assert_eq!(answer, 4);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs, clippy::pedantic)]

/// Re-export shared primitives for convenience.
pub use agent_primitives as primitives;

/// Step loop, dispatch and delegation (enabled by `kernel` feature).
#[cfg(feature = "kernel")]
pub use agent_kernel as kernel;

/// Model adapter contract (enabled by `adapters` feature).
#[cfg(feature = "adapters")]
pub use agent_adapters as adapters;

/// Tool registration (enabled by `tools` feature).
#[cfg(feature = "tools")]
pub use agent_tools as tools;

/// Code execution backends (enabled by `sandbox` feature).
#[cfg(feature = "sandbox")]
pub use agent_sandbox as sandbox;

/// Memory log and step observers (enabled by `memory` feature).
#[cfg(feature = "memory")]
pub use agent_memory as memory;

/// Tracing setup and metrics (enabled by `telemetry` feature).
#[cfg(feature = "telemetry")]
pub use agent_telemetry as telemetry;

/// Prompt templates (enabled by `prompts` feature).
#[cfg(feature = "prompts")]
pub use agent_prompts as prompts;

/// TOML settings (enabled by `config` feature).
#[cfg(feature = "config")]
pub use agent_config as config;

/// Types most agents need.
#[cfg(feature = "kernel")]
pub mod prelude {
    pub use agent_adapters::{ModelAdapter, ScriptedAdapter, ScriptedResponse};
    pub use agent_kernel::{
        Agent, AgentBuilder, AgentError, AgentResult, ManagedAgent, RunOptions, RunOutput,
        RunResult, RunState,
    };
    pub use agent_memory::{MemoryLog, RecordKind, StepObserver, StepRecord};
    pub use agent_primitives::{
        Action, ActionMode, CapabilityDescriptor, ErrorInfo, ErrorKind, ExecutionResult,
        Parameter, SemanticType, ToolCall,
    };
    pub use agent_sandbox::{LocalConfig, LocalExecutor, ProcessConfig, ProcessExecutor};
    pub use agent_tools::{Tool, ToolError, ToolRegistry, ToolResult};
}
