//! Step loop and orchestration for agents.
//!
//! An [`Agent`] drives a reason-act-observe loop: the conversation projected
//! from its [`MemoryLog`](agent_memory::MemoryLog) goes to the model, the
//! action parsed from the answer goes through the [`Dispatcher`] to a tool,
//! a managed agent or the code executor, and the outcome is recorded as the
//! next observation. Recoverable errors are fed back to the model; only
//! infrastructure failures end a run early.
//!
//! [`ManagedAgent`] wraps a configured agent as a capability of another
//! agent. Each managed agent keeps its own memory log and executor.

#![warn(missing_docs, clippy::pedantic)]

mod agent;
mod delegation;
mod dispatch;
mod error;
mod lifecycle;
mod options;
pub mod parse;

pub use agent::{Agent, AgentBuilder, FinalAnswerCheck};
pub use delegation::ManagedAgent;
pub use dispatch::Dispatcher;
pub use error::{AgentError, AgentResult};
pub use lifecycle::{Lifecycle, LifecycleError, LifecycleResult, LoopEvent, LoopState};
pub use options::{RunOptions, RunOutput, RunResult, RunState};
