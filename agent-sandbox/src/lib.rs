//! Code execution backends for agents.
//!
//! An [`Executor`] runs one code block against a persistent
//! [`ExecutionState`] and always answers with an
//! [`ExecutionResult`](agent_primitives::ExecutionResult): either the block's
//! output or a classified error, never a hang past the configured timeout.
//! Two backends ship with the crate:
//!
//! - [`LocalExecutor`] interprets a restricted Python-flavoured language
//!   in-process. It denies imports outside an allow-list and bounds the work a
//!   block may perform, but it is **not a security boundary**.
//! - [`ProcessExecutor`] ships the code to a separate interpreter process
//!   (optionally inside a launched session such as a container) with a
//!   cleared environment and a private working directory.

#![warn(missing_docs, clippy::pedantic)]

mod error;
mod host;
pub mod local;
mod output;
pub mod process;
mod state;

use agent_primitives::ExecutionResult;
use async_trait::async_trait;

pub use error::{SandboxError, SandboxResult};
pub use host::{CallableHost, NoCallables};
pub use local::{LocalConfig, LocalExecutor};
pub use output::{DEFAULT_MAX_OUTPUT_BYTES, truncate_output};
pub use process::{CommandSpec, ProcessConfig, ProcessExecutor};
pub use state::ExecutionState;

/// Contract shared by every code execution backend.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Checks that `code` is syntactically acceptable without running it.
    ///
    /// Backends that cannot parse ahead of time accept everything.
    ///
    /// # Errors
    ///
    /// Returns a human-readable description of the syntax problem.
    fn check_syntax(&self, code: &str) -> Result<(), String> {
        let _ = code;
        Ok(())
    }

    /// Runs `code`, mutating `state` in place.
    ///
    /// Capabilities reachable from the code are resolved through `host`.
    /// Failures are reported inside the returned result, classified by
    /// [`ErrorKind`](agent_primitives::ErrorKind).
    async fn execute(
        &mut self,
        code: &str,
        state: &mut ExecutionState,
        host: &dyn CallableHost,
    ) -> ExecutionResult;

    /// Releases any external resource held by the backend.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError`] when the resource could not be released.
    async fn close(&mut self) -> SandboxResult<()> {
        Ok(())
    }
}
