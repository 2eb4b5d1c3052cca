//! Core shared types for the agent runtime.

#![warn(missing_docs, clippy::pedantic)]

mod action;
mod capability;
mod error;
mod ids;
mod outcome;
mod schema;
mod usage;

/// Model-produced actions.
pub use action::{Action, ActionMode, ToolCall};
/// Capability descriptors and supporting builders.
pub use capability::{
    CapabilityBuilder, CapabilityDescriptor, Parameter, SemanticType, first_duplicate,
    validate_identifier,
};
/// Error type and result alias shared across the SDK.
pub use error::{Error, Result};
/// Identifiers for agents and runs.
pub use ids::AgentId;
/// Execution results and the recoverable error taxonomy.
pub use outcome::{ErrorInfo, ErrorKind, ExecutionResult, render_value};
/// Schema validation of structured call arguments.
pub use schema::{SchemaViolation, coerce, validate_arguments};
/// Token accounting.
pub use usage::TokenUsage;
