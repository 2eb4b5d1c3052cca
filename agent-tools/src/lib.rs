//! Tool registration and invocation.
//!
//! A [`registry::ToolRegistry`] is the capability set of one agent: every
//! entry pairs a [`agent_primitives::CapabilityDescriptor`] with the callable
//! that implements it. Names are unique within a registry.

#![warn(missing_docs, clippy::pedantic)]

pub mod builtin;
pub mod registry;

pub use builtin::{FINAL_ANSWER, final_answer_descriptor};
pub use registry::{Tool, ToolError, ToolFuture, ToolHandle, ToolRegistry, ToolResult};
