//! Model adapters used by agents.
//!
//! [`traits`] defines the collaborator contract every model backend
//! implements: a chat-style [`InferenceRequest`](traits::InferenceRequest)
//! answered by a stream of [`InferenceChunk`](traits::InferenceChunk)s.
//! [`scripted`] provides a deterministic adapter for tests and replays.

#![warn(missing_docs, clippy::pedantic)]

pub mod scripted;
pub mod traits;

pub use scripted::{ScriptedAdapter, ScriptedResponse};
pub use traits::{
    AdapterError, AdapterMetadata, AdapterResult, AdapterStream, InferenceChunk,
    InferenceRequest, MessageRole, ModelAdapter, ModelResponse, PromptMessage,
};
