//! Shared model adapter traits and data structures.

use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use agent_primitives::{CapabilityDescriptor, TokenUsage, ToolCall};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Result alias used by model adapters.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Streaming response emitted by [`ModelAdapter::infer`].
pub type AdapterStream = Pin<Box<dyn Stream<Item = AdapterResult<InferenceChunk>> + Send>>;

/// Error type shared by adapter implementations.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Adapter is misconfigured or missing credentials.
    #[error("adapter not configured: {reason}")]
    Configuration {
        /// Additional context for the failure.
        reason: String,
    },

    /// The supplied request was invalid for the target model.
    #[error("invalid inference request: {reason}")]
    InvalidRequest {
        /// Reason describing why the request could not be processed.
        reason: String,
    },

    /// Transport-level failures (network, protocol, etc.).
    #[error("adapter transport error: {reason}")]
    Transport {
        /// Additional context about the error.
        reason: String,
    },

    /// The provider rejected the request due to rate limiting.
    #[error("adapter rate limited (retry after {retry_after:?})")]
    RateLimited {
        /// Suggested delay before retrying.
        retry_after: Option<Duration>,
    },

    /// The provider returned a malformed response.
    #[error("adapter response error: {reason}")]
    Response {
        /// Additional context about the response failure.
        reason: String,
    },
}

impl AdapterError {
    /// Convenience constructor for invalid requests.
    #[must_use]
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for configuration issues.
    #[must_use]
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for transport failures.
    #[must_use]
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for malformed responses.
    #[must_use]
    pub fn response(reason: impl Into<String>) -> Self {
        Self::Response {
            reason: reason.into(),
        }
    }
}

/// Minimal metadata describing a model adapter instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdapterMetadata {
    provider: &'static str,
    model: String,
}

impl AdapterMetadata {
    /// Creates metadata for the supplied provider and model identifier.
    #[must_use]
    pub fn new(provider: &'static str, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    /// Returns the provider identifier (e.g., "openai").
    #[must_use]
    pub const fn provider(&self) -> &'static str {
        self.provider
    }

    /// Returns the configured model name.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }
}

/// Roles supported in chat-style prompts.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System messages steer the assistant behaviour.
    System,
    /// User-authored content.
    User,
    /// Assistant (model) responses.
    Assistant,
    /// Observations returned to the loop.
    Tool,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        })
    }
}

/// Represents an instruction or message in a chat-style prompt.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct PromptMessage {
    role: MessageRole,
    content: String,
}

impl PromptMessage {
    /// Creates a new prompt message.
    #[must_use]
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Returns the message role.
    #[must_use]
    pub const fn role(&self) -> MessageRole {
        self.role
    }

    /// Returns the message content.
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }
}

/// Request submitted to a model adapter.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct InferenceRequest {
    messages: Vec<PromptMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    stop_sequences: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tools: Vec<CapabilityDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

impl InferenceRequest {
    /// Creates a request with the supplied messages.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::InvalidRequest`] if the message list is empty.
    pub fn new(messages: Vec<PromptMessage>) -> AdapterResult<Self> {
        if messages.is_empty() {
            return Err(AdapterError::invalid_request(
                "inference request requires at least one message",
            ));
        }

        Ok(Self {
            messages,
            stop_sequences: Vec::new(),
            response_format: None,
            tools: Vec::new(),
            max_output_tokens: None,
            temperature: None,
        })
    }

    /// Sequences at which generation should stop.
    #[must_use]
    pub fn with_stop_sequences<I, S>(mut self, stops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stop_sequences = stops.into_iter().map(Into::into).collect();
        self
    }

    /// JSON schema the response content must follow.
    #[must_use]
    pub fn with_response_format(mut self, schema: Value) -> Self {
        self.response_format = Some(schema);
        self
    }

    /// Declares the capabilities the model may call natively.
    #[must_use]
    pub fn with_tools(mut self, tools: Vec<CapabilityDescriptor>) -> Self {
        self.tools = tools;
        self
    }

    /// Sets the maximum output token budget.
    #[must_use]
    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = Some(tokens);
        self
    }

    /// Sets the sampling temperature.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Returns the prompt messages.
    #[must_use]
    pub fn messages(&self) -> &[PromptMessage] {
        &self.messages
    }

    /// Returns the stop sequences.
    #[must_use]
    pub fn stop_sequences(&self) -> &[String] {
        &self.stop_sequences
    }

    /// Returns the structured-output schema, if any.
    #[must_use]
    pub fn response_format(&self) -> Option<&Value> {
        self.response_format.as_ref()
    }

    /// Returns the declared tools.
    #[must_use]
    pub fn tools(&self) -> &[CapabilityDescriptor] {
        &self.tools
    }

    /// Returns the configured maximum output tokens.
    #[must_use]
    pub const fn max_output_tokens(&self) -> Option<u32> {
        self.max_output_tokens
    }

    /// Returns the configured sampling temperature.
    #[must_use]
    pub const fn temperature(&self) -> Option<f32> {
        self.temperature
    }
}

/// Streaming chunk returned by the adapter. Tool calls and usage arrive on
/// the final chunk.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct InferenceChunk {
    /// Partial content delta emitted by the provider.
    pub delta: String,
    /// Whether the generation is complete.
    pub done: bool,
    /// Native tool calls requested by the model.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Tokens consumed by the whole generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl InferenceChunk {
    /// Creates a new chunk.
    #[must_use]
    pub fn new(delta: impl Into<String>, done: bool) -> Self {
        Self {
            delta: delta.into(),
            done,
            tool_calls: Vec::new(),
            usage: None,
        }
    }

    /// Attaches native tool calls.
    #[must_use]
    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    /// Attaches token usage.
    #[must_use]
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Complete assistant message assembled from a stream.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelResponse {
    /// Concatenated content.
    pub content: String,
    /// Native tool calls.
    pub tool_calls: Vec<ToolCall>,
    /// Token usage, when the provider reports it.
    pub usage: Option<TokenUsage>,
}

impl ModelResponse {
    /// Drains `stream`, passing each non-empty delta to `on_delta`, and
    /// returns once a chunk marked `done` arrives or the stream ends.
    ///
    /// # Errors
    ///
    /// Propagates the first error yielded by the stream.
    pub async fn collect<F>(mut stream: AdapterStream, mut on_delta: F) -> AdapterResult<Self>
    where
        F: FnMut(&str) + Send,
    {
        let mut response = Self::default();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if !chunk.delta.is_empty() {
                on_delta(&chunk.delta);
                response.content.push_str(&chunk.delta);
            }
            response.tool_calls.extend(chunk.tool_calls);
            if let Some(usage) = chunk.usage {
                response.usage = Some(response.usage.unwrap_or_default() + usage);
            }
            if chunk.done {
                break;
            }
        }
        Ok(response)
    }
}

/// Trait implemented by all model adapters.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    /// Returns basic metadata describing the adapter instance.
    fn metadata(&self) -> &AdapterMetadata;

    /// Executes the inference request, returning a streaming response.
    async fn infer(&self, request: InferenceRequest) -> AdapterResult<AdapterStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::stream;
    use serde_json::json;

    #[test]
    fn validates_request_messages() {
        let err = InferenceRequest::new(Vec::new()).expect_err("messages required");
        assert!(matches!(err, AdapterError::InvalidRequest { .. }));
    }

    #[test]
    fn builds_request() {
        let request = InferenceRequest::new(vec![PromptMessage::new(MessageRole::User, "ping")])
            .unwrap()
            .with_stop_sequences(["<end_code>"])
            .with_response_format(json!({ "type": "object" }))
            .with_max_output_tokens(256)
            .with_temperature(0.7);

        assert_eq!(request.messages().len(), 1);
        assert_eq!(request.stop_sequences(), ["<end_code>"]);
        assert!(request.response_format().is_some());
        assert_eq!(request.max_output_tokens(), Some(256));
        assert_eq!(request.temperature(), Some(0.7));
        assert!(request.tools().is_empty());
    }

    #[tokio::test]
    async fn collects_stream_until_done() {
        let chunks = vec![
            Ok(InferenceChunk::new("Thought: ", false)),
            Ok(InferenceChunk::new("add", false)),
            Ok(InferenceChunk::new("", true)
                .with_tool_calls(vec![ToolCall::new("add", json!({ "a": 1 }))])
                .with_usage(TokenUsage::new(7, 2))),
            Ok(InferenceChunk::new("ignored", true)),
        ];
        let stream: AdapterStream = Box::pin(stream::iter(chunks));

        let mut deltas = Vec::new();
        let response = ModelResponse::collect(stream, |delta| deltas.push(delta.to_owned()))
            .await
            .unwrap();
        assert_eq!(response.content, "Thought: add");
        assert_eq!(deltas, ["Thought: ", "add"]);
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.usage, Some(TokenUsage::new(7, 2)));
    }

    #[tokio::test]
    async fn stream_errors_propagate() {
        let chunks = vec![
            Ok(InferenceChunk::new("partial", false)),
            Err(AdapterError::transport("connection reset")),
        ];
        let stream: AdapterStream = Box::pin(stream::iter(chunks));
        let err = ModelResponse::collect(stream, |_| {}).await.unwrap_err();
        assert!(matches!(err, AdapterError::Transport { .. }));
    }
}
