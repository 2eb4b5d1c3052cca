//! Deterministic adapter replaying queued responses.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use agent_primitives::{TokenUsage, ToolCall};
use async_trait::async_trait;
use futures::stream;
use tracing::debug;

use crate::traits::{
    AdapterError, AdapterMetadata, AdapterResult, AdapterStream, InferenceChunk, InferenceRequest,
    ModelAdapter,
};

/// One queued reply of a [`ScriptedAdapter`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScriptedResponse {
    content: String,
    tool_calls: Vec<ToolCall>,
    usage: Option<TokenUsage>,
    delay: Option<Duration>,
    failure: Option<String>,
}

impl ScriptedResponse {
    /// Reply with plain content.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    /// Reply with content wrapped in a python code fence.
    #[must_use]
    pub fn code(source: &str) -> Self {
        Self::text(format!("Thought: running code.\n```py\n{source}\n```<end_code>"))
    }

    /// Reply with one native tool call.
    #[must_use]
    pub fn tool_call(call: ToolCall) -> Self {
        Self {
            tool_calls: vec![call],
            ..Self::default()
        }
    }

    /// Reply with a transport error.
    #[must_use]
    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            failure: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Reports token usage on the final chunk.
    #[must_use]
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Waits before replying.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Adapter that replays queued [`ScriptedResponse`]s in order and records
/// every request it receives.
#[derive(Debug)]
pub struct ScriptedAdapter {
    metadata: AdapterMetadata,
    responses: Mutex<VecDeque<ScriptedResponse>>,
    requests: Mutex<Vec<InferenceRequest>>,
    chunk_chars: Option<usize>,
}

impl ScriptedAdapter {
    /// Creates an adapter replaying `responses`.
    #[must_use]
    pub fn new<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = ScriptedResponse>,
    {
        Self {
            metadata: AdapterMetadata::new("scripted", "replay"),
            responses: Mutex::new(responses.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            chunk_chars: None,
        }
    }

    /// Streams content in deltas of at most `chars` characters.
    #[must_use]
    pub fn with_chunk_chars(mut self, chars: usize) -> Self {
        self.chunk_chars = Some(chars.max(1));
        self
    }

    /// Queues another response.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn push(&self, response: ScriptedResponse) {
        self.responses
            .lock()
            .expect("scripted responses poisoned")
            .push_back(response);
    }

    /// Requests received so far, oldest first.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn requests(&self) -> Vec<InferenceRequest> {
        self.requests
            .lock()
            .expect("scripted requests poisoned")
            .clone()
    }

    /// Number of responses not yet consumed.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.responses
            .lock()
            .expect("scripted responses poisoned")
            .len()
    }

    fn chunks(&self, response: ScriptedResponse) -> Vec<AdapterResult<InferenceChunk>> {
        let chars: Vec<char> = response.content.chars().collect();
        let mut deltas: Vec<String> = match self.chunk_chars {
            Some(size) => chars.chunks(size).map(|chunk| chunk.iter().collect()).collect(),
            None => vec![response.content],
        };
        let last = deltas.pop().unwrap_or_default();
        let mut chunks: Vec<_> = deltas
            .into_iter()
            .map(|delta| Ok(InferenceChunk::new(delta, false)))
            .collect();
        let mut done = InferenceChunk::new(last, true).with_tool_calls(response.tool_calls);
        done.usage = response.usage;
        chunks.push(Ok(done));
        chunks
    }
}

#[async_trait]
impl ModelAdapter for ScriptedAdapter {
    fn metadata(&self) -> &AdapterMetadata {
        &self.metadata
    }

    async fn infer(&self, request: InferenceRequest) -> AdapterResult<AdapterStream> {
        self.requests
            .lock()
            .map_err(|_| AdapterError::response("scripted requests poisoned"))?
            .push(request);
        let next = self
            .responses
            .lock()
            .map_err(|_| AdapterError::response("scripted responses poisoned"))?
            .pop_front()
            .ok_or_else(|| AdapterError::response("script exhausted"))?;

        if let Some(delay) = next.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = next.failure {
            return Err(AdapterError::transport(reason));
        }
        debug!(remaining = self.remaining(), "replaying scripted response");
        Ok(Box::pin(stream::iter(self.chunks(next))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::traits::{MessageRole, ModelResponse, PromptMessage};

    fn request() -> InferenceRequest {
        InferenceRequest::new(vec![PromptMessage::new(MessageRole::User, "go")]).unwrap()
    }

    #[tokio::test]
    async fn replays_in_order_and_records_requests() {
        let adapter = ScriptedAdapter::new([
            ScriptedResponse::text("first").with_usage(TokenUsage::new(3, 1)),
            ScriptedResponse::tool_call(ToolCall::new("final_answer", json!({ "answer": 4 }))),
        ]);

        let first = ModelResponse::collect(adapter.infer(request()).await.unwrap(), |_| {})
            .await
            .unwrap();
        assert_eq!(first.content, "first");
        assert_eq!(first.usage, Some(TokenUsage::new(3, 1)));

        let second = ModelResponse::collect(adapter.infer(request()).await.unwrap(), |_| {})
            .await
            .unwrap();
        assert_eq!(second.tool_calls[0].name(), "final_answer");

        assert_eq!(adapter.requests().len(), 2);
        assert!(matches!(
            adapter.infer(request()).await,
            Err(AdapterError::Response { .. })
        ));
    }

    #[tokio::test]
    async fn streams_in_chunks() {
        let adapter = ScriptedAdapter::new([ScriptedResponse::text("abcdefg")]).with_chunk_chars(3);
        let mut deltas = Vec::new();
        let response = ModelResponse::collect(adapter.infer(request()).await.unwrap(), |delta| {
            deltas.push(delta.to_owned());
        })
        .await
        .unwrap();
        assert_eq!(deltas, ["abc", "def", "g"]);
        assert_eq!(response.content, "abcdefg");
    }

    #[tokio::test]
    async fn failures_surface_as_transport_errors() {
        let adapter = ScriptedAdapter::new([ScriptedResponse::failure("overloaded")]);
        let err = adapter.infer(request()).await.err().unwrap();
        assert!(matches!(err, AdapterError::Transport { reason } if reason == "overloaded"));
    }
}
