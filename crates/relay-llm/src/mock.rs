use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use serde_json::Value;

use relay_core::errors::ProviderError;
use relay_core::ids::ToolCallId;
use relay_core::messages::{StopReason, TokenUsage, ToolCallBlock};
use relay_core::provider::{
    LlmProvider, ModelRequest, ProviderCapabilities, ProviderKind, ProviderStream,
};
use relay_core::stream::ProviderEvent;

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yield a sequence of provider events.
    Stream(Vec<ProviderEvent>),
    /// Fail the `stream()` call itself, before any output.
    Error(ProviderError),
    /// Wait a duration, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// A plain text answer, delivered in one delta.
    pub fn text(text: &str) -> Self {
        Self::text_chunks(&[text])
    }

    /// A text answer split into the given deltas.
    pub fn text_chunks(chunks: &[&str]) -> Self {
        let mut events: Vec<ProviderEvent> = chunks
            .iter()
            .map(|c| ProviderEvent::TextDelta((*c).to_string()))
            .collect();
        events.push(ProviderEvent::Usage(TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
        }));
        events.push(ProviderEvent::Done {
            stop_reason: StopReason::EndTurn,
        });
        Self::Stream(events)
    }

    /// A single tool call with a fresh id.
    pub fn tool_call(name: &str, arguments: Value) -> Self {
        Self::tool_calls(vec![(name, arguments)])
    }

    pub fn tool_calls(calls: Vec<(&str, Value)>) -> Self {
        let mut events: Vec<ProviderEvent> = calls
            .into_iter()
            .map(|(name, arguments)| {
                ProviderEvent::ToolCall(ToolCallBlock {
                    id: ToolCallId::new(),
                    name: name.to_string(),
                    arguments,
                })
            })
            .collect();
        events.push(ProviderEvent::Done {
            stop_reason: StopReason::ToolUse,
        });
        Self::Stream(events)
    }

    /// Some text, then a failure after the stream opened.
    pub fn stream_error(partial_text: &str, error: ProviderError) -> Self {
        let mut events = Vec::new();
        if !partial_text.is_empty() {
            events.push(ProviderEvent::TextDelta(partial_text.to_string()));
        }
        events.push(ProviderEvent::Error(error));
        Self::Stream(events)
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock provider that returns pre-programmed responses in sequence.
pub struct MockProvider {
    name: String,
    kind: ProviderKind,
    model: String,
    capabilities: ProviderCapabilities,
    responses: Vec<MockResponse>,
    repeat_last: bool,
    call_count: AtomicUsize,
    requests: Mutex<Vec<ModelRequest>>,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            name: "mock".into(),
            kind: ProviderKind::Generic,
            model: "mock-model".into(),
            capabilities: ProviderCapabilities::default(),
            responses,
            repeat_last: false,
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_kind(mut self, kind: ProviderKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: ProviderCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Keep answering with the last scripted response once the script runs out.
    pub fn repeating(mut self) -> Self {
        self.repeat_last = true;
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Every request received so far, in call order.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities
    }

    async fn stream(&self, request: &ModelRequest) -> Result<ProviderStream, ProviderError> {
        self.requests.lock().push(request.clone());
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);

        let response = match self.responses.get(idx) {
            Some(r) => r.clone(),
            None if self.repeat_last && !self.responses.is_empty() => {
                self.responses[self.responses.len() - 1].clone()
            }
            None => {
                return Err(ProviderError::InvalidResponse(format!(
                    "MockProvider: no response configured for call {idx}"
                )))
            }
        };

        resolve_response(response).await
    }
}

/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_response(response: MockResponse) -> Result<ProviderStream, ProviderError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Stream(events) => return Ok(Box::pin(stream::iter(events))),
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}
