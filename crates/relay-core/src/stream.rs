use serde::{Deserialize, Serialize};

use crate::errors::ProviderError;
use crate::messages::{StopReason, TokenUsage, ToolCallBlock};

/// Canonical streaming events handed to callers. Ordering contract per attempt:
///
/// MessageStart → (TextStart → TextDelta* → TextEnd | ReasoningDelta)* → MessageEnd
///
/// Every event names the provider that produced it, so a consumer can tell a
/// failed attempt on one provider apart from the next provider's stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart { provider: String },
    TextStart { provider: String },
    TextDelta { provider: String, text: String },
    TextEnd { provider: String },
    ReasoningDelta { provider: String, text: String },
    MessageEnd { provider: String, outcome: MessageOutcome },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageOutcome {
    Completed,
    Failed,
}

impl StreamEvent {
    pub fn provider(&self) -> &str {
        match self {
            Self::MessageStart { provider }
            | Self::TextStart { provider }
            | Self::TextDelta { provider, .. }
            | Self::TextEnd { provider }
            | Self::ReasoningDelta { provider, .. }
            | Self::MessageEnd { provider, .. } => provider,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::MessageStart { .. } => "message_start",
            Self::TextStart { .. } => "text_start",
            Self::TextDelta { .. } => "text_delta",
            Self::TextEnd { .. } => "text_end",
            Self::ReasoningDelta { .. } => "reasoning_delta",
            Self::MessageEnd { .. } => "message_end",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::MessageEnd { .. })
    }
}

/// Wire-level output of a provider adapter, before normalization.
#[derive(Clone, Debug)]
pub enum ProviderEvent {
    TextDelta(String),
    /// Reasoning the backend reports natively (outside any tag in the text).
    ReasoningDelta(String),
    ToolCall(ToolCallBlock),
    Usage(TokenUsage),
    Done { stop_reason: StopReason },
    Error(ProviderError),
}

/// Destination for canonical events produced during a turn.
pub trait StreamSink: Send + Sync {
    fn emit(&self, event: StreamEvent);
}

/// Sink that drops everything; used for blocking calls.
pub struct NullSink;

impl StreamSink for NullSink {
    fn emit(&self, _event: StreamEvent) {}
}

impl<F> StreamSink for F
where
    F: Fn(StreamEvent) + Send + Sync,
{
    fn emit(&self, event: StreamEvent) {
        self(event)
    }
}

/// Concatenation of the `text_delta` payloads in an event sequence.
pub fn visible_text(events: &[StreamEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::TextDelta { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let ev = StreamEvent::TextDelta {
            provider: "anthropic".into(),
            text: "hi".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "text_delta");
        assert_eq!(json["provider"], "anthropic");
        assert_eq!(json["text"], "hi");

        let end = StreamEvent::MessageEnd {
            provider: "openai".into(),
            outcome: MessageOutcome::Failed,
        };
        let json = serde_json::to_value(&end).unwrap();
        assert_eq!(json["type"], "message_end");
        assert_eq!(json["outcome"], "failed");
    }

    #[test]
    fn kind_matches_serde_tag() {
        let ev = StreamEvent::ReasoningDelta {
            provider: "p".into(),
            text: "t".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], ev.kind());
        assert_eq!(ev.provider(), "p");
        assert!(!ev.is_terminal());
    }

    #[test]
    fn closure_sink_collects() {
        let seen = Mutex::new(Vec::new());
        let sink = |e: StreamEvent| seen.lock().unwrap().push(e);
        sink.emit(StreamEvent::MessageStart { provider: "a".into() });
        sink.emit(StreamEvent::TextDelta { provider: "a".into(), text: "x".into() });
        sink.emit(StreamEvent::TextDelta { provider: "a".into(), text: "y".into() });
        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(visible_text(&events), "xy");
    }
}
