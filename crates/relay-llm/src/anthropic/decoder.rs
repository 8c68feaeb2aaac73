use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use relay_core::errors::ProviderError;
use relay_core::ids::ToolCallId;
use relay_core::messages::{StopReason, TokenUsage, ToolCallBlock};
use relay_core::stream::ProviderEvent;

use crate::sse::{SseDecoder, SseEvent};

/// State machine turning Messages API stream events into [`ProviderEvent`]s.
#[derive(Default)]
pub struct AnthropicDecoder {
    tool_blocks: HashMap<usize, ToolBlock>,
    usage: TokenUsage,
    stop_reason: Option<StopReason>,
    saw_tool_call: bool,
    terminated: bool,
}

struct ToolBlock {
    id: String,
    name: String,
    arguments_json: String,
}

impl AnthropicDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&mut self, event_type: &str, data: &str) -> Vec<ProviderEvent> {
        let mut events = Vec::new();

        match event_type {
            "message_start" => {
                if let Ok(msg) = serde_json::from_str::<MessageStartEvent>(data) {
                    if let Some(usage) = msg.message.usage {
                        self.usage.input_tokens = usage.input_tokens.unwrap_or(0);
                        self.usage.output_tokens = usage.output_tokens.unwrap_or(0);
                    }
                }
            }

            "content_block_start" => {
                if let Ok(block) = serde_json::from_str::<ContentBlockStartEvent>(data) {
                    if block.content_block["type"] == "tool_use" {
                        let id = block.content_block["id"].as_str().unwrap_or("").to_string();
                        let name = block.content_block["name"].as_str().unwrap_or("").to_string();
                        let _ = self.tool_blocks.insert(
                            block.index,
                            ToolBlock {
                                id,
                                name,
                                arguments_json: String::new(),
                            },
                        );
                    }
                }
            }

            "content_block_delta" => {
                if let Ok(delta) = serde_json::from_str::<ContentBlockDeltaEvent>(data) {
                    match delta.delta["type"].as_str() {
                        Some("text_delta") => {
                            let text = delta.delta["text"].as_str().unwrap_or("");
                            if !text.is_empty() {
                                events.push(ProviderEvent::TextDelta(text.to_string()));
                            }
                        }
                        Some("thinking_delta") => {
                            let thinking = delta.delta["thinking"].as_str().unwrap_or("");
                            if !thinking.is_empty() {
                                events.push(ProviderEvent::ReasoningDelta(thinking.to_string()));
                            }
                        }
                        Some("input_json_delta") => {
                            let partial = delta.delta["partial_json"].as_str().unwrap_or("");
                            if let Some(block) = self.tool_blocks.get_mut(&delta.index) {
                                block.arguments_json.push_str(partial);
                            }
                        }
                        _ => {}
                    }
                }
            }

            "content_block_stop" => {
                if let Ok(stop) = serde_json::from_str::<ContentBlockStopEvent>(data) {
                    if let Some(block) = self.tool_blocks.remove(&stop.index) {
                        let arguments = parse_arguments(&block.arguments_json);
                        self.saw_tool_call = true;
                        events.push(ProviderEvent::ToolCall(ToolCallBlock {
                            id: ToolCallId::from_raw(block.id),
                            name: block.name,
                            arguments,
                        }));
                    }
                }
            }

            "message_delta" => {
                if let Ok(delta) = serde_json::from_str::<MessageDeltaEvent>(data) {
                    if let Some(usage) = delta.usage {
                        if let Some(out) = usage.output_tokens {
                            self.usage.output_tokens = out;
                        }
                    }
                    if let Some(reason) = delta.delta.and_then(|d| d.stop_reason) {
                        self.stop_reason = Some(map_stop_reason(&reason));
                    }
                }
            }

            "message_stop" => {
                self.terminated = true;
                let stop_reason = self.stop_reason.unwrap_or(if self.saw_tool_call {
                    StopReason::ToolUse
                } else {
                    StopReason::EndTurn
                });
                events.push(ProviderEvent::Usage(self.usage));
                events.push(ProviderEvent::Done { stop_reason });
            }

            "error" => {
                self.terminated = true;
                let error = match serde_json::from_str::<ErrorEvent>(data) {
                    Ok(err) => stream_error(&err.error.error_type, err.error.message),
                    Err(_) => ProviderError::InvalidResponse(format!("unparseable error event: {data}")),
                };
                events.push(ProviderEvent::Error(error));
            }

            _ => {} // ping
        }

        events
    }
}

impl SseDecoder for AnthropicDecoder {
    fn decode(&mut self, event: &SseEvent) -> Vec<ProviderEvent> {
        if self.terminated {
            return Vec::new();
        }
        match event.event_type.as_deref() {
            Some(kind) => self.handle(kind, &event.data),
            None => {
                // Some proxies drop the `event:` line; the type is also in the payload.
                let kind = serde_json::from_str::<Value>(&event.data)
                    .ok()
                    .and_then(|v| v["type"].as_str().map(String::from))
                    .unwrap_or_default();
                self.handle(&kind, &event.data)
            }
        }
    }

    fn finish(&mut self) -> Vec<ProviderEvent> {
        if self.terminated {
            return Vec::new();
        }
        self.terminated = true;
        vec![ProviderEvent::Error(ProviderError::StreamInterrupted(
            "stream ended before message_stop".into(),
        ))]
    }
}

fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
}

fn map_stop_reason(reason: &str) -> StopReason {
    match reason {
        "tool_use" => StopReason::ToolUse,
        "max_tokens" => StopReason::MaxTokens,
        "stop_sequence" => StopReason::StopSequence,
        _ => StopReason::EndTurn,
    }
}

/// In-stream errors carry only a type; give them the HTTP status the same
/// condition has when reported up front, so one classifier covers both.
fn stream_error(error_type: &str, message: String) -> ProviderError {
    let status = match error_type {
        "invalid_request_error" => 400,
        "authentication_error" => 401,
        "billing_error" => 402,
        "permission_error" => 403,
        "not_found_error" => 404,
        "rate_limit_error" => 429,
        "overloaded_error" => 529,
        _ => 500,
    };
    ProviderError::api(status, Some(error_type.to_string()), message)
}

// --- SSE event types ---

#[derive(Deserialize)]
struct MessageStartEvent {
    message: MessageStartPayload,
}

#[derive(Deserialize)]
struct MessageStartPayload {
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct UsagePayload {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ContentBlockStartEvent {
    index: usize,
    content_block: Value,
}

#[derive(Deserialize)]
struct ContentBlockDeltaEvent {
    index: usize,
    delta: Value,
}

#[derive(Deserialize)]
struct ContentBlockStopEvent {
    index: usize,
}

#[derive(Deserialize)]
struct MessageDeltaEvent {
    delta: Option<MessageDeltaPayload>,
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct MessageDeltaPayload {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEvent {
    error: ErrorPayload,
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

#[cfg(test)]
mod tests {
    use crate::sse::parse_sse_text;

    use super::*;

    fn decode_all(raw: &str) -> Vec<ProviderEvent> {
        let mut decoder = AnthropicDecoder::new();
        let mut out = Vec::new();
        for event in parse_sse_text(raw) {
            out.extend(decoder.decode(&event));
        }
        out.extend(decoder.finish());
        out
    }

    const TEXT_STREAM: &str = "\
event: message_start
data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":12,\"output_tokens\":1}}}

event: content_block_start
data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"thinking\",\"thinking\":\"\"}}

event: content_block_delta
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"thinking_delta\",\"thinking\":\"hmm\"}}

event: content_block_stop
data: {\"type\":\"content_block_stop\",\"index\":0}

event: content_block_start
data: {\"type\":\"content_block_start\",\"index\":1,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}

event: ping
data: {\"type\":\"ping\"}

event: content_block_delta
data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}

event: content_block_stop
data: {\"type\":\"content_block_stop\",\"index\":1}

event: message_delta
data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":7}}

event: message_stop
data: {\"type\":\"message_stop\"}

";

    #[test]
    fn text_and_thinking() {
        let events = decode_all(TEXT_STREAM);
        assert!(matches!(&events[0], ProviderEvent::ReasoningDelta(t) if t == "hmm"));
        assert!(matches!(&events[1], ProviderEvent::TextDelta(t) if t == "Hello"));
        assert!(matches!(
            events[2],
            ProviderEvent::Usage(TokenUsage { input_tokens: 12, output_tokens: 7 })
        ));
        assert!(matches!(
            events[3],
            ProviderEvent::Done { stop_reason: StopReason::EndTurn }
        ));
        assert_eq!(events.len(), 4);
    }

    #[test]
    fn tool_use_accumulates_json() {
        let raw = "\
event: content_block_start
data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"tool_use\",\"id\":\"toolu_9\",\"name\":\"exec\",\"input\":{}}}

event: content_block_delta
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"command\\\":\"}}

event: content_block_delta
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"\\\"ls\\\"}\"}}

event: content_block_stop
data: {\"type\":\"content_block_stop\",\"index\":0}

event: message_delta
data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"tool_use\"}}

event: message_stop
data: {\"type\":\"message_stop\"}

";
        let events = decode_all(raw);
        match &events[0] {
            ProviderEvent::ToolCall(tc) => {
                assert_eq!(tc.id.as_str(), "toolu_9");
                assert_eq!(tc.name, "exec");
                assert_eq!(tc.arguments["command"], "ls");
            }
            other => panic!("expected tool call, got {other:?}"),
        }
        assert!(matches!(
            events.last(),
            Some(ProviderEvent::Done { stop_reason: StopReason::ToolUse })
        ));
    }

    #[test]
    fn empty_tool_input_becomes_object() {
        let raw = "\
event: content_block_start
data: {\"type\":\"content_block_start\",\"index\":2,\"content_block\":{\"type\":\"tool_use\",\"id\":\"t\",\"name\":\"list_skills\",\"input\":{}}}

event: content_block_stop
data: {\"type\":\"content_block_stop\",\"index\":2}

event: message_stop
data: {\"type\":\"message_stop\"}

";
        let events = decode_all(raw);
        assert!(matches!(&events[0], ProviderEvent::ToolCall(tc) if tc.arguments.is_object()));
        assert!(matches!(
            events.last(),
            Some(ProviderEvent::Done { stop_reason: StopReason::ToolUse })
        ));
    }

    #[test]
    fn error_event_maps_status() {
        let raw = "event: error\ndata: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n";
        let events = decode_all(raw);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ProviderEvent::Error(err) => {
                assert_eq!(err.status(), Some(529));
                assert_eq!(err.code(), Some("overloaded_error"));
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn truncated_stream_reports_interruption() {
        let raw = "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n";
        let events = decode_all(raw);
        assert!(matches!(&events[0], ProviderEvent::TextDelta(_)));
        assert!(matches!(
            &events[1],
            ProviderEvent::Error(ProviderError::StreamInterrupted(_))
        ));
    }

    #[test]
    fn missing_event_line_uses_payload_type() {
        let raw = "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"x\"}}\n\ndata: {\"type\":\"message_stop\"}\n\n";
        let events = decode_all(raw);
        assert!(matches!(&events[0], ProviderEvent::TextDelta(t) if t == "x"));
        assert!(matches!(events.last(), Some(ProviderEvent::Done { .. })));
    }
}
