use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use relay_core::errors::ProviderError;
use relay_core::ids::ToolCallId;
use relay_core::messages::{StopReason, TokenUsage, ToolCallBlock};
use relay_core::stream::ProviderEvent;

use crate::classify::parse_api_error;
use crate::sse::{SseDecoder, SseEvent};

/// Decodes chat-completions stream chunks.
///
/// Tool-call fragments are accumulated by index and released once the choice
/// reports a finish reason. `[DONE]` ends the stream; some compatible servers
/// omit it, so a finish reason followed by EOF also counts as completion.
#[derive(Default)]
pub struct OpenAiDecoder {
    tool_calls: ToolCallAccumulator,
    usage: Option<TokenUsage>,
    stop_reason: Option<StopReason>,
    terminated: bool,
}

impl OpenAiDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn complete(&mut self) -> Vec<ProviderEvent> {
        self.terminated = true;
        let mut events = self.tool_calls.drain();
        if !events.is_empty() && self.stop_reason.is_none() {
            self.stop_reason = Some(StopReason::ToolUse);
        }
        if let Some(usage) = self.usage {
            events.push(ProviderEvent::Usage(usage));
        }
        events.push(ProviderEvent::Done {
            stop_reason: self.stop_reason.unwrap_or(StopReason::EndTurn),
        });
        events
    }

    fn apply_chunk(&mut self, chunk: StreamChunk) -> Vec<ProviderEvent> {
        let mut events = Vec::new();

        if let Some(usage) = chunk.usage {
            self.usage = Some(TokenUsage {
                input_tokens: usage.prompt_tokens.unwrap_or(0),
                output_tokens: usage.completion_tokens.unwrap_or(0),
            });
        }

        for choice in chunk.choices {
            if let Some(reasoning) = choice
                .delta
                .reasoning
                .or(choice.delta.reasoning_content)
                .filter(|r| !r.is_empty())
            {
                events.push(ProviderEvent::ReasoningDelta(reasoning));
            }
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                events.push(ProviderEvent::TextDelta(content));
            }
            for tool_call in choice.delta.tool_calls {
                let function = tool_call.function.unwrap_or_default();
                self.tool_calls.merge(tool_call.index, tool_call.id, function);
            }
            if let Some(reason) = choice.finish_reason.filter(|r| !r.is_empty()) {
                self.stop_reason = Some(map_finish_reason(&reason));
                events.extend(self.tool_calls.drain());
            }
        }

        events
    }
}

impl SseDecoder for OpenAiDecoder {
    fn decode(&mut self, event: &SseEvent) -> Vec<ProviderEvent> {
        if self.terminated {
            return Vec::new();
        }
        let payload = event.data.trim();
        if payload.is_empty() {
            return Vec::new();
        }
        if payload == "[DONE]" {
            return self.complete();
        }

        let value: Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(e) => {
                self.terminated = true;
                return vec![ProviderEvent::Error(ProviderError::InvalidResponse(format!(
                    "failed to parse stream payload: {e}"
                )))];
            }
        };

        if value.get("error").is_some() {
            self.terminated = true;
            let info = parse_api_error(payload, 500);
            let status = match info.code.as_deref() {
                Some("insufficient_quota" | "rate_limit_exceeded") => 429,
                Some("invalid_api_key") => 401,
                _ => 500,
            };
            return vec![ProviderEvent::Error(ProviderError::Api {
                status,
                code: info.code,
                message: info.message,
            })];
        }

        match serde_json::from_value::<StreamChunk>(value) {
            Ok(chunk) => self.apply_chunk(chunk),
            Err(e) => {
                self.terminated = true;
                vec![ProviderEvent::Error(ProviderError::InvalidResponse(format!(
                    "unexpected stream chunk: {e}"
                )))]
            }
        }
    }

    fn finish(&mut self) -> Vec<ProviderEvent> {
        if self.terminated {
            return Vec::new();
        }
        if self.stop_reason.is_some() {
            return self.complete();
        }
        self.terminated = true;
        vec![ProviderEvent::Error(ProviderError::StreamInterrupted(
            "stream ended before a finish reason".into(),
        ))]
    }
}

fn map_finish_reason(reason: &str) -> StopReason {
    match reason {
        "tool_calls" | "function_call" => StopReason::ToolUse,
        "length" => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    }
}

#[derive(Default)]
struct ToolCallAccumulator {
    by_index: BTreeMap<usize, ToolCallEntry>,
}

#[derive(Default)]
struct ToolCallEntry {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

impl ToolCallAccumulator {
    fn merge(&mut self, index: usize, id: Option<String>, function: FunctionDelta) {
        let entry = self.by_index.entry(index).or_default();
        if let Some(id) = id.filter(|s| !s.is_empty()) {
            entry.id = Some(id);
        }
        if let Some(name) = function.name.filter(|s| !s.is_empty()) {
            entry.name = Some(name);
        }
        if let Some(args) = function.arguments {
            entry.arguments.push_str(&args);
        }
    }

    fn drain(&mut self) -> Vec<ProviderEvent> {
        std::mem::take(&mut self.by_index)
            .into_values()
            .filter_map(|entry| {
                let name = entry.name?;
                let arguments = if entry.arguments.trim().is_empty() {
                    Value::Object(serde_json::Map::new())
                } else {
                    serde_json::from_str(&entry.arguments)
                        .unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
                };
                let id = entry.id.map(ToolCallId::from_raw).unwrap_or_default();
                Some(ProviderEvent::ToolCall(ToolCallBlock {
                    id,
                    name,
                    arguments,
                }))
            })
            .collect()
    }
}

// --- Stream chunk types ---

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Deserialize, Default)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct UsagePayload {
    #[serde(default)]
    prompt_tokens: Option<u32>,
    #[serde(default)]
    completion_tokens: Option<u32>,
}

#[cfg(test)]
mod tests {
    use crate::sse::parse_sse_text;

    use super::*;

    fn decode_all(raw: &str) -> Vec<ProviderEvent> {
        let mut decoder = OpenAiDecoder::new();
        let mut out = Vec::new();
        for event in parse_sse_text(raw) {
            out.extend(decoder.decode(&event));
        }
        out.extend(decoder.finish());
        out
    }

    #[test]
    fn text_with_usage_and_done() {
        let raw = "\
data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"\"}}]}

data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}

data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}

data: {\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2}}

data: [DONE]

";
        let events = decode_all(raw);
        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], ProviderEvent::TextDelta(t) if t == "Hel"));
        assert!(matches!(&events[1], ProviderEvent::TextDelta(t) if t == "lo"));
        assert!(matches!(
            events[2],
            ProviderEvent::Usage(TokenUsage { input_tokens: 5, output_tokens: 2 })
        ));
        assert!(matches!(
            events[3],
            ProviderEvent::Done { stop_reason: StopReason::EndTurn }
        ));
    }

    #[test]
    fn tool_call_fragments_merge_by_index() {
        let raw = "\
data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"exec\",\"arguments\":\"\"}}]}}]}

data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"command\\\":\"}}]}}]}

data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":1,\"id\":\"call_2\",\"function\":{\"name\":\"files\",\"arguments\":\"{}\"}}]}}]}

data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\"ls\\\"}\"}}]}}]}

data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}

data: [DONE]

";
        let events = decode_all(raw);
        let calls: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ProviderEvent::ToolCall(tc) => Some(tc),
                _ => None,
            })
            .collect();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id.as_str(), "call_1");
        assert_eq!(calls[0].arguments["command"], "ls");
        assert_eq!(calls[1].name, "files");
        assert!(matches!(
            events.last(),
            Some(ProviderEvent::Done { stop_reason: StopReason::ToolUse })
        ));
    }

    #[test]
    fn reasoning_channel_passthrough() {
        let raw = "data: {\"choices\":[{\"delta\":{\"reasoning\":\"step 1\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"ok\"},\"finish_reason\":\"stop\"}]}\n\n";
        let events = decode_all(raw);
        assert!(matches!(&events[0], ProviderEvent::ReasoningDelta(t) if t == "step 1"));
        assert!(matches!(&events[1], ProviderEvent::TextDelta(t) if t == "ok"));
        // No [DONE], but a finish reason was seen.
        assert!(matches!(events.last(), Some(ProviderEvent::Done { .. })));
    }

    #[test]
    fn error_payload_mid_stream() {
        let raw = "data: {\"error\":{\"message\":\"quota\",\"type\":\"insufficient_quota\",\"code\":\"insufficient_quota\"}}\n\n";
        let events = decode_all(raw);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ProviderEvent::Error(err) => {
                assert_eq!(err.code(), Some("insufficient_quota"));
                assert_eq!(err.status(), Some(429));
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn eof_without_finish_is_interruption() {
        let events = decode_all("data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n");
        assert!(matches!(
            events.last(),
            Some(ProviderEvent::Error(ProviderError::StreamInterrupted(_)))
        ));
    }

    #[test]
    fn garbage_payload_is_invalid_response() {
        let events = decode_all("data: not json\n\n");
        assert!(matches!(
            &events[0],
            ProviderEvent::Error(ProviderError::InvalidResponse(_))
        ));
        assert_eq!(events.len(), 1);
    }
}
