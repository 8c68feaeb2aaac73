//! OpenAI-compatible chat-completions adapter.

pub mod decoder;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::instrument;

use relay_core::errors::ProviderError;
use relay_core::messages::{AssistantContent, Message, UserContent};
use relay_core::provider::{
    LlmProvider, ModelRequest, ProviderCapabilities, ProviderKind, ProviderStream,
};

use crate::anthropic::{http_client, missing_key_error};
use crate::classify::api_error_from_body;
use crate::sse::SseStream;

pub use decoder::OpenAiDecoder;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiCompatibleProvider {
    client: Client,
    name: String,
    model: String,
    base_url: String,
    api_key: Option<SecretString>,
    capabilities: ProviderCapabilities,
}

impl OpenAiCompatibleProvider {
    pub fn new(
        name: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<SecretString>,
        capabilities: ProviderCapabilities,
    ) -> Self {
        Self {
            client: http_client(),
            name: name.into(),
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key,
            capabilities,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenaiCompatible
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities
    }

    #[instrument(skip(self, request), fields(provider = %self.name, model = %self.model))]
    async fn stream(&self, request: &ModelRequest) -> Result<ProviderStream, ProviderError> {
        let Some(key) = self.api_key.as_ref() else {
            return Err(missing_key_error(&self.name));
        };
        let model = request.model_override.as_deref().unwrap_or(&self.model);
        let body = build_request_body(request, model, self.capabilities.thinking);

        let resp = self
            .client
            .post(self.chat_completions_url())
            .bearer_auth(key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(api_error_from_body(status, &body));
        }

        Ok(Box::pin(SseStream::new(
            resp.bytes_stream(),
            OpenAiDecoder::new(),
        )))
    }
}

/// Build a streaming chat-completions request body.
pub fn build_request_body(request: &ModelRequest, model: &str, thinking_supported: bool) -> Value {
    let mut messages = Vec::new();
    if let Some(system) = request.system_prompt.as_deref().filter(|s| !s.is_empty()) {
        messages.push(json!({"role": "system", "content": system}));
    }
    for msg in &request.messages {
        messages.extend(convert_message(msg));
    }

    let mut body = json!({
        "model": model,
        "stream": true,
        "stream_options": {"include_usage": true},
        "messages": messages,
    });
    if let Some(max) = request.max_tokens {
        body["max_tokens"] = json!(max);
    }
    if thinking_supported {
        let effort = match request.thinking {
            relay_core::provider::ThinkingLevel::Off => None,
            relay_core::provider::ThinkingLevel::Low => Some("low"),
            relay_core::provider::ThinkingLevel::Medium => Some("medium"),
            relay_core::provider::ThinkingLevel::High => Some("high"),
        };
        if let Some(effort) = effort {
            body["reasoning_effort"] = json!(effort);
        }
    }
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters_schema,
                    }
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }
    body
}

fn convert_message(msg: &Message) -> Option<Value> {
    match msg {
        Message::User(user) => {
            let has_image = user
                .content
                .iter()
                .any(|c| matches!(c, UserContent::Image { .. }));
            if !has_image {
                return Some(json!({"role": "user", "content": user.text_content()}));
            }
            let parts: Vec<Value> = user
                .content
                .iter()
                .map(|c| match c {
                    UserContent::Text { text } => json!({"type": "text", "text": text}),
                    UserContent::Image { mime_type, data } => json!({
                        "type": "image_url",
                        "image_url": {"url": format!("data:{mime_type};base64,{data}")}
                    }),
                })
                .collect();
            Some(json!({"role": "user", "content": parts}))
        }
        Message::Assistant(asst) => {
            let text = asst.text_content();
            let tool_calls: Vec<Value> = asst
                .content
                .iter()
                .filter_map(|c| match c {
                    AssistantContent::ToolCall(tc) => Some(json!({
                        "id": tc.id.as_str(),
                        "type": "function",
                        "function": {
                            "name": tc.name,
                            "arguments": tc.arguments.to_string(),
                        }
                    })),
                    _ => None,
                })
                .collect();
            if text.is_empty() && tool_calls.is_empty() {
                return None;
            }
            let mut out = json!({"role": "assistant"});
            out["content"] = if text.is_empty() { Value::Null } else { json!(text) };
            if !tool_calls.is_empty() {
                out["tool_calls"] = json!(tool_calls);
            }
            Some(out)
        }
        Message::ToolResult(tr) => Some(json!({
            "role": "tool",
            "tool_call_id": tr.tool_call_id.as_str(),
            "content": tr.content,
        })),
        Message::Notice(n) => Some(json!({
            "role": "user",
            "content": format!("[{}] {}", n.source, n.text),
        })),
    }
}

#[cfg(test)]
mod tests {
    use relay_core::ids::ToolCallId;
    use relay_core::messages::{AssistantMessage, ToolCallBlock};
    use relay_core::provider::ThinkingLevel;

    use super::*;

    #[test]
    fn request_shape() {
        let id = ToolCallId::from_raw("call_1");
        let mut asst = AssistantMessage::default();
        asst.content.push(AssistantContent::ToolCall(ToolCallBlock {
            id: id.clone(),
            name: "exec".into(),
            arguments: json!({"command": "ls"}),
        }));
        let req = ModelRequest {
            system_prompt: Some("sys".into()),
            messages: vec![
                Message::user_text("hi"),
                Message::Assistant(asst),
                Message::tool_result(id, "exec", "a.txt", false),
            ],
            thinking: ThinkingLevel::High,
            ..Default::default()
        };
        let body = build_request_body(&req, "gpt-4o", false);
        let msgs = body["messages"].as_array().unwrap();
        assert_eq!(msgs[0]["role"], "system");
        assert_eq!(msgs[1]["content"], "hi");
        assert!(msgs[2]["content"].is_null());
        assert_eq!(msgs[2]["tool_calls"][0]["function"]["arguments"], r#"{"command":"ls"}"#);
        assert_eq!(msgs[3]["role"], "tool");
        assert_eq!(msgs[3]["tool_call_id"], "call_1");
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert!(body.get("reasoning_effort").is_none());

        let with_thinking = build_request_body(&req, "o3", true);
        assert_eq!(with_thinking["reasoning_effort"], "high");
    }

    #[tokio::test]
    async fn missing_key_fails_before_request() {
        let provider =
            OpenAiCompatibleProvider::new("openai", "gpt-4o", None, ProviderCapabilities::default())
                .with_base_url("http://127.0.0.1:1/v1/");
        assert_eq!(provider.chat_completions_url(), "http://127.0.0.1:1/v1/chat/completions");
        let req = ModelRequest::default();
        let err = match provider.stream(&req).await {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert_eq!(err.code(), Some("missing_api_key"));
    }
}
