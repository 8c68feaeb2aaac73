use serde_json::{json, Value};

use relay_core::messages::{
    AssistantContent, AssistantMessage, Message, ToolResultMessage, UserContent, UserMessage,
};
use relay_core::provider::ModelRequest;

pub const DEFAULT_MAX_TOKENS: u32 = 8_192;

/// Convert a [`ModelRequest`] into the Messages API request body.
pub fn build_request_body(request: &ModelRequest, model: &str, thinking_supported: bool) -> Value {
    let mut max_tokens = request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);

    let mut body = json!({
        "model": model,
        "stream": true,
    });

    if thinking_supported {
        if let Some(budget) = request.thinking.budget_tokens() {
            // The API rejects budgets that do not leave room for the answer.
            if max_tokens <= budget {
                max_tokens = budget + DEFAULT_MAX_TOKENS;
            }
            body["thinking"] = json!({"type": "enabled", "budget_tokens": budget});
        }
    }
    body["max_tokens"] = json!(max_tokens);

    if let Some(system) = request.system_prompt.as_deref().filter(|s| !s.is_empty()) {
        body["system"] = json!([{"type": "text", "text": system}]);
    }

    body["messages"] = json!(convert_messages(&request.messages));

    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters_schema,
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }

    body
}

/// Convert messages, merging consecutive user-role entries. Tool results and
/// notices both travel as user content, and the API requires alternation.
fn convert_messages(messages: &[Message]) -> Vec<Value> {
    let mut result: Vec<Value> = Vec::new();

    for msg in messages {
        let (role, mut blocks) = match msg {
            Message::User(user) => ("user", convert_user_content(user)),
            Message::Assistant(asst) => ("assistant", convert_assistant_content(asst)),
            Message::ToolResult(tr) => ("user", vec![convert_tool_result(tr)]),
            Message::Notice(n) => (
                "user",
                vec![json!({"type": "text", "text": format!("[{}] {}", n.source, n.text)})],
            ),
        };
        if blocks.is_empty() {
            continue;
        }

        if let Some(last) = result.last_mut() {
            if last["role"] == role {
                if let Some(content) = last["content"].as_array_mut() {
                    content.append(&mut blocks);
                    continue;
                }
            }
        }
        result.push(json!({"role": role, "content": blocks}));
    }

    result
}

fn convert_user_content(msg: &UserMessage) -> Vec<Value> {
    msg.content
        .iter()
        .map(|c| match c {
            UserContent::Text { text } => json!({"type": "text", "text": text}),
            UserContent::Image { mime_type, data } => json!({
                "type": "image",
                "source": {"type": "base64", "media_type": mime_type, "data": data}
            }),
        })
        .collect()
}

fn convert_assistant_content(msg: &AssistantMessage) -> Vec<Value> {
    msg.content
        .iter()
        .filter_map(|c| match c {
            AssistantContent::Text { text } if !text.is_empty() => {
                Some(json!({"type": "text", "text": text}))
            }
            AssistantContent::Text { .. } => None,
            // Unsigned reasoning cannot be replayed to the API.
            AssistantContent::Reasoning { .. } => None,
            AssistantContent::ToolCall(tc) => Some(json!({
                "type": "tool_use",
                "id": tc.id.as_str(),
                "name": tc.name,
                "input": tc.arguments,
            })),
        })
        .collect()
}

fn convert_tool_result(msg: &ToolResultMessage) -> Value {
    let mut block = json!({
        "type": "tool_result",
        "tool_use_id": msg.tool_call_id.as_str(),
        "content": msg.content,
    });
    if msg.is_error {
        block["is_error"] = json!(true);
    }
    block
}
