use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use relay_core::ids::RunId;
use relay_core::provider::ThinkingLevel;
use relay_core::tools::{Tool, ToolContext, ToolError, ToolResult};
use relay_store::{Cleanup, SubagentRunRow};

use crate::error::SubagentError;
use crate::subagent::{SpawnRequest, SubagentOrchestrator};

impl From<SubagentError> for ToolError {
    fn from(e: SubagentError) -> Self {
        match e {
            SubagentError::NotPermitted => ToolError::NotPermitted(e.to_string()),
            SubagentError::NotFound(_) | SubagentError::Archived(_) => {
                ToolError::InvalidArguments(e.to_string())
            }
            SubagentError::Timeout(wait) => ToolError::Timeout(wait),
            other => ToolError::ExecutionFailed(format!("[{}] {other}", other.kind())),
        }
    }
}

/// Lets a primary turn start and manage background subagent runs.
pub struct SubagentsTool {
    orchestrator: Arc<SubagentOrchestrator>,
}

impl SubagentsTool {
    pub fn new(orchestrator: Arc<SubagentOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

fn run_id_arg(args: &Value) -> Result<RunId, ToolError> {
    args["run_id"]
        .as_str()
        .map(RunId::from_raw)
        .ok_or_else(|| ToolError::InvalidArguments("run_id is required".into()))
}

impl SubagentsTool {
    /// The run named by `run_id`, if it was spawned from this conversation.
    /// Runs of other conversations look the same as unknown ones.
    fn owned_run(&self, args: &Value, ctx: &ToolContext) -> Result<RunId, ToolError> {
        let run_id = run_id_arg(args)?;
        let row = self.orchestrator.get(&run_id)?;
        if row.parent_conversation_id != ctx.conversation_id {
            return Err(SubagentError::NotFound(run_id).into());
        }
        Ok(run_id)
    }
}

fn describe(row: &SubagentRunRow) -> Value {
    json!({
        "run_id": row.id.as_str(),
        "status": row.status.as_str(),
        "instructions": row.instructions,
        "model_used": row.model_used,
        "summary": row.summary,
        "error": row.error,
        "created_at": row.created_at,
        "finished_at": row.finished_at,
    })
}

#[async_trait]
impl Tool for SubagentsTool {
    fn name(&self) -> &str {
        "subagents"
    }

    fn description(&self) -> &str {
        "Run work in the background. `spawn` starts a subagent with instructions and returns its run_id; \
         its summary is posted back here when it finishes. Use `list`, `history`, `send` and `stop` to manage runs."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["action"],
            "properties": {
                "action": {"type": "string", "enum": ["spawn", "list", "history", "send", "stop"]},
                "instructions": {"type": "string", "description": "Task for a new subagent"},
                "model": {"type": "string", "description": "Optional model override for spawn"},
                "thinking": {"type": "string", "enum": ["off", "low", "medium", "high"]},
                "cleanup": {"type": "string", "enum": ["keep", "discard"]},
                "timeout_seconds": {"type": "integer", "minimum": 1},
                "run_id": {"type": "string"},
                "message": {"type": "string", "description": "Follow-up for send"},
                "wait_seconds": {"type": "integer", "minimum": 1, "description": "Block up to this long for the reply"}
            }
        })
    }

    fn available_to_subagents(&self) -> bool {
        false
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        if !ctx.role.can_spawn_subagents() {
            return Err(SubagentError::NotPermitted.into());
        }
        let start = Instant::now();
        let action = args["action"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("action is required".into()))?;

        let mut result = match action {
            "spawn" => {
                let instructions = args["instructions"]
                    .as_str()
                    .filter(|s| !s.trim().is_empty())
                    .ok_or_else(|| ToolError::InvalidArguments("instructions are required".into()))?;
                let thinking = args["thinking"]
                    .as_str()
                    .map(str::parse::<ThinkingLevel>)
                    .transpose()
                    .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
                let cleanup = args["cleanup"]
                    .as_str()
                    .map(str::parse::<Cleanup>)
                    .transpose()
                    .map_err(ToolError::InvalidArguments)?
                    .unwrap_or_default();

                let row = self.orchestrator.spawn(SpawnRequest {
                    parent_conversation_id: ctx.conversation_id.clone(),
                    instructions: instructions.to_string(),
                    model_override: args["model"].as_str().map(str::to_string),
                    thinking_override: thinking,
                    cleanup,
                    run_timeout: args["timeout_seconds"].as_u64().map(Duration::from_secs),
                })?;
                ToolResult::json(&json!({"run_id": row.id.as_str(), "status": row.status.as_str()}))
            }
            "list" => {
                let runs = self.orchestrator.list(Some(&ctx.conversation_id))?;
                if runs.is_empty() {
                    ToolResult::success("No subagent runs.")
                } else {
                    ToolResult::json(&Value::Array(runs.iter().map(describe).collect()))
                }
            }
            "history" => {
                let run_id = self.owned_run(&args, ctx)?;
                let messages = self.orchestrator.history(&run_id)?;
                let lines: Vec<String> = messages
                    .iter()
                    .map(|m| format!("[{}] {}", m.message.role(), m.message.text()))
                    .collect();
                if lines.is_empty() {
                    ToolResult::success("(no messages)")
                } else {
                    ToolResult::success(lines.join("\n"))
                }
            }
            "send" => {
                let run_id = self.owned_run(&args, ctx)?;
                let message = args["message"]
                    .as_str()
                    .ok_or_else(|| ToolError::InvalidArguments("message is required".into()))?;
                let wait = args["wait_seconds"].as_u64().map(Duration::from_secs);
                match self.orchestrator.send(&run_id, message, wait).await? {
                    Some(reply) => ToolResult::success(reply),
                    None => ToolResult::success(format!("Message queued for {run_id}.")),
                }
            }
            "stop" => {
                let row = self.orchestrator.stop(&self.owned_run(&args, ctx)?)?;
                ToolResult::json(&describe(&row))
            }
            other => return Err(ToolError::InvalidArguments(format!("unknown action: {other}"))),
        };
        result.duration = start.elapsed();
        Ok(result)
    }
}
