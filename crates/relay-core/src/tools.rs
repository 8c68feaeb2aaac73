use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::ids::{ApprovalId, ConversationId, RunId, ToolCallId};

/// Tools declare whether they can run in parallel with others.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Read-only lookups (skills, listings).
    Concurrent,
    /// Anything that mutates state (exec, file writes, schedules).
    Sequential,
}

/// Who is driving the turn. Subagent turns may use tools but never spawn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum TurnRole {
    Primary,
    Subagent { run_id: RunId },
}

impl TurnRole {
    pub fn can_spawn_subagents(&self) -> bool {
        matches!(self, Self::Primary)
    }

    pub fn run_id(&self) -> Option<&RunId> {
        match self {
            Self::Primary => None,
            Self::Subagent { run_id } => Some(run_id),
        }
    }
}

/// Context available to tools during execution.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub conversation_id: ConversationId,
    pub tool_call_id: ToolCallId,
    pub role: TurnRole,
    pub working_directory: PathBuf,
    pub abort_signal: CancellationToken,
}

/// Result returned by a tool execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            duration: Duration::ZERO,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
            duration: Duration::ZERO,
        }
    }

    pub fn json(value: &serde_json::Value) -> Self {
        Self::success(value.to_string())
    }
}

/// Tool definition sent to the model alongside the conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// Trait implemented by each tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> serde_json::Value;

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Concurrent
    }

    /// Hidden from subagent turns when false.
    fn available_to_subagents(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters_schema: self.parameters_schema(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("not permitted: {0}")]
    NotPermitted(String),
    /// Not a failure: the call is parked until a human resolves the approval.
    #[error("approval required for `{command}` ({approval_id})")]
    ApprovalRequired {
        approval_id: ApprovalId,
        command: String,
    },
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl ToolError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArguments(_) => "invalid_arguments",
            Self::ExecutionFailed(_) => "execution_failed",
            Self::NotPermitted(_) => "not_permitted",
            Self::ApprovalRequired { .. } => "approval_required",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// Transient failures are worth a retry by the model.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Text handed back to the model in place of a successful result.
    pub fn to_result_text(&self) -> String {
        let retry = if self.is_transient() { "; transient, may retry" } else { "" };
        format!("[{}{}] {}", self.kind(), retry, self)
    }
}

/// Serde helper for Duration as milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_result_duration_serializes_as_ms() {
        let mut result = ToolResult::success("ok");
        result.duration = Duration::from_millis(1234);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["duration"], 1234);

        let parsed: ToolResult = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.duration, Duration::from_millis(1234));
        assert!(!parsed.is_error);
    }

    #[test]
    fn only_primary_role_spawns() {
        assert!(TurnRole::Primary.can_spawn_subagents());
        let child = TurnRole::Subagent { run_id: RunId::new() };
        assert!(!child.can_spawn_subagents());
        assert!(child.run_id().is_some());
    }

    #[test]
    fn role_serializes_tagged() {
        let run_id = RunId::new();
        let json = serde_json::to_value(TurnRole::Subagent { run_id: run_id.clone() }).unwrap();
        assert_eq!(json["role"], "subagent");
        assert_eq!(json["run_id"], run_id.as_str());
        let parsed: TurnRole = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, TurnRole::Subagent { run_id });
    }

    #[test]
    fn timeout_is_transient() {
        let err = ToolError::Timeout(Duration::from_secs(60));
        assert!(err.is_transient());
        assert!(err.to_result_text().starts_with("[timeout; transient"));
        assert!(!ToolError::ExecutionFailed("x".into()).is_transient());
    }

    #[test]
    fn tool_error_display() {
        let err = ToolError::InvalidArguments("missing path".into());
        assert_eq!(err.to_string(), "invalid arguments: missing path");
        assert_eq!(err.to_result_text(), "[invalid_arguments] invalid arguments: missing path");
    }
}
