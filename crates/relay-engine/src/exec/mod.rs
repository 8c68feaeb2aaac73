//! The `exec` tool: direct process execution behind the exec policy and the
//! approval gate.

pub mod policy;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, instrument, warn};

use relay_core::tools::{ExecutionMode, Tool, ToolContext, ToolError, ToolResult};
use relay_settings::ExecSettings;
use relay_store::{AllowlistRepo, ApprovalRepo, Database, ParkedCall};

use crate::truncate;

pub use policy::{parse_command, ExecDecision, ExecPolicy, ParsedCommand};

pub const EXEC_TOOL_NAME: &str = "exec";

pub struct ExecTool {
    policy: ExecPolicy,
    approvals: ApprovalRepo,
    timeout: Duration,
    max_output_bytes: usize,
}

impl ExecTool {
    pub fn new(settings: &ExecSettings, db: Database) -> Self {
        Self {
            policy: ExecPolicy::new(settings.allowlist.iter().cloned(), AllowlistRepo::new(db.clone())),
            approvals: ApprovalRepo::new(db),
            timeout: Duration::from_secs(settings.timeout_secs),
            max_output_bytes: settings.max_output_bytes,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run a call whose approval was granted. The syntax guard still applies;
    /// only the allowlist check is skipped.
    #[instrument(skip(self, args, ctx), fields(conversation_id = %ctx.conversation_id))]
    pub async fn run_approved(&self, args: &Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let command = command_arg(args)?;
        let parsed = parse_command(command).map_err(ToolError::NotPermitted)?;
        self.run(&parsed, ctx).await
    }

    async fn run(&self, parsed: &ParsedCommand, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let start = Instant::now();
        let child = tokio::process::Command::new(&parsed.binary)
            .args(&parsed.args)
            .current_dir(&ctx.working_directory)
            .kill_on_drop(true)
            .output();

        let output = tokio::select! {
            res = tokio::time::timeout(self.timeout, child) => res
                .map_err(|_| ToolError::Timeout(self.timeout))?
                .map_err(|e| ToolError::ExecutionFailed(format!("failed to start `{}`: {e}", parsed.binary)))?,
            _ = ctx.abort_signal.cancelled() => return Err(ToolError::Cancelled),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        let mut content = String::new();
        if !stdout.is_empty() {
            content.push_str(&stdout);
        }
        if !stderr.is_empty() {
            if !content.is_empty() {
                content.push('\n');
            }
            content.push_str("STDERR:\n");
            content.push_str(&stderr);
        }
        if content.is_empty() {
            content = "(no output)".to_string();
        }

        let is_error = !output.status.success();
        if is_error {
            let exit_code = output.status.code().unwrap_or(-1);
            content = format!("Exit code: {exit_code}\n{content}");
        }

        Ok(ToolResult {
            content: truncate::truncate_output(&content, self.max_output_bytes),
            is_error,
            duration: start.elapsed(),
        })
    }
}

fn command_arg(args: &Value) -> Result<&str, ToolError> {
    args["command"]
        .as_str()
        .ok_or_else(|| ToolError::InvalidArguments("command is required".into()))
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        EXEC_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Run a single command directly (no shell). Pipes, redirection, chaining and \
         substitution are rejected. Binaries outside the allowlist need human approval."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "required": ["command"],
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Command line, e.g. `git status --short`"
                }
            }
        })
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Sequential
    }

    #[instrument(skip(self, args, ctx), fields(conversation_id = %ctx.conversation_id, tool_call_id = %ctx.tool_call_id))]
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let command = command_arg(&args)?;
        let decision = self
            .policy
            .evaluate(command)
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        match decision {
            ExecDecision::Allowed(parsed) => self.run(&parsed, ctx).await,
            ExecDecision::Rejected(reason) => {
                warn!(reason = %reason, "exec rejected by syntax guard");
                Err(ToolError::NotPermitted(reason))
            }
            ExecDecision::NeedsApproval(parsed) => {
                let (row, _) = self
                    .approvals
                    .create_parked(
                        &ctx.conversation_id,
                        command,
                        &parsed.binary,
                        ParkedCall {
                            tool_call_id: ctx.tool_call_id.clone(),
                            tool_name: EXEC_TOOL_NAME.to_string(),
                            arguments: args.clone(),
                            role: ctx.role.clone(),
                        },
                    )
                    .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
                info!(approval_id = %row.id, binary = %parsed.binary, "exec parked for approval");
                Err(ToolError::ApprovalRequired {
                    approval_id: row.id,
                    command: command.to_string(),
                })
            }
        }
    }
}
