//! The tool-call loop: model call → tool execution → model call, until the
//! model answers without tool calls, a bound is hit, or a call is parked
//! behind an exec approval.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use relay_core::events::RuntimeEvent;
use relay_core::ids::{ApprovalId, ConversationId};
use relay_core::messages::{Message, ToolCallBlock};
use relay_core::provider::{ModelRequest, ThinkingLevel};
use relay_core::stream::StreamSink;
use relay_core::tools::{ExecutionMode, Tool, ToolContext, ToolError, TurnRole};
use relay_llm::router::{CallMode, FallbackRouter, FinalAnswer};
use relay_settings::{resolve_path, RelaySettings};
use relay_store::{ConversationRepo, Database, ResumableCallRepo};

use crate::error::EngineError;
use crate::notices::NoticeBoard;
use crate::registry::ToolRegistry;
use crate::truncate;

/// Bounds and fixed inputs of every turn.
#[derive(Clone, Debug)]
pub struct LoopConfig {
    pub max_iterations: u32,
    pub tool_timeout: Duration,
    pub max_turn_duration: Duration,
    pub system_prompt: Option<String>,
    pub working_directory: PathBuf,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 12,
            tool_timeout: Duration::from_secs(60),
            max_turn_duration: Duration::from_secs(600),
            system_prompt: None,
            working_directory: std::env::temp_dir(),
        }
    }
}

impl LoopConfig {
    pub fn from_settings(settings: &RelaySettings) -> Self {
        let tl = &settings.tool_loop;
        Self {
            max_iterations: tl.max_iterations,
            tool_timeout: Duration::from_secs(tl.tool_timeout_secs),
            max_turn_duration: Duration::from_secs(tl.max_turn_duration_secs),
            system_prompt: tl.system_prompt.clone(),
            working_directory: resolve_path(tl.workspace_dir.as_deref().unwrap_or("workspace")),
        }
    }
}

/// One turn's parameters. The user message must already be persisted.
#[derive(Clone, Debug)]
pub struct TurnRequest {
    pub conversation_id: ConversationId,
    pub role: TurnRole,
    pub mode: CallMode,
    pub model_override: Option<String>,
    pub thinking: ThinkingLevel,
    /// Strict final mode for this turn; `None` keeps the router default.
    pub strict_final: Option<bool>,
    pub cancel: CancellationToken,
}

impl TurnRequest {
    pub fn primary(conversation_id: ConversationId, mode: CallMode) -> Self {
        Self {
            conversation_id,
            role: TurnRole::Primary,
            mode,
            model_override: None,
            thinking: ThinkingLevel::Off,
            strict_final: None,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingApproval {
    pub approval_id: ApprovalId,
    pub command: String,
}

#[derive(Debug)]
pub enum TurnOutcome {
    Final { answer: FinalAnswer, iterations: u32 },
    /// At least one call is parked; the turn continues once every parked
    /// call in the conversation is resolved.
    AwaitingApproval { approvals: Vec<PendingApproval> },
}

impl TurnOutcome {
    pub fn final_text(&self) -> Option<&str> {
        match self {
            Self::Final { answer, .. } => Some(answer.visible_text()),
            Self::AwaitingApproval { .. } => None,
        }
    }
}

enum CallResult {
    Done { content: String, is_error: bool, duration: Duration },
    Parked(PendingApproval),
}

pub struct ToolLoop {
    router: Arc<FallbackRouter>,
    registry: Arc<ToolRegistry>,
    conversations: ConversationRepo,
    resumable: ResumableCallRepo,
    notices: Arc<NoticeBoard>,
    events: broadcast::Sender<RuntimeEvent>,
    config: LoopConfig,
}

impl ToolLoop {
    pub fn new(
        router: Arc<FallbackRouter>,
        registry: Arc<ToolRegistry>,
        db: Database,
        events: broadcast::Sender<RuntimeEvent>,
        config: LoopConfig,
    ) -> Self {
        Self {
            router,
            registry,
            conversations: ConversationRepo::new(db.clone()),
            resumable: ResumableCallRepo::new(db.clone()),
            notices: Arc::new(NoticeBoard::new(db)),
            events,
            config,
        }
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<FallbackRouter> {
        &self.router
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn notices(&self) -> &Arc<NoticeBoard> {
        &self.notices
    }

    fn send_event(&self, event: RuntimeEvent) {
        if self.events.send(event).is_err() {
            debug!("no event receivers, event dropped");
        }
    }

    /// Drive the conversation until a final answer or a parked approval.
    #[instrument(skip(self, req, sink), fields(conversation_id = %req.conversation_id, role = ?req.role))]
    pub async fn run(
        &self,
        req: &TurnRequest,
        sink: &dyn StreamSink,
    ) -> Result<TurnOutcome, EngineError> {
        if let Some(parked) = self
            .resumable
            .list_for_conversation(&req.conversation_id)?
            .into_iter()
            .next()
        {
            return Err(EngineError::ApprovalPending(parked.approval_id));
        }

        let limit = self.config.max_turn_duration;
        let turn = TurnRequest {
            cancel: req.cancel.child_token(),
            ..req.clone()
        };
        match run_with_deadline(limit, &turn.cancel, self.iterate(&turn, sink)).await {
            (Err(EngineError::Aborted), true) if !req.cancel.is_cancelled() => {
                warn!(limit_secs = limit.as_secs(), "turn exceeded its time budget");
                Err(EngineError::TurnTimeout(limit))
            }
            (result, _) => result,
        }
    }

    async fn iterate(
        &self,
        req: &TurnRequest,
        sink: &dyn StreamSink,
    ) -> Result<TurnOutcome, EngineError> {
        let tools = self.registry.definitions_for(&req.role);

        for iteration in 1..=self.config.max_iterations {
            if req.cancel.is_cancelled() {
                return Err(EngineError::Aborted);
            }

            let request = ModelRequest {
                system_prompt: self.config.system_prompt.clone(),
                messages: self.conversations.messages(&req.conversation_id)?,
                tools: tools.clone(),
                model_override: req.model_override.clone(),
                thinking: req.thinking,
                max_tokens: None,
                strict_final: req.strict_final,
            };

            let answer = tokio::select! {
                biased;
                _ = req.cancel.cancelled() => return Err(EngineError::Aborted),
                result = self.router.send(&request, req.mode, sink) => result?,
            };

            let calls: Vec<ToolCallBlock> =
                answer.message.tool_calls().into_iter().cloned().collect();
            let batch = (!calls.is_empty()).then(|| self.notices.open_batch(&req.conversation_id));
            self.conversations
                .append_message(&req.conversation_id, &Message::Assistant(answer.message.clone()))?;

            if calls.is_empty() {
                info!(iteration, provider = %answer.provider, "turn complete");
                return Ok(TurnOutcome::Final {
                    answer,
                    iterations: iteration,
                });
            }

            debug!(iteration, tool_calls = calls.len(), "executing tool calls");
            let results = self.execute_tools(&calls, req).await;

            let mut parked = Vec::new();
            for (call, result) in calls.iter().zip(results) {
                match result {
                    CallResult::Done {
                        content,
                        is_error,
                        duration,
                    } => {
                        self.conversations.append_message(
                            &req.conversation_id,
                            &Message::tool_result(call.id.clone(), &call.name, content, is_error),
                        )?;
                        self.send_event(RuntimeEvent::ToolFinished {
                            conversation_id: req.conversation_id.clone(),
                            tool_call_id: call.id.clone(),
                            is_error,
                            duration_ms: duration.as_millis() as u64,
                        });
                    }
                    CallResult::Parked(pending) => {
                        info!(approval_id = %pending.approval_id, tool = %call.name, "tool call parked for approval");
                        self.send_event(RuntimeEvent::ApprovalRequested {
                            conversation_id: req.conversation_id.clone(),
                            approval_id: pending.approval_id.clone(),
                            command: pending.command.clone(),
                        });
                        parked.push(pending);
                    }
                }
            }
            drop(batch);

            if !parked.is_empty() {
                return Ok(TurnOutcome::AwaitingApproval { approvals: parked });
            }
        }

        warn!(max = self.config.max_iterations, "tool loop exceeded iteration cap");
        Err(EngineError::ToolLoopExceeded(self.config.max_iterations))
    }

    /// Results come back in call order. Concurrent tools run together first,
    /// then sequential tools one at a time.
    async fn execute_tools(&self, calls: &[ToolCallBlock], req: &TurnRequest) -> Vec<CallResult> {
        let mut slots: Vec<Option<CallResult>> = calls.iter().map(|_| None).collect();
        let mut concurrent = Vec::new();
        let mut sequential = Vec::new();

        for (idx, call) in calls.iter().enumerate() {
            match self.resolve_tool(call, &req.role) {
                Ok(tool) => match tool.execution_mode() {
                    ExecutionMode::Concurrent => concurrent.push((idx, tool)),
                    ExecutionMode::Sequential => sequential.push((idx, tool)),
                },
                Err(e) => slots[idx] = Some(error_result(&e)),
            }
        }

        let batch = concurrent.into_iter().map(|(idx, tool)| {
            let call = &calls[idx];
            async move { (idx, self.execute_one(tool, call, req).await) }
        });
        for (idx, result) in futures::future::join_all(batch).await {
            slots[idx] = Some(result);
        }

        for (idx, tool) in sequential {
            let result = if req.cancel.is_cancelled() {
                error_result(&ToolError::Cancelled)
            } else {
                self.execute_one(tool, &calls[idx], req).await
            };
            slots[idx] = Some(result);
        }

        slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| error_result(&ToolError::Cancelled)))
            .collect()
    }

    fn resolve_tool(&self, call: &ToolCallBlock, role: &TurnRole) -> Result<Arc<dyn Tool>, ToolError> {
        let tool = self
            .registry
            .get(&call.name)
            .ok_or_else(|| ToolError::InvalidArguments(format!("unknown tool: {}", call.name)))?;
        if !role.can_spawn_subagents() && !tool.available_to_subagents() {
            return Err(ToolError::NotPermitted(format!(
                "{} is not available in subagent turns",
                call.name
            )));
        }
        Ok(tool)
    }

    async fn execute_one(
        &self,
        tool: Arc<dyn Tool>,
        call: &ToolCallBlock,
        req: &TurnRequest,
    ) -> CallResult {
        self.send_event(RuntimeEvent::ToolStarted {
            conversation_id: req.conversation_id.clone(),
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
        });

        let ctx = ToolContext {
            conversation_id: req.conversation_id.clone(),
            tool_call_id: call.id.clone(),
            role: req.role.clone(),
            working_directory: self.config.working_directory.clone(),
            // Turn cancellation is observed between calls; a started call is
            // only interrupted by its own timeout.
            abort_signal: CancellationToken::new(),
        };

        let timeout = self.config.tool_timeout;
        let start = Instant::now();
        let result = tokio::time::timeout(
            timeout,
            std::panic::AssertUnwindSafe(tool.execute(call.arguments.clone(), &ctx)).catch_unwind(),
        )
        .await;
        let duration = start.elapsed();

        let (content, is_error) = match result {
            Ok(Ok(Ok(r))) => (r.content, r.is_error),
            Ok(Ok(Err(ToolError::ApprovalRequired {
                approval_id,
                command,
            }))) => {
                return CallResult::Parked(PendingApproval {
                    approval_id,
                    command,
                })
            }
            Ok(Ok(Err(e))) => {
                debug!(tool = %call.name, error_kind = e.kind(), error = %e, "tool returned error");
                (e.to_result_text(), true)
            }
            Ok(Err(panic)) => {
                let msg = panic_message(&panic);
                error!(tool = %call.name, panic = %msg, "tool panicked during execution");
                (
                    ToolError::ExecutionFailed("internal error: tool crashed".into()).to_result_text(),
                    true,
                )
            }
            Err(_) => {
                ctx.abort_signal.cancel();
                warn!(tool = %call.name, timeout_secs = timeout.as_secs(), "tool timed out");
                (ToolError::Timeout(timeout).to_result_text(), true)
            }
        };

        let max = truncate::max_output_for_tool(&call.name);
        CallResult::Done {
            content: truncate::truncate_output(&content, max),
            is_error,
            duration,
        }
    }
}

/// Await `fut`. Once `limit` passes, cancel `cancel` and keep awaiting, so
/// the loop stops at its next boundary instead of being dropped mid-batch.
/// The flag reports whether the deadline fired.
pub(crate) async fn run_with_deadline<F: Future>(
    limit: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> (F::Output, bool) {
    let mut fut = std::pin::pin!(fut);
    tokio::select! {
        out = &mut fut => return (out, false),
        _ = tokio::time::sleep(limit) => {}
    }
    cancel.cancel();
    (fut.await, true)
}

fn error_result(err: &ToolError) -> CallResult {
    CallResult::Done {
        content: err.to_result_text(),
        is_error: true,
        duration: Duration::ZERO,
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
