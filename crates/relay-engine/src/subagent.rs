//! Background child conversations ("subagents").
//!
//! Each run is one tokio task driving the shared tool loop over its own child
//! conversation. The status row in `subagent_runs` is the source of truth:
//! every transition is a compare-and-set, and only the caller that wins the
//! transition into a finished status posts the summary and arms the archive
//! timer.

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use relay_core::events::RuntimeEvent;
use relay_core::ids::{ConversationId, RunId};
use relay_core::messages::Message;
use relay_core::provider::ThinkingLevel;
use relay_core::stream::NullSink;
use relay_core::tools::TurnRole;
use relay_llm::router::CallMode;
use relay_settings::SubagentSettings;
use relay_store::conversations::StoredMessage;
use relay_store::{
    Cleanup, ConversationRepo, Database, NewSubagentRun, RunUpdate, StoreError, SubagentRunRepo,
    SubagentRunRow, SubagentStatus,
};

use crate::error::{EngineError, SubagentError};
use crate::runner::{run_with_deadline, ToolLoop, TurnOutcome, TurnRequest};

#[derive(Clone, Debug)]
pub struct SubagentConfig {
    pub max_concurrent: usize,
    pub archive_after: Duration,
    pub default_run_timeout: Duration,
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self::from_settings(&SubagentSettings::default())
    }
}

impl SubagentConfig {
    pub fn from_settings(settings: &SubagentSettings) -> Self {
        Self {
            max_concurrent: settings.max_concurrent,
            archive_after: Duration::from_secs(settings.archive_after_secs),
            default_run_timeout: Duration::from_secs(settings.default_run_timeout_secs),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SpawnRequest {
    pub parent_conversation_id: ConversationId,
    pub instructions: String,
    pub model_override: Option<String>,
    pub thinking_override: Option<ThinkingLevel>,
    pub cleanup: Cleanup,
    pub run_timeout: Option<Duration>,
}

impl SpawnRequest {
    pub fn new(parent_conversation_id: ConversationId, instructions: impl Into<String>) -> Self {
        Self {
            parent_conversation_id,
            instructions: instructions.into(),
            model_override: None,
            thinking_override: None,
            cleanup: Cleanup::Keep,
            run_timeout: None,
        }
    }
}

struct MailboxItem {
    text: String,
    reply: Option<oneshot::Sender<String>>,
}

struct RunHandle {
    cancel: CancellationToken,
    mailbox: mpsc::UnboundedSender<MailboxItem>,
    /// Released when the handle is removed, on finish or stop.
    _slot: OwnedSemaphorePermit,
}

pub struct SubagentOrchestrator {
    runs: SubagentRunRepo,
    conversations: ConversationRepo,
    tool_loop: OnceLock<Weak<ToolLoop>>,
    handles: DashMap<RunId, RunHandle>,
    /// One permit per concurrently executing child turn, run or follow-up.
    slots: Arc<Semaphore>,
    /// Serializes follow-up turns per run.
    follow_ups: DashMap<RunId, Arc<tokio::sync::Mutex<()>>>,
    events: broadcast::Sender<RuntimeEvent>,
    config: SubagentConfig,
    shutdown: CancellationToken,
}

impl SubagentOrchestrator {
    pub fn new(db: Database, events: broadcast::Sender<RuntimeEvent>, config: SubagentConfig) -> Self {
        Self {
            runs: SubagentRunRepo::new(db.clone()),
            conversations: ConversationRepo::new(db),
            tool_loop: OnceLock::new(),
            handles: DashMap::new(),
            slots: Arc::new(Semaphore::new(config.max_concurrent)),
            follow_ups: DashMap::new(),
            events,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// The loop holds the subagent tool, which holds this orchestrator, so the
    /// back-reference is weak and set once after construction.
    pub fn attach(&self, tool_loop: &Arc<ToolLoop>) {
        if self.tool_loop.set(Arc::downgrade(tool_loop)).is_err() {
            warn!("subagent orchestrator already attached to a tool loop");
        }
    }

    pub fn config(&self) -> &SubagentConfig {
        &self.config
    }

    /// Cancel every in-flight run. Used on shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn tool_loop(&self) -> Result<Arc<ToolLoop>, SubagentError> {
        self.tool_loop
            .get()
            .and_then(Weak::upgrade)
            .ok_or(SubagentError::Unavailable)
    }

    fn send_event(&self, event: RuntimeEvent) {
        if self.events.send(event).is_err() {
            debug!("no event receivers, event dropped");
        }
    }

    fn take_slot(&self) -> Result<OwnedSemaphorePermit, SubagentError> {
        let cap = self.config.max_concurrent;
        Arc::clone(&self.slots).try_acquire_owned().map_err(|_| {
            info!(cap, "no free subagent slot");
            SubagentError::Busy { cap }
        })
    }

    /// Summaries and replies go through the loop's notice board so they never
    /// split a parent tool call from its result.
    fn post_to_parent(&self, row: &SubagentRunRow, text: String) {
        let notice = Message::notice("subagent", text);
        let result = match self.tool_loop() {
            Ok(tool_loop) => tool_loop.notices().post(&row.parent_conversation_id, notice),
            Err(_) => self
                .conversations
                .append_message(&row.parent_conversation_id, &notice)
                .map(|_| ()),
        };
        if let Err(e) = result {
            error!(run_id = %row.id, error = %e, "failed to post subagent notice");
        }
    }

    fn load(&self, run_id: &RunId) -> Result<SubagentRunRow, SubagentError> {
        self.runs.get(run_id).map_err(|e| match e {
            StoreError::NotFound(_) => SubagentError::NotFound(run_id.clone()),
            other => other.into(),
        })
    }

    /// Admit a run under the cap and start it in the background.
    #[instrument(skip(self, req), fields(parent = %req.parent_conversation_id))]
    pub fn spawn(self: &Arc<Self>, req: SpawnRequest) -> Result<SubagentRunRow, SubagentError> {
        let tool_loop = self.tool_loop()?;
        let cap = self.config.max_concurrent;
        let run_timeout = req.run_timeout.unwrap_or(self.config.default_run_timeout);
        let slot = self.take_slot()?;

        let row = self
            .runs
            .insert_if_below_cap(
                &NewSubagentRun {
                    parent_conversation_id: req.parent_conversation_id,
                    instructions: req.instructions,
                    model_override: req.model_override,
                    thinking_override: req.thinking_override,
                    cleanup: req.cleanup,
                    run_timeout_secs: run_timeout.as_secs(),
                },
                cap,
            )?
            .ok_or_else(|| {
                info!(cap, "subagent spawn refused at capacity");
                SubagentError::Busy { cap }
            })?;

        self.conversations
            .append_message(&row.child_conversation_id, &Message::user_text(&row.instructions))?;
        info!(run_id = %row.id, "subagent spawned");
        self.send_event(RuntimeEvent::SubagentSpawned {
            parent_conversation_id: row.parent_conversation_id.clone(),
            run_id: row.id.clone(),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = self.shutdown.child_token();
        self.handles.insert(
            row.id.clone(),
            RunHandle {
                cancel: cancel.clone(),
                mailbox: tx,
                _slot: slot,
            },
        );

        let this = Arc::clone(self);
        let task_row = row.clone();
        tokio::spawn(async move { this.drive(task_row, tool_loop, cancel, rx).await });
        Ok(row)
    }

    #[instrument(skip_all, fields(run_id = %row.id))]
    async fn drive(
        self: Arc<Self>,
        row: SubagentRunRow,
        tool_loop: Arc<ToolLoop>,
        cancel: CancellationToken,
        mut mailbox: mpsc::UnboundedReceiver<MailboxItem>,
    ) {
        match self.runs.transition(
            &row.id,
            &[SubagentStatus::Spawned],
            SubagentStatus::Running,
            RunUpdate::default(),
        ) {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!("run left spawned before it started");
                self.handles.remove(&row.id);
                return;
            }
            Err(e) => {
                error!(error = %e, "failed to mark run running");
                self.handles.remove(&row.id);
                return;
            }
        }

        // On timeout the run's token is cancelled and the loop winds down at
        // its next boundary, leaving the child transcript consistent.
        let req = child_request(&row, cancel.clone());
        let limit = Duration::from_secs(row.run_timeout_secs);
        let (result, timed_out) = run_with_deadline(
            limit,
            &cancel,
            run_turns(&tool_loop, &self.conversations, &req, &mut mailbox),
        )
        .await;

        let (status, update) = match result {
            _ if timed_out => {
                warn!(limit_secs = limit.as_secs(), "subagent run timed out");
                (
                    SubagentStatus::TimedOut,
                    RunUpdate {
                        error: Some(SubagentError::Timeout(limit).to_string()),
                        ..Default::default()
                    },
                )
            }
            Ok((summary, model_used)) => (
                SubagentStatus::Completed,
                RunUpdate {
                    model_used,
                    summary: Some(summary),
                    error: None,
                },
            ),
            Err(EngineError::Aborted) => (
                SubagentStatus::Interrupted,
                RunUpdate {
                    error: Some("interrupted".into()),
                    ..Default::default()
                },
            ),
            Err(e) => {
                warn!(error_kind = e.kind(), error = %e, "subagent run failed");
                (
                    SubagentStatus::Failed,
                    RunUpdate {
                        error: Some(e.to_string()),
                        ..Default::default()
                    },
                )
            }
        };

        self.handles.remove(&row.id);
        match self
            .runs
            .transition(&row.id, &SubagentStatus::ACTIVE, status, update)
        {
            Ok(Some(finished)) => self.finalize(&finished),
            Ok(None) => debug!("run was already finished elsewhere"),
            Err(e) => error!(error = %e, "failed to record subagent outcome"),
        }

        // Messages that raced the finish become follow-up turns.
        mailbox.close();
        let mut late = Vec::new();
        while let Ok(item) = mailbox.try_recv() {
            late.push(item);
        }
        if !late.is_empty() {
            if let Err(e) = self.follow_up(&row, late) {
                warn!(error = %e, "dropping queued subagent messages");
            }
        }
    }

    /// Post the outcome to the parent, then arm the archive timer.
    fn finalize(self: &Arc<Self>, row: &SubagentRunRow) {
        let text = match row.status {
            SubagentStatus::Completed => format!(
                "Subagent {} completed:\n{}",
                row.id,
                row.summary.as_deref().unwrap_or("")
            ),
            SubagentStatus::TimedOut => format!(
                "Subagent {} timed out after {}s.",
                row.id, row.run_timeout_secs
            ),
            SubagentStatus::Interrupted => format!("Subagent {} was interrupted.", row.id),
            _ => format!(
                "Subagent {} failed: {}",
                row.id,
                row.error.as_deref().unwrap_or("unknown error")
            ),
        };
        self.post_to_parent(row, text);
        info!(run_id = %row.id, status = %row.status, "subagent finished");
        self.send_event(RuntimeEvent::SubagentFinished {
            parent_conversation_id: row.parent_conversation_id.clone(),
            run_id: row.id.clone(),
            status: row.status.to_string(),
        });

        let delay = match row.cleanup {
            Cleanup::Keep => self.config.archive_after,
            Cleanup::Discard => Duration::ZERO,
        };
        self.arm_archive(row.id.clone(), delay);
    }

    fn arm_archive(self: &Arc<Self>, run_id: RunId, delay: Duration) {
        let due = chrono::Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        if let Err(e) = self.runs.set_archive_due(&run_id, &due.to_rfc3339()) {
            error!(run_id = %run_id, error = %e, "failed to record archive deadline");
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match this.runs.archive(&run_id) {
                Ok(true) => {
                    this.follow_ups.remove(&run_id);
                    info!(run_id = %run_id, "subagent run archived");
                }
                Ok(false) => debug!(run_id = %run_id, "archive skipped, run not finished"),
                Err(e) => error!(run_id = %run_id, error = %e, "failed to archive subagent run"),
            }
        });
    }

    pub fn list(&self, parent: Option<&ConversationId>) -> Result<Vec<SubagentRunRow>, SubagentError> {
        Ok(self.runs.list(parent)?)
    }

    pub fn get(&self, run_id: &RunId) -> Result<SubagentRunRow, SubagentError> {
        self.load(run_id)
    }

    /// Child transcript in order. Empty once the run is archived.
    pub fn history(&self, run_id: &RunId) -> Result<Vec<StoredMessage>, SubagentError> {
        let row = self.load(run_id)?;
        Ok(self.conversations.stored_messages(&row.child_conversation_id)?)
    }

    /// Mark an active run interrupted and cancel its task. Stopping a finished
    /// run is a no-op that returns its current row.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub fn stop(self: &Arc<Self>, run_id: &RunId) -> Result<SubagentRunRow, SubagentError> {
        let row = self.load(run_id)?;
        if row.status == SubagentStatus::Archived {
            return Err(SubagentError::Archived(run_id.clone()));
        }
        let stopped = self.runs.transition(
            run_id,
            &SubagentStatus::ACTIVE,
            SubagentStatus::Interrupted,
            RunUpdate {
                error: Some("stopped by caller".into()),
                ..Default::default()
            },
        )?;
        if let Some((_, handle)) = self.handles.remove(run_id) {
            handle.cancel.cancel();
        }
        match stopped {
            Some(stopped) => {
                self.finalize(&stopped);
                Ok(stopped)
            }
            None => self.load(run_id),
        }
    }

    /// Deliver a message to a run. Active runs read it between turns; finished
    /// runs get a follow-up turn. With `wait`, blocks up to that long for the
    /// reply. Dropping the returned future abandons only the wait.
    #[instrument(skip(self, message), fields(run_id = %run_id))]
    pub async fn send(
        self: &Arc<Self>,
        run_id: &RunId,
        message: &str,
        wait: Option<Duration>,
    ) -> Result<Option<String>, SubagentError> {
        let row = self.load(run_id)?;
        if row.status == SubagentStatus::Archived {
            return Err(SubagentError::Archived(run_id.clone()));
        }

        let (reply_tx, reply_rx) = match wait {
            Some(_) => {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };
        let item = MailboxItem {
            text: message.to_string(),
            reply: reply_tx,
        };

        let undelivered = match self.handles.get(run_id) {
            Some(handle) => handle.mailbox.send(item).err().map(|e| e.0),
            None => Some(item),
        };
        if let Some(item) = undelivered {
            self.follow_up(&row, vec![item])?;
        }

        match (wait, reply_rx) {
            (Some(wait), Some(rx)) => match tokio::time::timeout(wait, rx).await {
                Ok(Ok(reply)) => Ok(Some(reply)),
                Ok(Err(_)) => Err(SubagentError::Unavailable),
                Err(_) => Err(SubagentError::Timeout(wait)),
            },
            _ => Ok(None),
        }
    }

    /// Continue a child conversation whose parked call was just resolved.
    pub fn resume(self: &Arc<Self>, run_id: &RunId) -> Result<(), SubagentError> {
        let row = self.load(run_id)?;
        if row.status == SubagentStatus::Archived {
            return Err(SubagentError::Archived(run_id.clone()));
        }
        self.follow_up(&row, Vec::new())
    }

    /// Run follow-up turns in the child conversation outside the run's main
    /// task: one per message, or a single turn over the existing transcript
    /// when `items` is empty. The status is left as is. Each turn holds a
    /// concurrency slot; with none free the call fails with `Busy` and
    /// nothing is appended. Replies without a waiting caller are posted to
    /// the parent.
    fn follow_up(self: &Arc<Self>, row: &SubagentRunRow, items: Vec<MailboxItem>) -> Result<(), SubagentError> {
        let tool_loop = self.tool_loop()?;
        let slot = self.take_slot()?;
        let lock = self
            .follow_ups
            .entry(row.id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let this = Arc::clone(self);
        let row = row.clone();
        tokio::spawn(async move {
            let _slot = slot;
            let _guard = lock.lock().await;
            let turns: Vec<Option<MailboxItem>> = if items.is_empty() {
                vec![None]
            } else {
                items.into_iter().map(Some).collect()
            };
            for item in turns {
                let reply = match item {
                    Some(item) => {
                        if let Err(e) = this
                            .conversations
                            .append_message(&row.child_conversation_id, &Message::user_text(&item.text))
                        {
                            error!(run_id = %row.id, error = %e, "failed to record follow-up message");
                            continue;
                        }
                        item.reply
                    }
                    None => None,
                };
                let text = this.follow_up_turn(&tool_loop, &row).await;
                match reply {
                    Some(reply) => {
                        if reply.send(text).is_err() {
                            debug!(run_id = %row.id, "caller stopped waiting for reply");
                        }
                    }
                    None => this.post_to_parent(&row, format!("Subagent {} replied:\n{text}", row.id)),
                }
            }
        });
        Ok(())
    }

    async fn follow_up_turn(&self, tool_loop: &ToolLoop, row: &SubagentRunRow) -> String {
        let cancel = self.shutdown.child_token();
        let req = child_request(row, cancel.clone());
        let limit = Duration::from_secs(row.run_timeout_secs);
        match run_with_deadline(limit, &cancel, tool_loop.run(&req, &NullSink)).await {
            (_, true) => format!("[subagent_timeout] no reply within {}s", limit.as_secs()),
            (Ok(outcome), false) => summarize(&outcome),
            (Err(e), false) => format!("[{}] {e}", e.kind()),
        }
    }

    /// Startup recovery: interrupt runs that were active when the process
    /// died, and re-arm archive timers for every finished, unarchived run.
    #[instrument(skip(self))]
    pub fn recover(self: &Arc<Self>) -> Result<RecoveryReport, SubagentError> {
        let interrupted = self.runs.mark_active_interrupted()?;
        for run_id in &interrupted {
            warn!(run_id = %run_id, "run was active at shutdown, marked interrupted");
            let row = self.runs.get(run_id)?;
            self.post_to_parent(&row, format!("Subagent {run_id} was interrupted by a restart."));
        }

        let mut rearmed = Vec::new();
        for row in self.runs.list_unarchived_finished()? {
            let delay = match (&row.archive_due_at, row.cleanup) {
                (_, Cleanup::Discard) => Duration::ZERO,
                (Some(due), Cleanup::Keep) => chrono::DateTime::parse_from_rfc3339(due)
                    .ok()
                    .and_then(|due| {
                        (due.with_timezone(&chrono::Utc) - chrono::Utc::now()).to_std().ok()
                    })
                    .unwrap_or(Duration::ZERO),
                (None, Cleanup::Keep) => self.config.archive_after,
            };
            self.arm_archive(row.id.clone(), delay);
            rearmed.push(row.id);
        }
        info!(interrupted = interrupted.len(), rearmed = rearmed.len(), "subagent recovery complete");
        Ok(RecoveryReport { interrupted, rearmed })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub interrupted: Vec<RunId>,
    pub rearmed: Vec<RunId>,
}

fn child_request(row: &SubagentRunRow, cancel: CancellationToken) -> TurnRequest {
    TurnRequest {
        conversation_id: row.child_conversation_id.clone(),
        role: TurnRole::Subagent {
            run_id: row.id.clone(),
        },
        mode: CallMode::Blocking,
        model_override: row.model_override.clone(),
        thinking: row.thinking_override.unwrap_or_default(),
        strict_final: None,
        cancel,
    }
}

fn summarize(outcome: &TurnOutcome) -> String {
    match outcome {
        TurnOutcome::Final { answer, .. } => answer.visible_text().to_string(),
        TurnOutcome::AwaitingApproval { approvals } => {
            let pending: Vec<String> = approvals
                .iter()
                .map(|a| format!("`{}` ({})", a.command, a.approval_id))
                .collect();
            format!("Waiting on approval for {}", pending.join(", "))
        }
    }
}

/// The run's first turn, then one turn per queued message. Returns the last
/// summary and the model that produced it.
async fn run_turns(
    tool_loop: &ToolLoop,
    conversations: &ConversationRepo,
    req: &TurnRequest,
    mailbox: &mut mpsc::UnboundedReceiver<MailboxItem>,
) -> Result<(String, Option<String>), EngineError> {
    let mut reply: Option<oneshot::Sender<String>> = None;
    loop {
        let outcome = tool_loop.run(req, &NullSink).await?;
        let summary = summarize(&outcome);
        let model_used = match &outcome {
            TurnOutcome::Final { answer, .. } => Some(format!("{}/{}", answer.provider, answer.model)),
            TurnOutcome::AwaitingApproval { .. } => None,
        };
        if let Some(reply) = reply.take() {
            let _ = reply.send(summary.clone());
        }
        if matches!(outcome, TurnOutcome::AwaitingApproval { .. }) {
            return Ok((summary, model_used));
        }
        match mailbox.try_recv() {
            Ok(item) => {
                conversations.append_message(&req.conversation_id, &Message::user_text(&item.text))?;
                reply = item.reply;
            }
            Err(_) => return Ok((summary, model_used)),
        }
    }
}
