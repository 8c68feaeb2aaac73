//! Runtime facade: wires the router, tool loop, approval service and subagent
//! orchestrator together behind the surface channel adapters call.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use relay_core::events::RuntimeEvent;
use relay_core::health::{HealthRegistry, ProviderRuntimeState};
use relay_core::ids::{ApprovalId, ConversationId};
use relay_core::messages::Message;
use relay_core::provider::LlmProvider;
use relay_core::stream::{StreamEvent, StreamSink};
use relay_core::tools::TurnRole;
use relay_llm::router::{CallMode, CredentialTestReport, FallbackRouter, RouterError};
use relay_llm::build_chain;
use relay_settings::{resolve_path, RelaySettings, SettingsCredentialStore};
use relay_store::conversations::StoredMessage;
use relay_store::{
    ApprovalDecision, ApprovalRow, ConversationKind, ConversationRepo, Database,
    SqliteHealthRegistry,
};

use crate::approval::{ApprovalService, Resolution};
use crate::error::EngineError;
use crate::exec::ExecTool;
use crate::runner::{LoopConfig, ToolLoop, TurnOutcome, TurnRequest};
use crate::subagent::{RecoveryReport, SubagentConfig, SubagentOrchestrator};
use crate::tools::create_default_registry;
use crate::tools::schedule::{InMemoryScheduleStore, ScheduleEntry, ScheduleStore};

const EVENT_BUS_CAPACITY: usize = 1024;

/// Result of resolving an approval.
#[derive(Debug)]
pub struct ApprovalOutcome {
    pub resolution: Resolution,
    /// The continued primary turn, when the resolution unblocked one.
    pub turn: Option<TurnOutcome>,
}

/// Forwards stream events to the caller's sink and onto the event bus.
struct ForwardingSink<'a> {
    conversation_id: &'a ConversationId,
    events: &'a broadcast::Sender<RuntimeEvent>,
    inner: &'a dyn StreamSink,
}

impl StreamSink for ForwardingSink<'_> {
    fn emit(&self, event: StreamEvent) {
        self.inner.emit(event.clone());
        let _ = self.events.send(RuntimeEvent::Stream {
            conversation_id: self.conversation_id.clone(),
            event,
        });
    }
}

/// Removes the conversation's turn entry when the turn ends.
struct ActiveTurn<'a> {
    turns: &'a DashMap<ConversationId, CancellationToken>,
    conversation_id: ConversationId,
    cancel: CancellationToken,
}

impl Drop for ActiveTurn<'_> {
    fn drop(&mut self) {
        self.turns.remove(&self.conversation_id);
    }
}

pub struct Orchestrator {
    events: broadcast::Sender<RuntimeEvent>,
    router: Arc<FallbackRouter>,
    tool_loop: Arc<ToolLoop>,
    approvals: ApprovalService,
    subagents: Arc<SubagentOrchestrator>,
    schedule: Arc<dyn ScheduleStore>,
    conversations: ConversationRepo,
    active_turns: DashMap<ConversationId, CancellationToken>,
    /// Per-conversation strict final mode, set by the channel for its user.
    strict_final: DashMap<ConversationId, bool>,
}

impl Orchestrator {
    /// Production wiring: provider chain from settings, health persisted in
    /// the same database.
    pub fn from_settings(settings: &RelaySettings, db: Database) -> Self {
        let providers = build_chain(&SettingsCredentialStore::new(settings));
        let health: Arc<dyn HealthRegistry> = Arc::new(SqliteHealthRegistry::new(db.clone()));
        Self::with_providers(settings, db, providers, health)
    }

    pub fn with_providers(
        settings: &RelaySettings,
        db: Database,
        providers: Vec<Arc<dyn LlmProvider>>,
        health: Arc<dyn HealthRegistry>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let router = Arc::new(
            FallbackRouter::new(providers, health)
                .with_strict_final(settings.router.strict_final)
                .with_event_bus(events.clone()),
        );

        let config = LoopConfig::from_settings(settings);
        if let Err(e) = std::fs::create_dir_all(&config.working_directory) {
            warn!(path = %config.working_directory.display(), error = %e, "failed to create workspace directory");
        }
        let skills_dir = resolve_path(settings.tool_loop.skills_dir.as_deref().unwrap_or("skills"));

        let exec = Arc::new(ExecTool::new(&settings.exec, db.clone()));
        let subagents = Arc::new(SubagentOrchestrator::new(
            db.clone(),
            events.clone(),
            SubagentConfig::from_settings(&settings.subagents),
        ));
        let schedule: Arc<dyn ScheduleStore> = Arc::new(InMemoryScheduleStore::new());
        let registry = create_default_registry(
            exec.clone(),
            subagents.clone(),
            schedule.clone(),
            &config.working_directory,
            &skills_dir,
        );
        let working_directory = config.working_directory.clone();
        let tool_loop = Arc::new(ToolLoop::new(
            router.clone(),
            Arc::new(registry),
            db.clone(),
            events.clone(),
            config,
        ));
        subagents.attach(&tool_loop);

        Self {
            approvals: ApprovalService::new(db.clone(), exec, events.clone(), working_directory),
            conversations: ConversationRepo::new(db),
            events,
            router,
            tool_loop,
            subagents,
            schedule,
            active_turns: DashMap::new(),
            strict_final: DashMap::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    pub fn router(&self) -> &Arc<FallbackRouter> {
        &self.router
    }

    pub fn subagents(&self) -> &Arc<SubagentOrchestrator> {
        &self.subagents
    }

    pub fn schedule(&self) -> &Arc<dyn ScheduleStore> {
        &self.schedule
    }

    /// Override strict final mode for one conversation. `None` restores the
    /// configured default.
    pub fn set_strict_final(&self, conversation_id: &ConversationId, strict: Option<bool>) {
        match strict {
            Some(strict) => {
                self.strict_final.insert(conversation_id.clone(), strict);
            }
            None => {
                self.strict_final.remove(conversation_id);
            }
        }
    }

    fn begin_turn(&self, conversation_id: &ConversationId) -> Result<ActiveTurn<'_>, EngineError> {
        let cancel = CancellationToken::new();
        match self.active_turns.entry(conversation_id.clone()) {
            Entry::Occupied(_) => Err(EngineError::ConversationBusy(conversation_id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(cancel.clone());
                Ok(ActiveTurn {
                    turns: &self.active_turns,
                    conversation_id: conversation_id.clone(),
                    cancel,
                })
            }
        }
    }

    /// Persist the user's message and run the tool loop to a final answer or
    /// an approval pause. One turn per conversation at a time.
    #[instrument(skip(self, text, sink), fields(conversation_id = %conversation_id))]
    pub async fn run_turn(
        &self,
        conversation_id: &ConversationId,
        text: &str,
        mode: CallMode,
        sink: &dyn StreamSink,
    ) -> Result<TurnOutcome, EngineError> {
        let turn = self.begin_turn(conversation_id)?;
        if self.conversations.ensure(conversation_id, None, ConversationKind::Primary)? {
            info!("conversation created");
        }
        if let Some(pending) = self.approvals.pending(Some(conversation_id))?.first() {
            return Err(EngineError::ApprovalPending(pending.id.clone()));
        }
        self.conversations
            .append_message(conversation_id, &Message::user_text(text))?;
        self.continue_turn(&turn, mode, sink).await
    }

    async fn continue_turn(
        &self,
        turn: &ActiveTurn<'_>,
        mode: CallMode,
        sink: &dyn StreamSink,
    ) -> Result<TurnOutcome, EngineError> {
        let req = TurnRequest {
            cancel: turn.cancel.clone(),
            strict_final: self.strict_final.get(&turn.conversation_id).map(|s| *s),
            ..TurnRequest::primary(turn.conversation_id.clone(), mode)
        };
        let sink = ForwardingSink {
            conversation_id: &turn.conversation_id,
            events: &self.events,
            inner: sink,
        };
        self.tool_loop.run(&req, &sink).await
    }

    /// Run a reminder or cron entry that came due as a turn in its
    /// conversation.
    pub async fn run_scheduled(&self, entry: &ScheduleEntry, sink: &dyn StreamSink) -> Result<TurnOutcome, EngineError> {
        let kind = if entry.is_cron() { "cron" } else { "reminder" };
        debug!(entry_id = %entry.id, kind, "running scheduled entry");
        self.run_turn(
            &entry.conversation_id,
            &format!("[{kind} {}] {}", entry.id, entry.text),
            CallMode::Blocking,
            sink,
        )
        .await
    }

    /// Cancel the conversation's in-flight turn. Returns false when none is
    /// running.
    pub fn abort(&self, conversation_id: &ConversationId) -> bool {
        match self.active_turns.get(conversation_id) {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn pending_approvals(&self, conversation_id: Option<&ConversationId>) -> Result<Vec<ApprovalRow>, EngineError> {
        self.approvals.pending(conversation_id)
    }

    /// Record the decision, feed the parked call's result back, and continue
    /// the owning turn once nothing else in it is parked.
    #[instrument(skip(self, sink), fields(approval_id = %approval_id))]
    pub async fn resolve_approval(
        &self,
        approval_id: &ApprovalId,
        decision: ApprovalDecision,
        sink: &dyn StreamSink,
    ) -> Result<ApprovalOutcome, EngineError> {
        let resolution = self.approvals.resolve(approval_id, decision).await?;
        if let Some(call) = &resolution.call {
            self.tool_loop.notices().flush(&call.conversation_id)?;
        }
        let role = match (&resolution.call, resolution.ready) {
            (Some(call), true) => Some((call.conversation_id.clone(), call.role.clone())),
            _ => None,
        };

        let turn = match role {
            Some((conversation_id, TurnRole::Primary)) => {
                let turn = self.begin_turn(&conversation_id)?;
                Some(self.continue_turn(&turn, CallMode::Streaming, sink).await?)
            }
            Some((_, TurnRole::Subagent { run_id })) => {
                self.subagents.resume(&run_id)?;
                None
            }
            None => None,
        };
        Ok(ApprovalOutcome { resolution, turn })
    }

    pub fn history(&self, conversation_id: &ConversationId) -> Result<Vec<StoredMessage>, EngineError> {
        Ok(self.conversations.stored_messages(conversation_id)?)
    }

    /// Startup recovery for subagent runs.
    pub fn recover(&self) -> Result<RecoveryReport, EngineError> {
        Ok(self.subagents.recover()?)
    }

    pub async fn test_provider(&self, name: &str) -> Result<CredentialTestReport, EngineError> {
        Ok(self.router.test_provider(name).await?)
    }

    pub async fn set_provider_enabled(&self, name: &str, enabled: bool) -> Result<ProviderRuntimeState, EngineError> {
        if !self.router.providers().iter().any(|p| p.name() == name) {
            return Err(RouterError::UnknownProvider(name.to_string()).into());
        }
        let state = self
            .router
            .health()
            .set_enabled(name, enabled)
            .await
            .map_err(RouterError::from)?;
        info!(provider = name, enabled, "provider toggled by operator");
        Ok(state)
    }

    /// Chain order with each provider's persisted state.
    pub async fn provider_states(&self) -> Result<Vec<(String, ProviderRuntimeState)>, EngineError> {
        let mut out = Vec::new();
        for provider in self.router.providers() {
            let state = self
                .router
                .health()
                .get_state(provider.name())
                .await
                .map_err(RouterError::from)?;
            out.push((provider.name().to_string(), state));
        }
        Ok(out)
    }

    pub fn shutdown(&self) {
        for entry in self.active_turns.iter() {
            entry.value().cancel();
        }
        self.subagents.shutdown();
    }
}
