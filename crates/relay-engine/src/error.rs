use std::time::Duration;

use relay_core::ids::{ApprovalId, ConversationId, RunId};
use relay_llm::router::{AttemptRecord, RouterError};
use relay_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Every provider in the chain was skipped or failed.
    #[error("no model available right now")]
    AllProvidersUnavailable { attempts: Vec<AttemptRecord> },

    #[error("router error: {0}")]
    Router(RouterError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("tool loop exceeded {0} iterations")]
    ToolLoopExceeded(u32),

    #[error("turn timed out after {0:?}")]
    TurnTimeout(Duration),

    #[error("turn aborted")]
    Aborted,

    #[error("approval not found: {0}")]
    ApprovalNotFound(ApprovalId),

    #[error("approval already resolved: {0}")]
    ApprovalAlreadyResolved(ApprovalId),

    /// The conversation has tool calls parked behind unresolved approvals.
    #[error("conversation is waiting on approval {0}")]
    ApprovalPending(ApprovalId),

    #[error("conversation {0} already has a turn in progress")]
    ConversationBusy(ConversationId),

    #[error(transparent)]
    Subagent(#[from] SubagentError),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AllProvidersUnavailable { .. } => "all_providers_unavailable",
            Self::Router(_) => "router",
            Self::Store(_) => "store",
            Self::ToolLoopExceeded(_) => "tool_loop_exceeded",
            Self::TurnTimeout(_) => "turn_timeout",
            Self::Aborted => "aborted",
            Self::ApprovalNotFound(_) => "approval_not_found",
            Self::ApprovalAlreadyResolved(_) => "approval_already_resolved",
            Self::ApprovalPending(_) => "approval_pending",
            Self::ConversationBusy(_) => "conversation_busy",
            Self::Subagent(e) => e.kind(),
            Self::Internal(_) => "internal",
        }
    }
}

impl From<RouterError> for EngineError {
    fn from(e: RouterError) -> Self {
        match e {
            RouterError::AllProvidersUnavailable { attempts } => {
                Self::AllProvidersUnavailable { attempts }
            }
            other => Self::Router(other),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubagentError {
    /// Surfaced to the caller as is; the orchestrator never retries.
    #[error("subagent capacity reached ({cap} running)")]
    Busy { cap: usize },

    #[error("subagent run not found: {0}")]
    NotFound(RunId),

    #[error("subagent run {0} is archived")]
    Archived(RunId),

    #[error("subagent turns cannot manage subagents")]
    NotPermitted,

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("subagent runtime is shutting down")]
    Unavailable,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl SubagentError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Busy { .. } => "subagent_busy",
            Self::NotFound(_) => "subagent_not_found",
            Self::Archived(_) => "subagent_archived",
            Self::NotPermitted => "subagent_not_permitted",
            Self::Timeout(_) => "subagent_timeout",
            Self::Unavailable => "subagent_unavailable",
            Self::Store(_) => "store",
        }
    }
}
