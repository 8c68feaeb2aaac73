use serde::{Deserialize, Serialize};

use crate::health::DisabledReason;
use crate::ids::{ApprovalId, ConversationId, RunId, ToolCallId};
use crate::stream::StreamEvent;

/// Runtime notifications broadcast to channel adapters.
/// Each one is sent only after the state change it reports has been persisted.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    Stream {
        conversation_id: ConversationId,
        event: StreamEvent,
    },
    ToolStarted {
        conversation_id: ConversationId,
        tool_call_id: ToolCallId,
        tool_name: String,
    },
    ToolFinished {
        conversation_id: ConversationId,
        tool_call_id: ToolCallId,
        is_error: bool,
        duration_ms: u64,
    },
    ApprovalRequested {
        conversation_id: ConversationId,
        approval_id: ApprovalId,
        command: String,
    },
    ApprovalResolved {
        approval_id: ApprovalId,
        decision: String,
    },
    SubagentSpawned {
        parent_conversation_id: ConversationId,
        run_id: RunId,
    },
    SubagentFinished {
        parent_conversation_id: ConversationId,
        run_id: RunId,
        status: String,
    },
    ProviderAutoDisabled {
        provider: String,
        reason: DisabledReason,
    },
}

impl RuntimeEvent {
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::Stream { conversation_id, .. }
            | Self::ToolStarted { conversation_id, .. }
            | Self::ToolFinished { conversation_id, .. }
            | Self::ApprovalRequested { conversation_id, .. } => Some(conversation_id),
            Self::SubagentSpawned { parent_conversation_id, .. }
            | Self::SubagentFinished { parent_conversation_id, .. } => Some(parent_conversation_id),
            Self::ApprovalResolved { .. } | Self::ProviderAutoDisabled { .. } => None,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Stream { .. } => "stream",
            Self::ToolStarted { .. } => "tool_started",
            Self::ToolFinished { .. } => "tool_finished",
            Self::ApprovalRequested { .. } => "approval_requested",
            Self::ApprovalResolved { .. } => "approval_resolved",
            Self::SubagentSpawned { .. } => "subagent_spawned",
            Self::SubagentFinished { .. } => "subagent_finished",
            Self::ProviderAutoDisabled { .. } => "provider_auto_disabled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subagent_events_route_to_parent() {
        let parent = ConversationId::new();
        let evt = RuntimeEvent::SubagentSpawned {
            parent_conversation_id: parent.clone(),
            run_id: RunId::new(),
        };
        assert_eq!(evt.conversation_id(), Some(&parent));
        assert_eq!(evt.event_type(), "subagent_spawned");
    }

    #[test]
    fn provider_events_have_no_conversation() {
        let evt = RuntimeEvent::ProviderAutoDisabled {
            provider: "anthropic".into(),
            reason: DisabledReason::Billing,
        };
        assert!(evt.conversation_id().is_none());
        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["type"], "provider_auto_disabled");
        assert_eq!(json["reason"], "billing");
    }

    #[test]
    fn stream_event_nests() {
        let evt = RuntimeEvent::Stream {
            conversation_id: ConversationId::new(),
            event: StreamEvent::TextStart { provider: "a".into() },
        };
        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["type"], "stream");
        assert_eq!(json["event"]["type"], "text_start");
        assert_eq!(json["type"], evt.event_type());
    }
}
