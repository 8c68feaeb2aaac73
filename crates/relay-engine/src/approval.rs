//! Resolving exec approvals and replaying the parked call.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use relay_core::events::RuntimeEvent;
use relay_core::ids::{ApprovalId, ConversationId};
use relay_core::messages::Message;
use relay_core::tools::{ToolContext, ToolError};
use relay_store::{
    ApprovalDecision, ApprovalRepo, ApprovalRow, ConversationRepo, Database, ResumableCall,
    ResumableCallRepo, StoreError,
};

use crate::error::EngineError;
use crate::exec::ExecTool;

/// What a resolution did to the conversation that owned the call.
#[derive(Debug)]
pub struct Resolution {
    pub approval: ApprovalRow,
    /// The parked call whose result was just appended.
    pub call: Option<ResumableCall>,
    /// True when no other call in the conversation is still parked, so the
    /// tool loop can continue.
    pub ready: bool,
}

pub struct ApprovalService {
    approvals: ApprovalRepo,
    resumable: ResumableCallRepo,
    conversations: ConversationRepo,
    exec: Arc<ExecTool>,
    events: broadcast::Sender<RuntimeEvent>,
    working_directory: PathBuf,
}

impl ApprovalService {
    pub fn new(
        db: Database,
        exec: Arc<ExecTool>,
        events: broadcast::Sender<RuntimeEvent>,
        working_directory: PathBuf,
    ) -> Self {
        Self {
            approvals: ApprovalRepo::new(db.clone()),
            resumable: ResumableCallRepo::new(db.clone()),
            conversations: ConversationRepo::new(db),
            exec,
            events,
            working_directory,
        }
    }

    pub fn pending(&self, conversation_id: Option<&ConversationId>) -> Result<Vec<ApprovalRow>, EngineError> {
        Ok(self.approvals.list_pending(conversation_id)?)
    }

    /// Record the decision, then feed the parked call's outcome back into its
    /// conversation as an ordinary tool result.
    #[instrument(skip(self), fields(approval_id = %id, decision = %decision))]
    pub async fn resolve(
        &self,
        id: &ApprovalId,
        decision: ApprovalDecision,
    ) -> Result<Resolution, EngineError> {
        let (approval, call) = self
            .approvals
            .resolve_and_take(id, decision)
            .map_err(|e| match e {
                StoreError::NotFound(_) => EngineError::ApprovalNotFound(id.clone()),
                StoreError::Conflict(_) => EngineError::ApprovalAlreadyResolved(id.clone()),
                other => other.into(),
            })?;
        info!(binary = %approval.binary, "approval resolved");
        self.send_event(RuntimeEvent::ApprovalResolved {
            approval_id: id.clone(),
            decision: decision.to_string(),
        });

        let Some(call) = call else {
            return Ok(Resolution {
                approval,
                call: None,
                ready: false,
            });
        };

        let (content, is_error) = if approval.status.is_approved() {
            let ctx = ToolContext {
                conversation_id: call.conversation_id.clone(),
                tool_call_id: call.tool_call_id.clone(),
                role: call.role.clone(),
                working_directory: self.working_directory.clone(),
                abort_signal: CancellationToken::new(),
            };
            match self.exec.run_approved(&call.arguments, &ctx).await {
                Ok(result) => (result.content, result.is_error),
                Err(e) => (e.to_result_text(), true),
            }
        } else {
            (
                ToolError::NotPermitted(format!("`{}` was denied by the operator", approval.command))
                    .to_result_text(),
                true,
            )
        };

        self.conversations.append_message(
            &call.conversation_id,
            &Message::tool_result(call.tool_call_id.clone(), &call.tool_name, content, is_error),
        )?;
        self.send_event(RuntimeEvent::ToolFinished {
            conversation_id: call.conversation_id.clone(),
            tool_call_id: call.tool_call_id.clone(),
            is_error,
            duration_ms: 0,
        });

        let ready = self
            .resumable
            .list_for_conversation(&call.conversation_id)?
            .is_empty();
        Ok(Resolution {
            approval,
            call: Some(call),
            ready,
        })
    }

    fn send_event(&self, event: RuntimeEvent) {
        if self.events.send(event).is_err() {
            debug!("no event receivers, event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use relay_core::ids::ToolCallId;
    use relay_core::tools::{Tool, TurnRole};
    use relay_settings::ExecSettings;
    use relay_store::{AllowlistRepo, ConversationKind};

    use super::*;

    struct Fixture {
        db: Database,
        service: ApprovalService,
        exec: Arc<ExecTool>,
        conv: ConversationId,
    }

    fn fixture() -> Fixture {
        let db = Database::in_memory().unwrap();
        let conv = ConversationId::new();
        ConversationRepo::new(db.clone())
            .ensure(&conv, None, ConversationKind::Primary)
            .unwrap();
        let settings = ExecSettings {
            allowlist: vec!["echo".into()],
            ..Default::default()
        };
        let exec = Arc::new(ExecTool::new(&settings, db.clone()));
        let (tx, _) = broadcast::channel(16);
        let service = ApprovalService::new(db.clone(), exec.clone(), tx, std::env::temp_dir());
        Fixture {
            db,
            service,
            exec,
            conv,
        }
    }

    fn ctx(conv: &ConversationId) -> ToolContext {
        ToolContext {
            conversation_id: conv.clone(),
            tool_call_id: ToolCallId::new(),
            role: TurnRole::Primary,
            working_directory: std::env::temp_dir(),
            abort_signal: CancellationToken::new(),
        }
    }

    async fn park(f: &Fixture, args: Value) -> ApprovalId {
        match f.exec.execute(args, &ctx(&f.conv)).await {
            Err(ToolError::ApprovalRequired { approval_id, .. }) => approval_id,
            other => panic!("expected approval, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn approve_always_runs_call_and_allowlists_binary() {
        let f = fixture();
        let id = park(&f, json!({"command": "printf resumed"})).await;

        let res = f.service.resolve(&id, ApprovalDecision::ApprovedAlways).await.unwrap();
        assert!(res.ready);
        assert_eq!(res.call.unwrap().tool_name, "exec");

        let messages = ConversationRepo::new(f.db.clone()).messages(&f.conv).unwrap();
        assert_eq!(messages.last().unwrap().text(), "resumed");
        assert!(AllowlistRepo::new(f.db.clone()).contains("printf").unwrap());

        // The identical call now runs without a new request.
        let result = f
            .exec
            .execute(json!({"command": "printf resumed"}), &ctx(&f.conv))
            .await
            .unwrap();
        assert_eq!(result.content, "resumed");
        assert!(f.service.pending(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn denial_feeds_back_an_error_result() {
        let f = fixture();
        let id = park(&f, json!({"command": "printf nope"})).await;
        f.service.resolve(&id, ApprovalDecision::Denied).await.unwrap();

        let messages = ConversationRepo::new(f.db.clone()).messages(&f.conv).unwrap();
        let Message::ToolResult(tr) = messages.last().unwrap() else {
            panic!("expected tool result");
        };
        assert!(tr.is_error);
        assert!(tr.content.contains("denied by the operator"));
        assert!(!AllowlistRepo::new(f.db).contains("printf").unwrap());
    }

    #[tokio::test]
    async fn second_resolution_is_rejected() {
        let f = fixture();
        let id = park(&f, json!({"command": "printf once"})).await;
        f.service.resolve(&id, ApprovalDecision::ApprovedOnce).await.unwrap();
        let err = f.service.resolve(&id, ApprovalDecision::Denied).await.unwrap_err();
        assert!(matches!(err, EngineError::ApprovalAlreadyResolved(_)));

        let err = f
            .service
            .resolve(&ApprovalId::new(), ApprovalDecision::Denied)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ApprovalNotFound(_)));
    }

    #[tokio::test]
    async fn not_ready_while_another_call_is_parked() {
        let f = fixture();
        let first = park(&f, json!({"command": "printf a"})).await;
        let _second = park(&f, json!({"command": "printf b"})).await;
        let res = f.service.resolve(&first, ApprovalDecision::ApprovedOnce).await.unwrap();
        assert!(!res.ready);
    }
}
