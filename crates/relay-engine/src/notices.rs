//! Notices written into a conversation by background work, such as subagent
//! summaries and replies.
//!
//! Providers require every assistant tool call to be answered by the very
//! next messages, so a notice is held while the conversation has a tool batch
//! executing or a call parked behind an approval, and written once the batch
//! is fully answered.

use dashmap::DashMap;
use tracing::{debug, error};

use relay_core::ids::ConversationId;
use relay_core::messages::Message;
use relay_store::{ConversationRepo, Database, ResumableCallRepo, StoreError};

#[derive(Default)]
struct Held {
    open_batches: usize,
    notices: Vec<Message>,
}

impl Held {
    fn is_idle(&self) -> bool {
        self.open_batches == 0 && self.notices.is_empty()
    }
}

pub struct NoticeBoard {
    conversations: ConversationRepo,
    resumable: ResumableCallRepo,
    held: DashMap<ConversationId, Held>,
}

impl NoticeBoard {
    pub fn new(db: Database) -> Self {
        Self {
            conversations: ConversationRepo::new(db.clone()),
            resumable: ResumableCallRepo::new(db),
            held: DashMap::new(),
        }
    }

    fn has_parked(&self, conversation_id: &ConversationId) -> Result<bool, StoreError> {
        Ok(!self.resumable.list_for_conversation(conversation_id)?.is_empty())
    }

    /// Append `notice` now, or hold it until the open batch is answered.
    pub fn post(&self, conversation_id: &ConversationId, notice: Message) -> Result<(), StoreError> {
        // The entry stays locked across the append so a batch cannot open
        // between the check and the write.
        let mut held = self.held.entry(conversation_id.clone()).or_default();
        if held.open_batches > 0 || !held.notices.is_empty() || self.has_parked(conversation_id)? {
            debug!(conversation_id = %conversation_id, "holding notice until the tool batch is answered");
            held.notices.push(notice);
            return Ok(());
        }
        let result = self.conversations.append_message(conversation_id, &notice);
        drop(held);
        self.held.remove_if(conversation_id, |_, h| h.is_idle());
        result.map(|_| ())
    }

    /// Mark a tool batch as executing. Call before the assistant message that
    /// carries the calls is persisted.
    pub fn open_batch(&self, conversation_id: &ConversationId) -> BatchGuard<'_> {
        self.held
            .entry(conversation_id.clone())
            .or_default()
            .open_batches += 1;
        BatchGuard {
            board: self,
            conversation_id: conversation_id.clone(),
        }
    }

    /// Write held notices if nothing in the conversation is executing or
    /// parked. Returns how many were written.
    pub fn flush(&self, conversation_id: &ConversationId) -> Result<usize, StoreError> {
        let written = match self.held.get_mut(conversation_id) {
            Some(mut held) => self.write_held(conversation_id, &mut held)?,
            None => 0,
        };
        self.held.remove_if(conversation_id, |_, h| h.is_idle());
        Ok(written)
    }

    fn write_held(&self, conversation_id: &ConversationId, held: &mut Held) -> Result<usize, StoreError> {
        if held.open_batches > 0 || held.notices.is_empty() || self.has_parked(conversation_id)? {
            return Ok(0);
        }
        let mut written = 0;
        while written < held.notices.len() {
            if let Err(e) = self.conversations.append_message(conversation_id, &held.notices[written]) {
                held.notices.drain(..written);
                return Err(e);
            }
            written += 1;
        }
        held.notices.clear();
        debug!(conversation_id = %conversation_id, written, "held notices written");
        Ok(written)
    }

    fn close_batch(&self, conversation_id: &ConversationId) {
        if let Some(mut held) = self.held.get_mut(conversation_id) {
            held.open_batches = held.open_batches.saturating_sub(1);
        }
        if let Err(e) = self.flush(conversation_id) {
            error!(conversation_id = %conversation_id, error = %e, "failed to write held notices");
        }
    }
}

/// Closes the batch on drop and writes any notices that arrived meanwhile.
pub struct BatchGuard<'a> {
    board: &'a NoticeBoard,
    conversation_id: ConversationId,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        self.board.close_batch(&self.conversation_id);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use relay_core::ids::ToolCallId;
    use relay_core::tools::TurnRole;
    use relay_store::{ApprovalDecision, ApprovalRepo, ConversationKind, ParkedCall};

    use super::*;

    fn setup() -> (NoticeBoard, ConversationRepo, Database, ConversationId) {
        let db = Database::in_memory().unwrap();
        let conv = ConversationId::new();
        let repo = ConversationRepo::new(db.clone());
        repo.ensure(&conv, None, ConversationKind::Primary).unwrap();
        repo.append_message(&conv, &Message::user_text("hi")).unwrap();
        (NoticeBoard::new(db.clone()), repo, db, conv)
    }

    fn roles(repo: &ConversationRepo, conv: &ConversationId) -> Vec<&'static str> {
        repo.messages(conv).unwrap().iter().map(|m| m.role()).collect()
    }

    #[test]
    fn idle_conversation_gets_notice_immediately() {
        let (board, repo, _db, conv) = setup();
        board.post(&conv, Message::notice("subagent", "done")).unwrap();
        assert_eq!(roles(&repo, &conv), ["user", "notice"]);
        assert!(board.held.is_empty());
    }

    #[test]
    fn notice_waits_for_open_batch() {
        let (board, repo, _db, conv) = setup();
        let batch = board.open_batch(&conv);
        board.post(&conv, Message::notice("subagent", "first")).unwrap();
        board.post(&conv, Message::notice("subagent", "second")).unwrap();
        assert_eq!(roles(&repo, &conv), ["user"]);

        drop(batch);
        let messages = repo.messages(&conv).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].text(), "first");
        assert_eq!(messages[2].text(), "second");
        assert!(board.held.is_empty());
    }

    #[test]
    fn parked_call_keeps_notice_until_flushed() {
        let (board, repo, db, conv) = setup();
        let approvals = ApprovalRepo::new(db);
        let (approval, _) = approvals
            .create_parked(
                &conv,
                "curl x",
                "curl",
                ParkedCall {
                    tool_call_id: ToolCallId::new(),
                    tool_name: "exec".into(),
                    arguments: json!({"command": "curl x"}),
                    role: TurnRole::Primary,
                },
            )
            .unwrap();

        board.post(&conv, Message::notice("subagent", "done")).unwrap();
        assert_eq!(board.flush(&conv).unwrap(), 0);
        assert_eq!(roles(&repo, &conv), ["user"]);

        approvals
            .resolve_and_take(&approval.id, ApprovalDecision::Denied)
            .unwrap();
        assert_eq!(board.flush(&conv).unwrap(), 1);
        assert_eq!(roles(&repo, &conv), ["user", "notice"]);
    }
}
