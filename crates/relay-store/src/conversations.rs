use serde::{Deserialize, Serialize};
use tracing::instrument;

use relay_core::ids::ConversationId;
use relay_core::messages::Message;

use crate::database::{now, Database};
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Primary,
    Subagent,
}

impl std::fmt::Display for ConversationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Subagent => write!(f, "subagent"),
        }
    }
}

impl std::str::FromStr for ConversationKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(Self::Primary),
            "subagent" => Ok(Self::Subagent),
            other => Err(format!("unknown conversation kind: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationRow {
    pub id: ConversationId,
    pub parent_id: Option<ConversationId>,
    pub kind: ConversationKind,
    pub created_at: String,
    pub updated_at: String,
}

/// A stored message with its insertion sequence.
#[derive(Clone, Debug)]
pub struct StoredMessage {
    pub seq: i64,
    pub message: Message,
    pub created_at: String,
}

pub struct ConversationRepo {
    db: Database,
}

impl ConversationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert the conversation if it does not exist yet. Returns true when a
    /// row was created.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn ensure(
        &self,
        id: &ConversationId,
        parent_id: Option<&ConversationId>,
        kind: ConversationKind,
    ) -> Result<bool, StoreError> {
        let ts = now();
        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO conversations (id, parent_id, kind, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                rusqlite::params![
                    id.as_str(),
                    parent_id.map(|p| p.as_str()),
                    kind.to_string(),
                    ts,
                ],
            )?;
            Ok(inserted > 0)
        })
    }

    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn get(&self, id: &ConversationId) -> Result<ConversationRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, parent_id, kind, created_at, updated_at
                 FROM conversations WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_conversation(row),
                None => Err(StoreError::NotFound(format!("conversation {id}"))),
            }
        })
    }

    pub fn exists(&self, id: &ConversationId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM conversations WHERE id = ?1",
                [id.as_str()],
                |row| row.get(0),
            )?;
            Ok(n > 0)
        })
    }

    /// Append a message. The conversation must exist.
    #[instrument(skip(self, message), fields(conversation_id = %id, role = message.role()))]
    pub fn append_message(&self, id: &ConversationId, message: &Message) -> Result<i64, StoreError> {
        let payload = serde_json::to_string(message)?;
        let ts = now();
        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
                rusqlite::params![id.as_str(), ts],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("conversation {id}")));
            }
            conn.execute(
                "INSERT INTO messages (conversation_id, role, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id.as_str(), message.role(), payload, ts],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Messages in insertion order.
    pub fn messages(&self, id: &ConversationId) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .stored_messages(id)?
            .into_iter()
            .map(|m| m.message)
            .collect())
    }

    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn stored_messages(&self, id: &ConversationId) -> Result<Vec<StoredMessage>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, payload, created_at FROM messages
                 WHERE conversation_id = ?1 ORDER BY id ASC",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let raw: String = row_helpers::get(row, 1, "messages", "payload")?;
                let message: Message =
                    serde_json::from_str(&raw).map_err(|e| StoreError::CorruptRow {
                        table: "messages",
                        column: "payload",
                        detail: e.to_string(),
                    })?;
                out.push(StoredMessage {
                    seq: row_helpers::get(row, 0, "messages", "id")?,
                    message,
                    created_at: row_helpers::get(row, 2, "messages", "created_at")?,
                });
            }
            Ok(out)
        })
    }

    /// Messages appended after `after_seq`, used to collect a reply.
    pub fn messages_after(
        &self,
        id: &ConversationId,
        after_seq: i64,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self
            .stored_messages(id)?
            .into_iter()
            .filter(|m| m.seq > after_seq)
            .collect())
    }

    pub fn message_count(&self, id: &ConversationId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
                [id.as_str()],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
    }

    /// Delete every message of a conversation; the conversation row stays.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn delete_messages(&self, id: &ConversationId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM messages WHERE conversation_id = ?1",
                [id.as_str()],
            )?)
        })
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> Result<ConversationRow, StoreError> {
    let id: String = row_helpers::get(row, 0, "conversations", "id")?;
    let parent: Option<String> = row_helpers::get_opt(row, 1, "conversations", "parent_id")?;
    let kind: String = row_helpers::get(row, 2, "conversations", "kind")?;
    Ok(ConversationRow {
        id: ConversationId::from_raw(id),
        parent_id: parent.map(ConversationId::from_raw),
        kind: row_helpers::parse_enum(&kind, "conversations", "kind")?,
        created_at: row_helpers::get(row, 3, "conversations", "created_at")?,
        updated_at: row_helpers::get(row, 4, "conversations", "updated_at")?,
    })
}
