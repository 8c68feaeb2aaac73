use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use relay_core::ids::{ApprovalId, ConversationId, ToolCallId};
use relay_core::tools::TurnRole;

use crate::database::{now, Database};
use crate::error::StoreError;
use crate::row_helpers;

/// A tool call parked behind an approval request, keyed by approval id.
/// Resuming is a lookup plus a delete.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResumableCall {
    pub approval_id: ApprovalId,
    pub conversation_id: ConversationId,
    pub tool_call_id: ToolCallId,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub role: TurnRole,
    pub created_at: String,
}

pub struct ResumableCallRepo {
    db: Database,
}

impl ResumableCallRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, arguments, role), fields(approval_id = %approval_id, tool = tool_name))]
    pub fn save(
        &self,
        approval_id: &ApprovalId,
        conversation_id: &ConversationId,
        tool_call_id: &ToolCallId,
        tool_name: &str,
        arguments: &serde_json::Value,
        role: &TurnRole,
    ) -> Result<ResumableCall, StoreError> {
        let call = ResumableCall {
            approval_id: approval_id.clone(),
            conversation_id: conversation_id.clone(),
            tool_call_id: tool_call_id.clone(),
            tool_name: tool_name.to_string(),
            arguments: arguments.clone(),
            role: role.clone(),
            created_at: now(),
        };
        self.db.with_conn(|conn| insert_call(conn, &call))?;
        Ok(call)
    }

    pub fn get(&self, approval_id: &ApprovalId) -> Result<Option<ResumableCall>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT} WHERE approval_id = ?1"))?;
            let mut rows = stmt.query([approval_id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_call(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Remove and return the parked call. A second `take` returns `None`,
    /// so a call is resumed at most once.
    #[instrument(skip(self), fields(approval_id = %approval_id))]
    pub fn take(&self, approval_id: &ApprovalId) -> Result<Option<ResumableCall>, StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let call = take_call(&tx, approval_id)?;
            tx.commit()?;
            Ok(call)
        })
    }

    pub fn list_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<ResumableCall>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT} WHERE conversation_id = ?1 ORDER BY created_at ASC"
            ))?;
            let mut rows = stmt.query([conversation_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_call(row)?);
            }
            Ok(out)
        })
    }
}

pub(crate) fn insert_call(conn: &Connection, call: &ResumableCall) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO resumable_tool_calls
            (approval_id, conversation_id, tool_call_id, tool_name, arguments, role, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            call.approval_id.as_str(),
            call.conversation_id.as_str(),
            call.tool_call_id.as_str(),
            call.tool_name,
            serde_json::to_string(&call.arguments)?,
            serde_json::to_string(&call.role)?,
            call.created_at,
        ],
    )?;
    Ok(())
}

pub(crate) fn take_call(
    conn: &Connection,
    approval_id: &ApprovalId,
) -> Result<Option<ResumableCall>, StoreError> {
    let call = {
        let mut stmt = conn.prepare(&format!("{SELECT} WHERE approval_id = ?1"))?;
        let mut rows = stmt.query([approval_id.as_str()])?;
        match rows.next()? {
            Some(row) => Some(row_to_call(row)?),
            None => None,
        }
    };
    if call.is_some() {
        conn.execute(
            "DELETE FROM resumable_tool_calls WHERE approval_id = ?1",
            [approval_id.as_str()],
        )?;
    }
    Ok(call)
}

const SELECT: &str = "SELECT approval_id, conversation_id, tool_call_id, tool_name, arguments, role, created_at
                      FROM resumable_tool_calls";

fn row_to_call(row: &rusqlite::Row<'_>) -> Result<ResumableCall, StoreError> {
    const T: &str = "resumable_tool_calls";
    let approval_id: String = row_helpers::get(row, 0, T, "approval_id")?;
    let conversation_id: String = row_helpers::get(row, 1, T, "conversation_id")?;
    let tool_call_id: String = row_helpers::get(row, 2, T, "tool_call_id")?;
    let arguments: String = row_helpers::get(row, 4, T, "arguments")?;
    let role: String = row_helpers::get(row, 5, T, "role")?;
    Ok(ResumableCall {
        approval_id: ApprovalId::from_raw(approval_id),
        conversation_id: ConversationId::from_raw(conversation_id),
        tool_call_id: ToolCallId::from_raw(tool_call_id),
        tool_name: row_helpers::get(row, 3, T, "tool_name")?,
        arguments: row_helpers::parse_json(&arguments, T, "arguments")?,
        role: serde_json::from_str(&role).map_err(|e| StoreError::CorruptRow {
            table: T,
            column: "role",
            detail: e.to_string(),
        })?,
        created_at: row_helpers::get(row, 6, T, "created_at")?,
    })
}
