use serde::{Deserialize, Serialize};
use tracing::instrument;

use rusqlite::Connection;

use relay_core::ids::{ApprovalId, ConversationId, ToolCallId};
use relay_core::tools::TurnRole;

use crate::allowlist::insert_binary;
use crate::database::{now, Database};
use crate::error::StoreError;
use crate::resumable::{insert_call, take_call, ResumableCall};
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    ApprovedOnce,
    ApprovedAlways,
    Denied,
}

impl ApprovalStatus {
    pub fn is_approved(self) -> bool {
        matches!(self, Self::ApprovedOnce | Self::ApprovedAlways)
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::ApprovedOnce => write!(f, "approved_once"),
            Self::ApprovedAlways => write!(f, "approved_always"),
            Self::Denied => write!(f, "denied"),
        }
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved_once" => Ok(Self::ApprovedOnce),
            "approved_always" => Ok(Self::ApprovedAlways),
            "denied" => Ok(Self::Denied),
            other => Err(format!("unknown approval status: {other}")),
        }
    }
}

/// A human decision on a pending request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    ApprovedOnce,
    ApprovedAlways,
    Denied,
}

impl From<ApprovalDecision> for ApprovalStatus {
    fn from(d: ApprovalDecision) -> Self {
        match d {
            ApprovalDecision::ApprovedOnce => Self::ApprovedOnce,
            ApprovalDecision::ApprovedAlways => Self::ApprovedAlways,
            ApprovalDecision::Denied => Self::Denied,
        }
    }
}

impl std::fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        ApprovalStatus::from(*self).fmt(f)
    }
}

impl std::str::FromStr for ApprovalDecision {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved_once" | "once" => Ok(Self::ApprovedOnce),
            "approved_always" | "always" => Ok(Self::ApprovedAlways),
            "denied" | "deny" => Ok(Self::Denied),
            other => Err(format!("unknown approval decision: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApprovalRow {
    pub id: ApprovalId,
    pub conversation_id: ConversationId,
    pub command: String,
    pub binary: String,
    pub status: ApprovalStatus,
    pub created_at: String,
    pub decided_at: Option<String>,
}

pub struct ApprovalRepo {
    db: Database,
}

impl ApprovalRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, command), fields(conversation_id = %conversation_id, binary))]
    pub fn create(
        &self,
        conversation_id: &ConversationId,
        command: &str,
        binary: &str,
    ) -> Result<ApprovalRow, StoreError> {
        let id = ApprovalId::new();
        let ts = now();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO exec_approvals (id, conversation_id, command, binary, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
                rusqlite::params![id.as_str(), conversation_id.as_str(), command, binary, ts],
            )?;
            Ok(ApprovalRow {
                id,
                conversation_id: conversation_id.clone(),
                command: command.to_string(),
                binary: binary.to_string(),
                status: ApprovalStatus::Pending,
                created_at: ts,
                decided_at: None,
            })
        })
    }

    #[instrument(skip(self), fields(approval_id = %id))]
    pub fn get(&self, id: &ApprovalId) -> Result<ApprovalRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT} WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_approval(row),
                None => Err(StoreError::NotFound(format!("approval {id}"))),
            }
        })
    }

    /// Pending requests, oldest first. `None` lists every conversation.
    pub fn list_pending(
        &self,
        conversation_id: Option<&ConversationId>,
    ) -> Result<Vec<ApprovalRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT} WHERE status = 'pending'
                   AND (?1 IS NULL OR conversation_id = ?1)
                 ORDER BY created_at ASC, id ASC"
            ))?;
            let mut rows = stmt.query([conversation_id.map(|c| c.as_str())])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_approval(row)?);
            }
            Ok(out)
        })
    }

    /// Create a pending request together with the tool call it blocks.
    /// Both rows are written in one transaction.
    #[instrument(skip(self, command, call), fields(conversation_id = %conversation_id, binary))]
    pub fn create_parked(
        &self,
        conversation_id: &ConversationId,
        command: &str,
        binary: &str,
        call: ParkedCall,
    ) -> Result<(ApprovalRow, ResumableCall), StoreError> {
        let id = ApprovalId::new();
        let ts = now();
        let row = ApprovalRow {
            id: id.clone(),
            conversation_id: conversation_id.clone(),
            command: command.to_string(),
            binary: binary.to_string(),
            status: ApprovalStatus::Pending,
            created_at: ts.clone(),
            decided_at: None,
        };
        let resumable = ResumableCall {
            approval_id: id,
            conversation_id: conversation_id.clone(),
            tool_call_id: call.tool_call_id,
            tool_name: call.tool_name,
            arguments: call.arguments,
            role: call.role,
            created_at: ts,
        };
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO exec_approvals (id, conversation_id, command, binary, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
                rusqlite::params![
                    row.id.as_str(),
                    row.conversation_id.as_str(),
                    row.command,
                    row.binary,
                    row.created_at,
                ],
            )?;
            insert_call(&tx, &resumable)?;
            tx.commit()?;
            Ok(())
        })?;
        Ok((row, resumable))
    }

    /// Move a pending request to its decided status. Only one resolution can
    /// win: a second call fails with `Conflict`. `ApprovedAlways` adds the
    /// binary to the allowlist in the same transaction.
    #[instrument(skip(self), fields(approval_id = %id, decision = %decision))]
    pub fn resolve(
        &self,
        id: &ApprovalId,
        decision: ApprovalDecision,
    ) -> Result<ApprovalRow, StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let row = resolve_in(&tx, id, decision)?;
            tx.commit()?;
            Ok(row)
        })
    }

    /// `resolve`, plus removal of the parked tool call, atomically. The
    /// caller owns resuming the returned call.
    #[instrument(skip(self), fields(approval_id = %id, decision = %decision))]
    pub fn resolve_and_take(
        &self,
        id: &ApprovalId,
        decision: ApprovalDecision,
    ) -> Result<(ApprovalRow, Option<ResumableCall>), StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let row = resolve_in(&tx, id, decision)?;
            let call = take_call(&tx, id)?;
            tx.commit()?;
            Ok((row, call))
        })
    }
}

/// The tool call half of a parked request.
#[derive(Clone, Debug)]
pub struct ParkedCall {
    pub tool_call_id: ToolCallId,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub role: TurnRole,
}

fn resolve_in(
    conn: &Connection,
    id: &ApprovalId,
    decision: ApprovalDecision,
) -> Result<ApprovalRow, StoreError> {
    let updated = conn.execute(
        "UPDATE exec_approvals SET status = ?2, decided_at = ?3
         WHERE id = ?1 AND status = 'pending'",
        rusqlite::params![id.as_str(), ApprovalStatus::from(decision).to_string(), now()],
    )?;
    let row = {
        let mut stmt = conn.prepare(&format!("{SELECT} WHERE id = ?1"))?;
        let mut rows = stmt.query([id.as_str()])?;
        match rows.next()? {
            Some(row) => row_to_approval(row)?,
            None => return Err(StoreError::NotFound(format!("approval {id}"))),
        }
    };
    if updated == 0 {
        return Err(StoreError::Conflict(format!(
            "approval {id} already {}",
            row.status
        )));
    }
    if decision == ApprovalDecision::ApprovedAlways {
        insert_binary(conn, &row.binary, &format!("approval:{id}"))?;
    }
    Ok(row)
}

const SELECT: &str = "SELECT id, conversation_id, command, binary, status, created_at, decided_at
                      FROM exec_approvals";

fn row_to_approval(row: &rusqlite::Row<'_>) -> Result<ApprovalRow, StoreError> {
    let id: String = row_helpers::get(row, 0, "exec_approvals", "id")?;
    let conversation: String = row_helpers::get(row, 1, "exec_approvals", "conversation_id")?;
    let status: String = row_helpers::get(row, 4, "exec_approvals", "status")?;
    Ok(ApprovalRow {
        id: ApprovalId::from_raw(id),
        conversation_id: ConversationId::from_raw(conversation),
        command: row_helpers::get(row, 2, "exec_approvals", "command")?,
        binary: row_helpers::get(row, 3, "exec_approvals", "binary")?,
        status: row_helpers::parse_enum(&status, "exec_approvals", "status")?,
        created_at: row_helpers::get(row, 5, "exec_approvals", "created_at")?,
        decided_at: row_helpers::get_opt(row, 6, "exec_approvals", "decided_at")?,
    })
}
