use serde::{Deserialize, Serialize};
use tracing::instrument;

use relay_core::ids::{ConversationId, RunId};
use relay_core::provider::ThinkingLevel;

use crate::database::{now, Database};
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentStatus {
    Spawned,
    Running,
    Completed,
    Failed,
    TimedOut,
    Interrupted,
    Archived,
}

impl SubagentStatus {
    pub const ACTIVE: [SubagentStatus; 2] = [Self::Spawned, Self::Running];
    pub const FINISHED: [SubagentStatus; 4] =
        [Self::Completed, Self::Failed, Self::TimedOut, Self::Interrupted];

    /// Counts toward the concurrency cap.
    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }

    /// Done but not yet archived.
    pub fn is_finished(self) -> bool {
        Self::FINISHED.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spawned => "spawned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Interrupted => "interrupted",
            Self::Archived => "archived",
        }
    }
}

impl std::fmt::Display for SubagentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubagentStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spawned" => Ok(Self::Spawned),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            "interrupted" => Ok(Self::Interrupted),
            "archived" => Ok(Self::Archived),
            other => Err(format!("unknown subagent status: {other}")),
        }
    }
}

/// What happens to the child transcript once the run finishes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cleanup {
    /// Archive after the configured delay.
    #[default]
    Keep,
    /// Archive as soon as the parent has its summary.
    Discard,
}

impl std::fmt::Display for Cleanup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Keep => write!(f, "keep"),
            Self::Discard => write!(f, "discard"),
        }
    }
}

impl std::str::FromStr for Cleanup {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep" => Ok(Self::Keep),
            "discard" => Ok(Self::Discard),
            other => Err(format!("unknown cleanup mode: {other}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct NewSubagentRun {
    pub parent_conversation_id: ConversationId,
    pub instructions: String,
    pub model_override: Option<String>,
    pub thinking_override: Option<ThinkingLevel>,
    pub cleanup: Cleanup,
    pub run_timeout_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubagentRunRow {
    pub id: RunId,
    pub parent_conversation_id: ConversationId,
    pub child_conversation_id: ConversationId,
    pub status: SubagentStatus,
    pub instructions: String,
    pub model_override: Option<String>,
    pub thinking_override: Option<ThinkingLevel>,
    pub cleanup: Cleanup,
    pub run_timeout_secs: u64,
    pub model_used: Option<String>,
    pub summary: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub finished_at: Option<String>,
    pub archive_due_at: Option<String>,
    pub archived_at: Option<String>,
}

/// Fields written alongside a status transition. `None` leaves the column as is.
#[derive(Clone, Debug, Default)]
pub struct RunUpdate {
    pub model_used: Option<String>,
    pub summary: Option<String>,
    pub error: Option<String>,
}

pub struct SubagentRunRepo {
    db: Database,
}

impl SubagentRunRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a run and its child conversation, unless `cap` runs are already
    /// active. The count and the inserts share one transaction under the
    /// connection lock, so concurrent spawns cannot overshoot the cap.
    /// Returns `None` when at capacity; nothing is written in that case.
    #[instrument(skip(self, new), fields(parent = %new.parent_conversation_id, cap))]
    pub fn insert_if_below_cap(
        &self,
        new: &NewSubagentRun,
        cap: usize,
    ) -> Result<Option<SubagentRunRow>, StoreError> {
        let id = RunId::new();
        let child = ConversationId::new();
        let ts = now();
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let active: i64 = tx.query_row(
                "SELECT COUNT(*) FROM subagent_runs WHERE status IN ('spawned', 'running')",
                [],
                |row| row.get(0),
            )?;
            if active as usize >= cap {
                return Ok(None);
            }

            tx.execute(
                "INSERT INTO conversations (id, parent_id, kind, created_at, updated_at)
                 VALUES (?1, ?2, 'subagent', ?3, ?3)",
                rusqlite::params![child.as_str(), new.parent_conversation_id.as_str(), ts],
            )?;
            tx.execute(
                "INSERT INTO subagent_runs
                    (id, parent_conversation_id, child_conversation_id, status, instructions,
                     model_override, thinking_override, cleanup, run_timeout_secs, created_at)
                 VALUES (?1, ?2, ?3, 'spawned', ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    id.as_str(),
                    new.parent_conversation_id.as_str(),
                    child.as_str(),
                    new.instructions,
                    new.model_override,
                    new.thinking_override.map(|t| t.to_string()),
                    new.cleanup.to_string(),
                    new.run_timeout_secs as i64,
                    ts,
                ],
            )?;
            tx.commit()?;

            Ok(Some(SubagentRunRow {
                id,
                parent_conversation_id: new.parent_conversation_id.clone(),
                child_conversation_id: child,
                status: SubagentStatus::Spawned,
                instructions: new.instructions.clone(),
                model_override: new.model_override.clone(),
                thinking_override: new.thinking_override,
                cleanup: new.cleanup,
                run_timeout_secs: new.run_timeout_secs,
                model_used: None,
                summary: None,
                error: None,
                created_at: ts,
                finished_at: None,
                archive_due_at: None,
                archived_at: None,
            }))
        })
    }

    #[instrument(skip(self), fields(run_id = %id))]
    pub fn get(&self, id: &RunId) -> Result<SubagentRunRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT} WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_run(row),
                None => Err(StoreError::NotFound(format!("subagent run {id}"))),
            }
        })
    }

    /// Runs in spawn order, optionally restricted to one parent.
    pub fn list(&self, parent: Option<&ConversationId>) -> Result<Vec<SubagentRunRow>, StoreError> {
        self.query(
            &format!(
                "{SELECT} WHERE (?1 IS NULL OR parent_conversation_id = ?1) ORDER BY created_at, id"
            ),
            &[parent.map(|p| p.as_str())],
        )
    }

    pub fn count_active(&self) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM subagent_runs WHERE status IN ('spawned', 'running')",
                [],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
    }

    /// Compare-and-set on status. Returns `None` (and writes nothing) when the
    /// current status is not in `from`, so a stop racing a completion leaves
    /// exactly one winner.
    #[instrument(skip(self, update), fields(run_id = %id, to = %to))]
    pub fn transition(
        &self,
        id: &RunId,
        from: &[SubagentStatus],
        to: SubagentStatus,
        update: RunUpdate,
    ) -> Result<Option<SubagentRunRow>, StoreError> {
        let finished_at = to.is_finished().then(now);
        self.db.with_conn(|conn| {
            let placeholders = (0..from.len())
                .map(|i| format!("?{}", i + 7))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "UPDATE subagent_runs SET
                    status = ?2,
                    model_used = COALESCE(?3, model_used),
                    summary = COALESCE(?4, summary),
                    error = COALESCE(?5, error),
                    finished_at = COALESCE(finished_at, ?6)
                 WHERE id = ?1 AND status IN ({placeholders})"
            );

            let mut values: Vec<Option<String>> = vec![
                Some(id.as_str().to_string()),
                Some(to.as_str().to_string()),
                update.model_used,
                update.summary,
                update.error,
                finished_at,
            ];
            values.extend(from.iter().map(|s| Some(s.as_str().to_string())));

            let changed = conn.execute(&sql, rusqlite::params_from_iter(values.iter()))?;
            if changed == 0 {
                return Ok(None);
            }
            let mut stmt = conn.prepare(&format!("{SELECT} WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_run(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Startup recovery: every spawned/running run becomes interrupted.
    #[instrument(skip(self))]
    pub fn mark_active_interrupted(&self) -> Result<Vec<RunId>, StoreError> {
        let ts = now();
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let ids: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM subagent_runs WHERE status IN ('spawned', 'running') ORDER BY created_at",
                )?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect::<Result<_, _>>()?
            };
            tx.execute(
                "UPDATE subagent_runs
                 SET status = 'interrupted',
                     error = COALESCE(error, 'interrupted by restart'),
                     finished_at = ?1
                 WHERE status IN ('spawned', 'running')",
                [&ts],
            )?;
            tx.commit()?;
            Ok(ids.into_iter().map(RunId::from_raw).collect())
        })
    }

    /// Finished runs still waiting for archival.
    pub fn list_unarchived_finished(&self) -> Result<Vec<SubagentRunRow>, StoreError> {
        self.query(
            &format!(
                "{SELECT} WHERE status IN ('completed', 'failed', 'timed_out', 'interrupted')
                 ORDER BY created_at, id"
            ),
            &[],
        )
    }

    #[instrument(skip(self), fields(run_id = %id))]
    pub fn set_archive_due(&self, id: &RunId, due_at: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE subagent_runs SET archive_due_at = ?2 WHERE id = ?1",
                rusqlite::params![id.as_str(), due_at],
            )?;
            Ok(())
        })
    }

    /// Mark a finished run archived and delete its child messages in the
    /// same transaction. Returns false when the run was not in a finished
    /// state (already archived, or still active).
    #[instrument(skip(self), fields(run_id = %id))]
    pub fn archive(&self, id: &RunId) -> Result<bool, StoreError> {
        let ts = now();
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let changed = tx.execute(
                "UPDATE subagent_runs SET status = 'archived', archived_at = ?2
                 WHERE id = ?1 AND status IN ('completed', 'failed', 'timed_out', 'interrupted')",
                rusqlite::params![id.as_str(), ts],
            )?;
            if changed == 0 {
                return Ok(false);
            }
            tx.execute(
                "DELETE FROM messages WHERE conversation_id =
                    (SELECT child_conversation_id FROM subagent_runs WHERE id = ?1)",
                [id.as_str()],
            )?;
            tx.commit()?;
            Ok(true)
        })
    }

    fn query(
        &self,
        sql: &str,
        params: &[Option<&str>],
    ) -> Result<Vec<SubagentRunRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_run(row)?);
            }
            Ok(out)
        })
    }
}

const SELECT: &str = "SELECT id, parent_conversation_id, child_conversation_id, status, instructions,
                             model_override, thinking_override, cleanup, run_timeout_secs, model_used,
                             summary, error, created_at, finished_at, archive_due_at, archived_at
                      FROM subagent_runs";

fn row_to_run(row: &rusqlite::Row<'_>) -> Result<SubagentRunRow, StoreError> {
    const T: &str = "subagent_runs";
    let id: String = row_helpers::get(row, 0, T, "id")?;
    let parent: String = row_helpers::get(row, 1, T, "parent_conversation_id")?;
    let child: String = row_helpers::get(row, 2, T, "child_conversation_id")?;
    let status: String = row_helpers::get(row, 3, T, "status")?;
    let thinking: Option<String> = row_helpers::get_opt(row, 6, T, "thinking_override")?;
    let cleanup: String = row_helpers::get(row, 7, T, "cleanup")?;
    let timeout: i64 = row_helpers::get(row, 8, T, "run_timeout_secs")?;
    Ok(SubagentRunRow {
        id: RunId::from_raw(id),
        parent_conversation_id: ConversationId::from_raw(parent),
        child_conversation_id: ConversationId::from_raw(child),
        status: row_helpers::parse_enum(&status, T, "status")?,
        instructions: row_helpers::get(row, 4, T, "instructions")?,
        model_override: row_helpers::get_opt(row, 5, T, "model_override")?,
        thinking_override: thinking
            .map(|t| row_helpers::parse_enum(&t, T, "thinking_override"))
            .transpose()?,
        cleanup: row_helpers::parse_enum(&cleanup, T, "cleanup")?,
        run_timeout_secs: timeout.max(0) as u64,
        model_used: row_helpers::get_opt(row, 9, T, "model_used")?,
        summary: row_helpers::get_opt(row, 10, T, "summary")?,
        error: row_helpers::get_opt(row, 11, T, "error")?,
        created_at: row_helpers::get(row, 12, T, "created_at")?,
        finished_at: row_helpers::get_opt(row, 13, T, "finished_at")?,
        archive_due_at: row_helpers::get_opt(row, 14, T, "archive_due_at")?,
        archived_at: row_helpers::get_opt(row, 15, T, "archived_at")?,
    })
}

#[cfg(test)]
mod tests {
    use relay_core::messages::Message;

    use super::*;
    use crate::conversations::{ConversationKind, ConversationRepo};

    fn setup() -> (Database, SubagentRunRepo, ConversationId) {
        let db = Database::in_memory().unwrap();
        let parent = ConversationId::new();
        ConversationRepo::new(db.clone())
            .ensure(&parent, None, ConversationKind::Primary)
            .unwrap();
        (db.clone(), SubagentRunRepo::new(db), parent)
    }

    fn new_run(parent: &ConversationId) -> NewSubagentRun {
        NewSubagentRun {
            parent_conversation_id: parent.clone(),
            instructions: "summarize the inbox".into(),
            model_override: Some("claude-haiku".into()),
            thinking_override: Some(ThinkingLevel::Low),
            cleanup: Cleanup::Keep,
            run_timeout_secs: 600,
        }
    }

    #[test]
    fn spawn_creates_child_conversation() {
        let (db, repo, parent) = setup();
        let run = repo.insert_if_below_cap(&new_run(&parent), 3).unwrap().unwrap();
        assert_eq!(run.status, SubagentStatus::Spawned);

        let child = ConversationRepo::new(db).get(&run.child_conversation_id).unwrap();
        assert_eq!(child.parent_id.as_ref(), Some(&parent));
        assert_eq!(child.kind, ConversationKind::Subagent);

        let loaded = repo.get(&run.id).unwrap();
        assert_eq!(loaded.thinking_override, Some(ThinkingLevel::Low));
        assert_eq!(loaded.model_override.as_deref(), Some("claude-haiku"));
        assert_eq!(loaded.run_timeout_secs, 600);
    }

    #[test]
    fn cap_rejects_without_writing() {
        let (_, repo, parent) = setup();
        for _ in 0..2 {
            assert!(repo.insert_if_below_cap(&new_run(&parent), 2).unwrap().is_some());
        }
        assert!(repo.insert_if_below_cap(&new_run(&parent), 2).unwrap().is_none());
        assert_eq!(repo.list(None).unwrap().len(), 2);
        assert_eq!(repo.count_active().unwrap(), 2);
    }

    #[test]
    fn finished_runs_free_capacity() {
        let (_, repo, parent) = setup();
        let run = repo.insert_if_below_cap(&new_run(&parent), 1).unwrap().unwrap();
        repo.transition(&run.id, &SubagentStatus::ACTIVE, SubagentStatus::Completed, RunUpdate::default())
            .unwrap()
            .unwrap();
        assert!(repo.insert_if_below_cap(&new_run(&parent), 1).unwrap().is_some());
    }

    #[test]
    fn transition_is_compare_and_set() {
        let (_, repo, parent) = setup();
        let run = repo.insert_if_below_cap(&new_run(&parent), 3).unwrap().unwrap();
        let running = repo
            .transition(&run.id, &[SubagentStatus::Spawned], SubagentStatus::Running, RunUpdate::default())
            .unwrap()
            .unwrap();
        assert_eq!(running.status, SubagentStatus::Running);
        assert!(running.finished_at.is_none());

        let done = repo
            .transition(
                &run.id,
                &SubagentStatus::ACTIVE,
                SubagentStatus::Completed,
                RunUpdate {
                    model_used: Some("m".into()),
                    summary: Some("all good".into()),
                    error: None,
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(done.summary.as_deref(), Some("all good"));
        assert!(done.finished_at.is_some());

        // A late stop loses the race.
        let stop = repo
            .transition(&run.id, &SubagentStatus::ACTIVE, SubagentStatus::Interrupted, RunUpdate::default())
            .unwrap();
        assert!(stop.is_none());
        assert_eq!(repo.get(&run.id).unwrap().status, SubagentStatus::Completed);
    }

    #[test]
    fn recovery_interrupts_active_runs() {
        let (_, repo, parent) = setup();
        let a = repo.insert_if_below_cap(&new_run(&parent), 3).unwrap().unwrap();
        let b = repo.insert_if_below_cap(&new_run(&parent), 3).unwrap().unwrap();
        repo.transition(&b.id, &[SubagentStatus::Spawned], SubagentStatus::Running, RunUpdate::default())
            .unwrap();
        let c = repo.insert_if_below_cap(&new_run(&parent), 3).unwrap().unwrap();
        repo.transition(&c.id, &SubagentStatus::ACTIVE, SubagentStatus::Failed, RunUpdate::default())
            .unwrap();

        let interrupted = repo.mark_active_interrupted().unwrap();
        assert_eq!(interrupted.len(), 2);
        assert!(interrupted.contains(&a.id));
        assert_eq!(repo.get(&b.id).unwrap().status, SubagentStatus::Interrupted);
        assert_eq!(repo.count_active().unwrap(), 0);

        let pending = repo.list_unarchived_finished().unwrap();
        assert_eq!(pending.len(), 3);
    }

    #[test]
    fn archive_deletes_child_messages_once() {
        let (db, repo, parent) = setup();
        let run = repo.insert_if_below_cap(&new_run(&parent), 3).unwrap().unwrap();
        let conversations = ConversationRepo::new(db);
        conversations
            .append_message(&run.child_conversation_id, &Message::user_text("task"))
            .unwrap();
        conversations
            .append_message(&parent, &Message::notice("subagent", "done"))
            .unwrap();

        // Active runs cannot be archived.
        assert!(!repo.archive(&run.id).unwrap());

        repo.transition(&run.id, &SubagentStatus::ACTIVE, SubagentStatus::Completed, RunUpdate::default())
            .unwrap();
        repo.set_archive_due(&run.id, "2026-01-01T00:00:00+00:00").unwrap();
        assert!(repo.archive(&run.id).unwrap());
        assert!(!repo.archive(&run.id).unwrap());

        let archived = repo.get(&run.id).unwrap();
        assert_eq!(archived.status, SubagentStatus::Archived);
        assert!(archived.archived_at.is_some());
        assert_eq!(archived.archive_due_at.as_deref(), Some("2026-01-01T00:00:00+00:00"));
        assert_eq!(conversations.message_count(&run.child_conversation_id).unwrap(), 0);
        assert_eq!(conversations.message_count(&parent).unwrap(), 1);
        assert!(repo.list_unarchived_finished().unwrap().is_empty());
    }

    #[test]
    fn list_filters_by_parent() {
        let (_, repo, parent) = setup();
        repo.insert_if_below_cap(&new_run(&parent), 3).unwrap();
        let other = ConversationId::new();
        repo.insert_if_below_cap(&new_run(&other), 3).unwrap();
        assert_eq!(repo.list(Some(&parent)).unwrap().len(), 1);
        assert_eq!(repo.list(None).unwrap().len(), 2);
    }

    #[test]
    fn status_helpers() {
        assert!(SubagentStatus::Running.is_active());
        assert!(SubagentStatus::Interrupted.is_finished());
        assert!(!SubagentStatus::Archived.is_finished());
        assert_eq!("timed_out".parse::<SubagentStatus>().unwrap(), SubagentStatus::TimedOut);
        assert_eq!(Cleanup::Discard.to_string(), "discard");
    }
}
