use rusqlite::Connection;
use tracing::instrument;

use crate::database::{now, Database};
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug)]
pub struct AllowlistEntry {
    pub binary: String,
    /// `settings` or `approval:<id>`.
    pub source: String,
    pub added_at: String,
}

/// Binaries approved for exec beyond the static settings list.
pub struct AllowlistRepo {
    db: Database,
}

impl AllowlistRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub fn add(&self, binary: &str, source: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| insert_binary(conn, binary, source))
    }

    pub fn contains(&self, binary: &str) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM exec_allowlist WHERE binary = ?1",
                [binary],
                |row| row.get(0),
            )?;
            Ok(n > 0)
        })
    }

    pub fn list(&self) -> Result<Vec<AllowlistEntry>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT binary, source, added_at FROM exec_allowlist ORDER BY binary")?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(AllowlistEntry {
                    binary: row_helpers::get(row, 0, "exec_allowlist", "binary")?,
                    source: row_helpers::get(row, 1, "exec_allowlist", "source")?,
                    added_at: row_helpers::get(row, 2, "exec_allowlist", "added_at")?,
                });
            }
            Ok(out)
        })
    }

    #[instrument(skip(self))]
    pub fn remove(&self, binary: &str) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM exec_allowlist WHERE binary = ?1", [binary])? > 0)
        })
    }
}

/// First writer wins; re-adding keeps the original source.
pub(crate) fn insert_binary(conn: &Connection, binary: &str, source: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO exec_allowlist (binary, source, added_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![binary, source, now()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_contains_remove() {
        let repo = AllowlistRepo::new(Database::in_memory().unwrap());
        repo.add("git", "settings").unwrap();
        repo.add("git", "approval:appr_1").unwrap();
        assert!(repo.contains("git").unwrap());

        let entries = repo.list().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].source, "settings");

        assert!(repo.remove("git").unwrap());
        assert!(!repo.remove("git").unwrap());
        assert!(!repo.contains("git").unwrap());
    }
}
