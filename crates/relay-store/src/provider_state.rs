use async_trait::async_trait;
use rusqlite::{params, Connection};
use tracing::instrument;

use relay_core::health::{
    CallOutcome, DisabledReason, HealthError, HealthRegistry, ProviderRuntimeState,
};

use crate::database::{now, Database};
use crate::error::StoreError;
use crate::row_helpers;

/// Persisted `ProviderRuntimeState`, one row per provider name.
pub struct ProviderStateRepo {
    db: Database,
}

impl ProviderStateRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Returns the stored state, or the default (enabled) state without
    /// writing a row.
    #[instrument(skip(self))]
    pub fn get(&self, provider: &str) -> Result<ProviderRuntimeState, StoreError> {
        self.db
            .with_conn(|conn| Ok(load(conn, provider)?.unwrap_or_default()))
    }

    pub fn put(&self, provider: &str, state: &ProviderRuntimeState) -> Result<(), StoreError> {
        self.db.with_conn(|conn| store(conn, provider, state))
    }

    /// Fold an outcome into the stored state. The read and the write happen
    /// under one connection lock, so concurrent recordings serialize.
    #[instrument(skip(self), fields(provider = %provider))]
    pub fn apply_outcome(
        &self,
        provider: &str,
        outcome: CallOutcome,
    ) -> Result<ProviderRuntimeState, StoreError> {
        self.db.with_conn(|conn| {
            let mut state = load(conn, provider)?.unwrap_or_default();
            state.apply(outcome);
            store(conn, provider, &state)?;
            Ok(state)
        })
    }

    #[instrument(skip(self), fields(provider = %provider))]
    pub fn set_enabled(
        &self,
        provider: &str,
        enabled: bool,
    ) -> Result<ProviderRuntimeState, StoreError> {
        self.db.with_conn(|conn| {
            let mut state = load(conn, provider)?.unwrap_or_default();
            state.enabled = enabled;
            store(conn, provider, &state)?;
            Ok(state)
        })
    }

    pub fn list(&self) -> Result<Vec<(String, ProviderRuntimeState)>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT provider, enabled, auto_disabled, disabled_reason
                 FROM provider_state ORDER BY provider",
            )?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let name: String = row_helpers::get(row, 0, "provider_state", "provider")?;
                out.push((name, row_to_state(row, 1)?));
            }
            Ok(out)
        })
    }
}

fn load(conn: &Connection, provider: &str) -> Result<Option<ProviderRuntimeState>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT enabled, auto_disabled, disabled_reason FROM provider_state WHERE provider = ?1",
    )?;
    let mut rows = stmt.query([provider])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_state(row, 0)?)),
        None => Ok(None),
    }
}

fn store(conn: &Connection, provider: &str, state: &ProviderRuntimeState) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO provider_state (provider, enabled, auto_disabled, disabled_reason, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(provider) DO UPDATE SET
            enabled = excluded.enabled,
            auto_disabled = excluded.auto_disabled,
            disabled_reason = excluded.disabled_reason,
            updated_at = excluded.updated_at",
        params![
            provider,
            state.enabled,
            state.auto_disabled,
            state.disabled_reason.to_string(),
            now(),
        ],
    )?;
    Ok(())
}

fn row_to_state(row: &rusqlite::Row<'_>, offset: usize) -> Result<ProviderRuntimeState, StoreError> {
    let reason: String = row_helpers::get(row, offset + 2, "provider_state", "disabled_reason")?;
    Ok(ProviderRuntimeState {
        enabled: row_helpers::get(row, offset, "provider_state", "enabled")?,
        auto_disabled: row_helpers::get(row, offset + 1, "provider_state", "auto_disabled")?,
        disabled_reason: reason.parse().unwrap_or(DisabledReason::Unknown),
    })
}

/// `HealthRegistry` backed by the `provider_state` table, so auto-disable
/// survives restarts.
#[derive(Clone)]
pub struct SqliteHealthRegistry {
    db: Database,
}

impl SqliteHealthRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn repo(&self) -> ProviderStateRepo {
        ProviderStateRepo::new(self.db.clone())
    }
}

impl From<StoreError> for HealthError {
    fn from(e: StoreError) -> Self {
        HealthError(e.to_string())
    }
}

#[async_trait]
impl HealthRegistry for SqliteHealthRegistry {
    async fn get_state(&self, provider: &str) -> Result<ProviderRuntimeState, HealthError> {
        Ok(self.repo().get(provider)?)
    }

    async fn record_outcome(
        &self,
        provider: &str,
        outcome: CallOutcome,
    ) -> Result<ProviderRuntimeState, HealthError> {
        Ok(self.repo().apply_outcome(provider, outcome)?)
    }

    async fn set_enabled(
        &self,
        provider: &str,
        enabled: bool,
    ) -> Result<ProviderRuntimeState, HealthError> {
        Ok(self.repo().set_enabled(provider, enabled)?)
    }

    async fn snapshot(&self) -> Result<Vec<(String, ProviderRuntimeState)>, HealthError> {
        Ok(self.repo().list()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> ProviderStateRepo {
        ProviderStateRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn unknown_provider_is_default_and_not_written() {
        let repo = repo();
        assert_eq!(repo.get("anthropic").unwrap(), ProviderRuntimeState::default());
        assert!(repo.list().unwrap().is_empty());
    }

    #[test]
    fn auth_error_disables_and_success_clears() {
        let repo = repo();
        let state = repo.apply_outcome("anthropic", CallOutcome::AuthError).unwrap();
        assert!(state.auto_disabled);
        assert_eq!(repo.get("anthropic").unwrap().disabled_reason, DisabledReason::Auth);

        let state = repo.apply_outcome("anthropic", CallOutcome::Success).unwrap();
        assert!(state.is_eligible());
        assert_eq!(repo.get("anthropic").unwrap().disabled_reason, DisabledReason::None);
    }

    #[test]
    fn operator_toggle_is_independent() {
        let repo = repo();
        repo.apply_outcome("openai", CallOutcome::BillingError).unwrap();
        let state = repo.set_enabled("openai", false).unwrap();
        assert!(!state.enabled);
        assert!(state.auto_disabled);

        let state = repo.apply_outcome("openai", CallOutcome::Success).unwrap();
        assert!(!state.enabled);
        assert!(!state.auto_disabled);
        assert!(!state.is_eligible());
    }

    #[test]
    fn unknown_reason_loads_as_unknown() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO provider_state VALUES ('x', 1, 1, 'quota', '2026-01-01T00:00:00Z')",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        let state = ProviderStateRepo::new(db).get("x").unwrap();
        assert_eq!(state.disabled_reason, DisabledReason::Unknown);
    }

    #[tokio::test]
    async fn registry_persists_across_instances() {
        let db = Database::in_memory().unwrap();
        let registry = SqliteHealthRegistry::new(db.clone());
        registry.record_outcome("a", CallOutcome::BillingError).await.unwrap();
        registry.set_enabled("b", false).await.unwrap();

        let reopened = SqliteHealthRegistry::new(db);
        assert!(!reopened.get_state("a").await.unwrap().is_eligible());
        let snapshot = reopened.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].0, "a");
        assert!(!snapshot[1].1.enabled);
    }

    #[tokio::test]
    async fn concurrent_recordings_serialize() {
        let registry = std::sync::Arc::new(SqliteHealthRegistry::new(Database::in_memory().unwrap()));
        let mut handles = Vec::new();
        for i in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let outcome = if i % 2 == 0 { CallOutcome::TransientError } else { CallOutcome::AuthError };
                registry.record_outcome("p", outcome).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let state = registry.get_state("p").await.unwrap();
        assert!(state.auto_disabled);
        assert_eq!(state.disabled_reason, DisabledReason::Auth);
        assert_eq!(registry.snapshot().await.unwrap().len(), 1);
    }
}
