//! In-memory provider health registry.
//!
//! Used in tests and when persistence is not wanted. Each provider has its own
//! lock so updates for one provider never wait on another.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use relay_core::health::{CallOutcome, HealthError, HealthRegistry, ProviderRuntimeState};

#[derive(Default)]
pub struct InMemoryHealthRegistry {
    entries: DashMap<String, Arc<Mutex<ProviderRuntimeState>>>,
}

impl InMemoryHealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a provider with a specific state.
    pub fn with_state(self, provider: &str, state: ProviderRuntimeState) -> Self {
        let _ = self
            .entries
            .insert(provider.to_string(), Arc::new(Mutex::new(state)));
        self
    }

    fn entry(&self, provider: &str) -> Arc<Mutex<ProviderRuntimeState>> {
        self.entries
            .entry(provider.to_string())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl HealthRegistry for InMemoryHealthRegistry {
    async fn get_state(&self, provider: &str) -> Result<ProviderRuntimeState, HealthError> {
        Ok(self.entry(provider).lock().clone())
    }

    async fn record_outcome(
        &self,
        provider: &str,
        outcome: CallOutcome,
    ) -> Result<ProviderRuntimeState, HealthError> {
        let entry = self.entry(provider);
        let mut state = entry.lock();
        let _ = state.apply(outcome);
        Ok(state.clone())
    }

    async fn set_enabled(
        &self,
        provider: &str,
        enabled: bool,
    ) -> Result<ProviderRuntimeState, HealthError> {
        let entry = self.entry(provider);
        let mut state = entry.lock();
        state.enabled = enabled;
        Ok(state.clone())
    }

    async fn snapshot(&self) -> Result<Vec<(String, ProviderRuntimeState)>, HealthError> {
        let mut out: Vec<_> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().lock().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}
