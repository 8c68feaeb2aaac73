//! Credential lookup for configured providers.

use std::collections::HashMap;

use secrecy::SecretString;

use crate::types::{ProviderEndpointSettings, RelaySettings};

/// A provider endpoint paired with its resolved API key.
#[derive(Debug)]
pub struct ResolvedProvider {
    pub endpoint: ProviderEndpointSettings,
    /// `None` when the named env var is unset; the adapter will then fail
    /// with an auth error on first use.
    pub api_key: Option<SecretString>,
}

/// Source of provider configuration consulted at router startup.
pub trait CredentialStore: Send + Sync {
    /// Enabled endpoints ordered by priority, ties in declaration order.
    fn get_enabled_providers_and_models(&self) -> Vec<ResolvedProvider>;
}

/// Reads endpoints from settings and keys from the process environment.
pub struct SettingsCredentialStore {
    providers: Vec<ProviderEndpointSettings>,
    env: EnvSource,
}

enum EnvSource {
    Process,
    Fixed(HashMap<String, String>),
}

impl SettingsCredentialStore {
    pub fn new(settings: &RelaySettings) -> Self {
        Self {
            providers: settings.providers.clone(),
            env: EnvSource::Process,
        }
    }

    /// Use a fixed key map instead of the process environment.
    pub fn with_keys(settings: &RelaySettings, keys: HashMap<String, String>) -> Self {
        Self {
            providers: settings.providers.clone(),
            env: EnvSource::Fixed(keys),
        }
    }

    fn lookup(&self, var: &str) -> Option<String> {
        if var.is_empty() {
            return None;
        }
        let value = match &self.env {
            EnvSource::Process => std::env::var(var).ok(),
            EnvSource::Fixed(map) => map.get(var).cloned(),
        };
        value.filter(|v| !v.trim().is_empty())
    }
}

impl CredentialStore for SettingsCredentialStore {
    fn get_enabled_providers_and_models(&self) -> Vec<ResolvedProvider> {
        let mut enabled: Vec<&ProviderEndpointSettings> =
            self.providers.iter().filter(|p| p.enabled).collect();
        enabled.sort_by_key(|p| p.priority);
        enabled
            .into_iter()
            .map(|endpoint| ResolvedProvider {
                endpoint: endpoint.clone(),
                api_key: self.lookup(&endpoint.api_key_env).map(SecretString::from),
            })
            .collect()
    }
}
