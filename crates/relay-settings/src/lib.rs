//! Layered configuration for the relay runtime.
//!
//! Compiled defaults, then `~/.relay/settings.json`, then `RELAY_*`
//! environment variables.

#![deny(unsafe_code)]

pub mod credentials;
pub mod errors;
pub mod loader;
pub mod types;

pub use credentials::{CredentialStore, ResolvedProvider, SettingsCredentialStore};
pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, relay_home, resolve_path, settings_path};
pub use types::*;

use std::sync::OnceLock;

static SETTINGS: OnceLock<RelaySettings> = OnceLock::new();

/// Global settings, loaded on first access. Falls back to defaults if the
/// file cannot be loaded.
pub fn get_settings() -> &'static RelaySettings {
    SETTINGS.get_or_init(|| match load_settings() {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load settings, using defaults");
            RelaySettings::default()
        }
    })
}

/// Returns the settings back if the global was already initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: RelaySettings) -> std::result::Result<(), RelaySettings> {
    SETTINGS.set(settings)
}
