//! Settings loading with deep merge and environment variable overrides.
//!
//! 1. compiled [`RelaySettings::default()`]
//! 2. `~/.relay/settings.json`, deep-merged over the defaults
//! 3. `RELAY_*` environment variables
//!
//! Objects merge per key, arrays and primitives are replaced, nulls in the
//! user file are skipped.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::RelaySettings;

/// `~/.relay`, or `/tmp/.relay` when `HOME` is unset.
pub fn relay_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".relay")
}

pub fn settings_path() -> PathBuf {
    relay_home().join("settings.json")
}

/// Resolve a possibly-relative path against `~/.relay`.
pub fn resolve_path(path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        relay_home().join(p)
    }
}

pub fn load_settings() -> Result<RelaySettings> {
    load_settings_from_path(&settings_path())
}

/// Missing file means defaults; malformed JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings> {
    let defaults = serde_json::to_value(RelaySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: RelaySettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

fn validate(settings: &RelaySettings) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for p in &settings.providers {
        if p.name.trim().is_empty() {
            return Err(SettingsError::InvalidValue("provider with empty name".into()));
        }
        if !seen.insert(p.name.as_str()) {
            return Err(SettingsError::InvalidValue(format!(
                "duplicate provider name: {}",
                p.name
            )));
        }
    }
    if settings.subagents.max_concurrent == 0 {
        return Err(SettingsError::InvalidValue(
            "subagents.maxConcurrent must be at least 1".into(),
        ));
    }
    Ok(())
}

/// Invalid values are logged and ignored, leaving the file/default value.
pub fn apply_env_overrides(settings: &mut RelaySettings) {
    if let Some(v) = read_env_string("RELAY_DB_PATH") {
        settings.storage.database_path = v;
    }
    if let Some(v) = read_env_string("RELAY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_usize("RELAY_MAX_SUBAGENTS", 1, 64) {
        settings.subagents.max_concurrent = v;
    }
    if let Some(v) = read_env_u64("RELAY_TOOL_TIMEOUT_SECS", 1, 3600) {
        settings.tool_loop.tool_timeout_secs = v;
    }
    if let Some(v) = read_env_u64("RELAY_MAX_TOOL_ITERATIONS", 1, 1000) {
        settings.tool_loop.max_iterations = v as u32;
    }
    if let Some(v) = read_env_bool("RELAY_STRICT_FINAL") {
        settings.router.strict_final = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers ─────────────────────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}
