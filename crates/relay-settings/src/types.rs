//! Settings type definitions.
//!
//! Every section is `#[serde(rename_all = "camelCase", default)]`, so a user
//! file only needs the keys it changes.

use relay_core::provider::{ProviderCapabilities, ProviderKind};
use serde::{Deserialize, Serialize};

/// Root settings for the relay runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Fallback chain. Order in the file does not matter; `priority` does.
    pub providers: Vec<ProviderEndpointSettings>,
    pub router: RouterSettings,
    pub tool_loop: ToolLoopSettings,
    pub exec: ExecSettings,
    pub subagents: SubagentSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            providers: vec![
                ProviderEndpointSettings {
                    name: "anthropic".to_string(),
                    kind: ProviderKind::Anthropic,
                    priority: 0,
                    default_model: "claude-sonnet-4-20250514".to_string(),
                    base_url: None,
                    api_key_env: "ANTHROPIC_API_KEY".to_string(),
                    enabled: true,
                    capabilities: ProviderCapabilities {
                        streaming: true,
                        tools: true,
                        thinking: true,
                    },
                },
                ProviderEndpointSettings {
                    name: "openai".to_string(),
                    kind: ProviderKind::OpenaiCompatible,
                    priority: 1,
                    default_model: "gpt-4o".to_string(),
                    base_url: None,
                    api_key_env: "OPENAI_API_KEY".to_string(),
                    enabled: true,
                    capabilities: ProviderCapabilities::default(),
                },
            ],
            router: RouterSettings::default(),
            tool_loop: ToolLoopSettings::default(),
            exec: ExecSettings::default(),
            subagents: SubagentSettings::default(),
            storage: StorageSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

/// One entry in the fallback chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderEndpointSettings {
    pub name: String,
    pub kind: ProviderKind,
    /// Lower runs first. Ties keep file order.
    pub priority: u32,
    pub default_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Name of the env var holding the API key.
    pub api_key_env: String,
    /// Startup value of the operator toggle; the persisted toggle wins once set.
    pub enabled: bool,
    pub capabilities: ProviderCapabilities,
}

impl Default for ProviderEndpointSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: ProviderKind::OpenaiCompatible,
            priority: 100,
            default_model: String::new(),
            base_url: None,
            api_key_env: String::new(),
            enabled: true,
            capabilities: ProviderCapabilities::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterSettings {
    /// Only surface text inside `<final>` spans.
    pub strict_final: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolLoopSettings {
    pub max_iterations: u32,
    pub tool_timeout_secs: u64,
    pub max_turn_duration_secs: u64,
    pub system_prompt: Option<String>,
    /// Root for the files tool and the exec working directory.
    pub workspace_dir: Option<String>,
    pub skills_dir: Option<String>,
}

impl Default for ToolLoopSettings {
    fn default() -> Self {
        Self {
            max_iterations: 12,
            tool_timeout_secs: 60,
            max_turn_duration_secs: 600,
            system_prompt: None,
            workspace_dir: None,
            skills_dir: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecSettings {
    /// Binaries that run without approval.
    pub allowlist: Vec<String>,
    pub timeout_secs: u64,
    pub max_output_bytes: usize,
}

impl Default for ExecSettings {
    fn default() -> Self {
        Self {
            allowlist: default_exec_allowlist(),
            timeout_secs: 30,
            max_output_bytes: 256 * 1024,
        }
    }
}

fn default_exec_allowlist() -> Vec<String> {
    [
        "awk", "cat", "cut", "date", "echo", "find", "git", "grep", "head", "ls", "pwd", "printf",
        "sort", "stat", "tail", "tr", "uniq", "wc", "which",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubagentSettings {
    pub max_concurrent: usize,
    pub archive_after_secs: u64,
    pub default_run_timeout_secs: u64,
}

impl Default for SubagentSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            archive_after_secs: 3600,
            default_run_timeout_secs: 600,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// Relative paths resolve against `~/.relay`.
    pub database_path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: "database/relay.db".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub log_to_sqlite: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_to_sqlite: true,
        }
    }
}
