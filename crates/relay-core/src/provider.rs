use std::fmt;
use std::pin::Pin;
use std::str::FromStr;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::errors::ProviderError;
use crate::messages::Message;
use crate::stream::ProviderEvent;
use crate::tools::ToolDefinition;

/// Wire family of a provider; selects the adapter and the error classifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Anthropic,
    OpenaiCompatible,
    /// Anything without a dedicated classifier (tests, local adapters).
    Generic,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anthropic => write!(f, "anthropic"),
            Self::OpenaiCompatible => write!(f, "openai_compatible"),
            Self::Generic => write!(f, "generic"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anthropic" => Ok(Self::Anthropic),
            "openai_compatible" | "openai" => Ok(Self::OpenaiCompatible),
            "generic" => Ok(Self::Generic),
            other => Err(format!("unknown provider kind: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderCapabilities {
    pub streaming: bool,
    pub tools: bool,
    pub thinking: bool,
}

impl Default for ProviderCapabilities {
    fn default() -> Self {
        Self {
            streaming: true,
            tools: true,
            thinking: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingLevel {
    #[default]
    Off,
    Low,
    Medium,
    High,
}

impl ThinkingLevel {
    /// Token budget handed to backends that take an explicit thinking budget.
    pub fn budget_tokens(self) -> Option<u32> {
        match self {
            Self::Off => None,
            Self::Low => Some(2_048),
            Self::Medium => Some(8_192),
            Self::High => Some(24_576),
        }
    }
}

impl fmt::Display for ThinkingLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

impl FromStr for ThinkingLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(Self::Off),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown thinking level: {other}")),
        }
    }
}

/// Everything a provider needs for one model call.
#[derive(Clone, Debug, Default)]
pub struct ModelRequest {
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub model_override: Option<String>,
    pub thinking: ThinkingLevel,
    pub max_tokens: Option<u32>,
    /// Per-turn strict final mode. `None` uses the router's default.
    pub strict_final: Option<bool>,
}

impl ModelRequest {
    pub fn wants_tools(&self) -> bool {
        !self.tools.is_empty()
    }
}

pub type ProviderStream = Pin<Box<dyn Stream<Item = ProviderEvent> + Send>>;

/// Implemented by each backend adapter (Anthropic, OpenAI-compatible, mock).
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> ProviderKind;
    fn model(&self) -> &str;
    fn capabilities(&self) -> ProviderCapabilities;

    /// Open a call. Errors returned here happen before any output was produced;
    /// failures after that arrive as [`ProviderEvent::Error`] on the stream.
    async fn stream(&self, request: &ModelRequest) -> Result<ProviderStream, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kind_round_trip() {
        for kind in [ProviderKind::Anthropic, ProviderKind::OpenaiCompatible, ProviderKind::Generic] {
            assert_eq!(kind.to_string().parse::<ProviderKind>().unwrap(), kind);
        }
        assert_eq!("openai".parse::<ProviderKind>().unwrap(), ProviderKind::OpenaiCompatible);
        assert!("gemini".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn capabilities_default_and_partial_json() {
        let caps: ProviderCapabilities = serde_json::from_str(r#"{"thinking": true}"#).unwrap();
        assert!(caps.streaming);
        assert!(caps.tools);
        assert!(caps.thinking);
    }

    #[test]
    fn thinking_budgets() {
        assert_eq!(ThinkingLevel::Off.budget_tokens(), None);
        assert!(ThinkingLevel::Low.budget_tokens() < ThinkingLevel::High.budget_tokens());
        assert_eq!("medium".parse::<ThinkingLevel>().unwrap(), ThinkingLevel::Medium);
    }

    #[test]
    fn request_wants_tools() {
        let mut req = ModelRequest::default();
        assert!(!req.wants_tools());
        req.tools.push(ToolDefinition {
            name: "exec".into(),
            description: "run".into(),
            parameters_schema: serde_json::json!({"type": "object"}),
        });
        assert!(req.wants_tools());
    }
}
