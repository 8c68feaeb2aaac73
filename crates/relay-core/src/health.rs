use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisabledReason {
    #[default]
    None,
    Auth,
    Billing,
    Unknown,
}

impl fmt::Display for DisabledReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Auth => write!(f, "auth"),
            Self::Billing => write!(f, "billing"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for DisabledReason {
    type Err = std::convert::Infallible;

    /// Unrecognised values map to `Unknown` so older rows never fail to load.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "none" => Self::None,
            "auth" => Self::Auth,
            "billing" => Self::Billing,
            _ => Self::Unknown,
        })
    }
}

/// Failure class assigned by the router's classifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Transient,
    Auth,
    Billing,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient_error"),
            Self::Auth => write!(f, "auth_error"),
            Self::Billing => write!(f, "billing_error"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Success,
    TransientError,
    AuthError,
    BillingError,
}

impl From<FailureClass> for CallOutcome {
    fn from(class: FailureClass) -> Self {
        match class {
            FailureClass::Transient => Self::TransientError,
            FailureClass::Auth => Self::AuthError,
            FailureClass::Billing => Self::BillingError,
        }
    }
}

/// Persisted per-provider routing state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRuntimeState {
    pub enabled: bool,
    pub auto_disabled: bool,
    pub disabled_reason: DisabledReason,
}

impl Default for ProviderRuntimeState {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_disabled: false,
            disabled_reason: DisabledReason::None,
        }
    }
}

impl ProviderRuntimeState {
    pub fn is_eligible(&self) -> bool {
        self.enabled && !self.auto_disabled
    }

    /// Fold one call outcome into the state. Returns true when this outcome
    /// newly auto-disabled the provider.
    pub fn apply(&mut self, outcome: CallOutcome) -> bool {
        let was_disabled = self.auto_disabled;
        match outcome {
            CallOutcome::Success => {
                self.auto_disabled = false;
                self.disabled_reason = DisabledReason::None;
            }
            CallOutcome::TransientError => {}
            CallOutcome::AuthError => {
                self.auto_disabled = true;
                self.disabled_reason = DisabledReason::Auth;
            }
            CallOutcome::BillingError => {
                self.auto_disabled = true;
                self.disabled_reason = DisabledReason::Billing;
            }
        }
        self.auto_disabled && !was_disabled
    }
}

#[derive(Debug, thiserror::Error)]
#[error("health registry: {0}")]
pub struct HealthError(pub String);

/// Keyed store of [`ProviderRuntimeState`], injected into the router.
///
/// Implementations serialize updates per provider so concurrent outcome
/// recordings cannot interleave a read-modify-write.
#[async_trait]
pub trait HealthRegistry: Send + Sync {
    /// Missing entries are created with the default (enabled) state.
    async fn get_state(&self, provider: &str) -> Result<ProviderRuntimeState, HealthError>;

    async fn record_outcome(
        &self,
        provider: &str,
        outcome: CallOutcome,
    ) -> Result<ProviderRuntimeState, HealthError>;

    /// Operator toggle, independent of auto-disable.
    async fn set_enabled(
        &self,
        provider: &str,
        enabled: bool,
    ) -> Result<ProviderRuntimeState, HealthError>;

    async fn snapshot(&self) -> Result<Vec<(String, ProviderRuntimeState)>, HealthError>;
}
