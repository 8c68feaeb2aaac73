//! Builds the provider chain from configuration.

use std::sync::Arc;

use relay_core::provider::{LlmProvider, ProviderKind};
use relay_settings::{CredentialStore, ResolvedProvider};
use tracing::{info, warn};

use crate::anthropic::AnthropicProvider;
use crate::openai::OpenAiCompatibleProvider;

/// Instantiate one adapter. `Generic` endpoints are spoken to over the
/// OpenAI-compatible wire format.
pub fn build_provider(resolved: ResolvedProvider) -> Arc<dyn LlmProvider> {
    let ResolvedProvider { endpoint, api_key } = resolved;
    if api_key.is_none() {
        warn!(
            provider = %endpoint.name,
            env = %endpoint.api_key_env,
            "no API key found; provider will fail with an auth error"
        );
    }
    match endpoint.kind {
        ProviderKind::Anthropic => {
            let mut p = AnthropicProvider::new(
                endpoint.name,
                endpoint.default_model,
                api_key,
                endpoint.capabilities,
            );
            if let Some(url) = endpoint.base_url {
                p = p.with_base_url(url);
            }
            Arc::new(p)
        }
        ProviderKind::OpenaiCompatible | ProviderKind::Generic => {
            let mut p = OpenAiCompatibleProvider::new(
                endpoint.name,
                endpoint.default_model,
                api_key,
                endpoint.capabilities,
            );
            if let Some(url) = endpoint.base_url {
                p = p.with_base_url(url);
            }
            Arc::new(p)
        }
    }
}

/// Enabled providers in priority order.
pub fn build_chain(store: &dyn CredentialStore) -> Vec<Arc<dyn LlmProvider>> {
    let chain: Vec<_> = store
        .get_enabled_providers_and_models()
        .into_iter()
        .map(build_provider)
        .collect();
    info!(
        providers = ?chain.iter().map(|p| p.name().to_string()).collect::<Vec<_>>(),
        "provider chain built"
    );
    chain
}
