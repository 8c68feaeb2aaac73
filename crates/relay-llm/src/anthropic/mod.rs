//! Anthropic Messages API adapter.

pub mod converter;
pub mod decoder;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing::instrument;

use relay_core::errors::ProviderError;
use relay_core::provider::{
    LlmProvider, ModelRequest, ProviderCapabilities, ProviderKind, ProviderStream,
};

use crate::classify::api_error_from_body;
use crate::sse::SseStream;

pub use decoder::AnthropicDecoder;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct AnthropicProvider {
    client: Client,
    name: String,
    model: String,
    base_url: String,
    api_key: Option<SecretString>,
    capabilities: ProviderCapabilities,
}

impl AnthropicProvider {
    pub fn new(
        name: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<SecretString>,
        capabilities: ProviderCapabilities,
    ) -> Self {
        Self {
            client: http_client(),
            name: name.into(),
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key,
            capabilities,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }
}

pub(crate) fn http_client() -> Client {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// A missing key is reported the way the backend would report a bad one,
/// so the classifier treats it as an auth failure.
pub(crate) fn missing_key_error(provider: &str) -> ProviderError {
    ProviderError::api(
        401,
        Some("missing_api_key".into()),
        format!("no API key configured for provider '{provider}'"),
    )
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities
    }

    #[instrument(skip(self, request), fields(provider = %self.name, model = %self.model))]
    async fn stream(&self, request: &ModelRequest) -> Result<ProviderStream, ProviderError> {
        let Some(key) = self.api_key.as_ref() else {
            return Err(missing_key_error(&self.name));
        };
        let model = request.model_override.as_deref().unwrap_or(&self.model);
        let body = converter::build_request_body(request, model, self.capabilities.thinking);

        let resp = self
            .client
            .post(self.endpoint())
            .header("x-api-key", key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .header("accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(api_error_from_body(status, &body));
        }

        Ok(Box::pin(SseStream::new(
            resp.bytes_stream(),
            AnthropicDecoder::new(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use relay_core::messages::Message;

    use super::*;

    #[tokio::test]
    async fn missing_key_is_auth_shaped() {
        let provider = AnthropicProvider::new(
            "anthropic",
            "claude-sonnet-4-20250514",
            None,
            ProviderCapabilities::default(),
        );
        let req = ModelRequest {
            messages: vec![Message::user_text("hi")],
            ..Default::default()
        };
        let err = match provider.stream(&req).await {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert_eq!(err.status(), Some(401));
        assert_eq!(err.code(), Some("missing_api_key"));
    }

    #[test]
    fn base_url_trailing_slash() {
        let provider = AnthropicProvider::new("a", "m", None, ProviderCapabilities::default())
            .with_base_url("http://localhost:8080/");
        assert_eq!(provider.endpoint(), "http://localhost:8080/v1/messages");
    }
}
