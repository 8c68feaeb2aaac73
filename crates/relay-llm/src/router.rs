//! Fallback router: fixed-priority provider chain with persisted health.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use relay_core::errors::ProviderError;
use relay_core::events::RuntimeEvent;
use relay_core::health::{
    CallOutcome, DisabledReason, FailureClass, HealthError, HealthRegistry, ProviderRuntimeState,
};
use relay_core::messages::{AssistantContent, AssistantMessage, Message, StopReason, TokenUsage};
use relay_core::provider::{LlmProvider, ModelRequest, ThinkingLevel};
use relay_core::stream::{NullSink, ProviderEvent, StreamEvent, StreamSink};

use crate::classify::ErrorClassifier;
use crate::normalize::{NormalizedOutput, StreamNormalizer};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallMode {
    /// Canonical events are forwarded to the sink as they are produced.
    Streaming,
    /// Events are produced internally only; the caller gets the final answer.
    Blocking,
}

/// Successful result of one routed call.
#[derive(Clone, Debug)]
pub struct FinalAnswer {
    pub provider: String,
    pub model: String,
    pub message: AssistantMessage,
    pub output: NormalizedOutput,
    pub usage: TokenUsage,
}

impl FinalAnswer {
    pub fn visible_text(&self) -> &str {
        &self.output.visible_text
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Operator-disabled or auto-disabled.
    Ineligible,
    /// The request needs a capability the provider lacks.
    MissingCapability(&'static str),
    Failed { class: FailureClass, message: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttemptRecord {
    pub provider: String,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("no model available right now")]
    AllProvidersUnavailable { attempts: Vec<AttemptRecord> },
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("health registry error: {0}")]
    Health(#[from] HealthError),
}

impl RouterError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AllProvidersUnavailable { .. } => "all_providers_unavailable",
            Self::UnknownProvider(_) => "unknown_provider",
            Self::Health(_) => "health_registry",
        }
    }
}

/// Outcome of an explicit credential test against one provider.
#[derive(Clone, Debug)]
pub struct CredentialTestReport {
    pub provider: String,
    pub error: Option<(FailureClass, String)>,
    pub state: ProviderRuntimeState,
}

impl CredentialTestReport {
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }
}

pub struct FallbackRouter {
    providers: Vec<Arc<dyn LlmProvider>>,
    health: Arc<dyn HealthRegistry>,
    strict_final: bool,
    events: Option<broadcast::Sender<RuntimeEvent>>,
}

impl FallbackRouter {
    /// `providers` must already be in priority order.
    pub fn new(providers: Vec<Arc<dyn LlmProvider>>, health: Arc<dyn HealthRegistry>) -> Self {
        Self {
            providers,
            health,
            strict_final: false,
            events: None,
        }
    }

    pub fn with_strict_final(mut self, strict_final: bool) -> Self {
        self.strict_final = strict_final;
        self
    }

    pub fn with_event_bus(mut self, events: broadcast::Sender<RuntimeEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn providers(&self) -> &[Arc<dyn LlmProvider>] {
        &self.providers
    }

    pub fn health(&self) -> &Arc<dyn HealthRegistry> {
        &self.health
    }

    pub fn strict_final(&self) -> bool {
        self.strict_final
    }

    /// Route one model call through the chain.
    #[instrument(skip_all, fields(mode = ?mode, messages = request.messages.len()))]
    pub async fn send(
        &self,
        request: &ModelRequest,
        mode: CallMode,
        sink: &dyn StreamSink,
    ) -> Result<FinalAnswer, RouterError> {
        let mut attempts = Vec::new();

        for provider in &self.providers {
            let name = provider.name().to_string();
            let state = self.health.get_state(&name).await?;
            if !state.is_eligible() {
                debug!(provider = %name, enabled = state.enabled, auto_disabled = state.auto_disabled, "skipping ineligible provider");
                attempts.push(AttemptRecord {
                    provider: name,
                    outcome: AttemptOutcome::Ineligible,
                });
                continue;
            }

            let caps = provider.capabilities();
            if request.wants_tools() && !caps.tools {
                debug!(provider = %name, "skipping provider without tool support");
                attempts.push(AttemptRecord {
                    provider: name,
                    outcome: AttemptOutcome::MissingCapability("tools"),
                });
                continue;
            }

            let degraded;
            let effective = if request.thinking != ThinkingLevel::Off && !caps.thinking {
                debug!(provider = %name, thinking = ?request.thinking, "provider lacks thinking support; dropping thinking level");
                degraded = ModelRequest {
                    thinking: ThinkingLevel::Off,
                    ..request.clone()
                };
                &degraded
            } else {
                request
            };

            let streaming = mode == CallMode::Streaming;
            let result = if streaming && caps.streaming {
                self.attempt(provider.as_ref(), effective, sink).await
            } else {
                // Buffer so nothing is forwarded until the call settles.
                let buffer = BufferSink::default();
                let result = self.attempt(provider.as_ref(), effective, &buffer).await;
                if streaming {
                    for event in buffer.take() {
                        sink.emit(event);
                    }
                }
                result
            };

            match result {
                Ok(answer) => {
                    self.record(&name, CallOutcome::Success, &state).await;
                    info!(provider = %name, model = %answer.model, "provider call succeeded");
                    return Ok(answer);
                }
                Err(err) => {
                    let class = ErrorClassifier::for_kind(provider.kind()).classify(&err);
                    self.record(&name, class.into(), &state).await;
                    if class == FailureClass::Transient {
                        warn!(provider = %name, error_kind = err.error_kind(), error = %err, "provider attempt failed, trying next provider");
                    }
                    attempts.push(AttemptRecord {
                        provider: name,
                        outcome: AttemptOutcome::Failed {
                            class,
                            message: err.to_string(),
                        },
                    });
                }
            }
        }

        warn!(attempts = attempts.len(), "all providers unavailable");
        Err(RouterError::AllProvidersUnavailable { attempts })
    }

    /// Send a minimal probe to one provider regardless of its health state
    /// and record the outcome. A passing test clears auto-disable.
    #[instrument(skip(self))]
    pub async fn test_provider(&self, name: &str) -> Result<CredentialTestReport, RouterError> {
        let provider = self
            .providers
            .iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| RouterError::UnknownProvider(name.to_string()))?;
        let before = self.health.get_state(name).await?;

        let probe = ModelRequest {
            messages: vec![Message::user_text("Reply with the single word OK.")],
            max_tokens: Some(16),
            ..Default::default()
        };
        let error = match self.attempt(provider.as_ref(), &probe, &NullSink).await {
            Ok(_) => {
                self.record(name, CallOutcome::Success, &before).await;
                None
            }
            Err(err) => {
                let class = ErrorClassifier::for_kind(provider.kind()).classify(&err);
                self.record(name, class.into(), &before).await;
                Some((class, err.to_string()))
            }
        };
        let state = self.health.get_state(name).await?;
        Ok(CredentialTestReport {
            provider: name.to_string(),
            error,
            state,
        })
    }

    /// One provider attempt. Failures before the stream opens emit no events;
    /// failures after it opens end with `message_end{failed}`.
    async fn attempt(
        &self,
        provider: &dyn LlmProvider,
        request: &ModelRequest,
        sink: &dyn StreamSink,
    ) -> Result<FinalAnswer, ProviderError> {
        let mut stream = provider.stream(request).await?;

        let strict_final = request.strict_final.unwrap_or(self.strict_final);
        let mut normalizer = StreamNormalizer::new(provider.name(), strict_final);
        emit_all(sink, normalizer.begin());

        let mut tool_calls = Vec::new();
        let mut usage = TokenUsage::default();
        let mut stop_reason = None;

        while let Some(event) = stream.next().await {
            match event {
                ProviderEvent::TextDelta(text) => emit_all(sink, normalizer.push_text(&text)),
                ProviderEvent::ReasoningDelta(text) => {
                    emit_all(sink, normalizer.push_reasoning(&text))
                }
                ProviderEvent::ToolCall(call) => tool_calls.push(call),
                ProviderEvent::Usage(u) => usage.add(&u),
                ProviderEvent::Done { stop_reason: reason } => {
                    stop_reason = Some(reason);
                    break;
                }
                ProviderEvent::Error(err) => {
                    emit_all(sink, normalizer.fail());
                    return Err(err);
                }
            }
        }

        let Some(mut stop_reason) = stop_reason else {
            emit_all(sink, normalizer.fail());
            return Err(ProviderError::StreamInterrupted(
                "stream ended without completion".into(),
            ));
        };
        emit_all(sink, normalizer.finish());

        if !tool_calls.is_empty() {
            stop_reason = StopReason::ToolUse;
        }
        let output = normalizer.into_output();
        let model = request
            .model_override
            .clone()
            .unwrap_or_else(|| provider.model().to_string());

        let mut content = Vec::new();
        if !output.reasoning.is_empty() {
            content.push(AssistantContent::Reasoning {
                text: output.reasoning.clone(),
            });
        }
        if !output.visible_text.is_empty() {
            content.push(AssistantContent::Text {
                text: output.visible_text.clone(),
            });
        }
        content.extend(tool_calls.into_iter().map(AssistantContent::ToolCall));

        Ok(FinalAnswer {
            provider: provider.name().to_string(),
            model: model.clone(),
            message: AssistantMessage {
                content,
                provider: Some(provider.name().to_string()),
                model: Some(model),
                usage: Some(usage),
                stop_reason: Some(stop_reason),
            },
            output,
            usage,
        })
    }

    /// Persist an outcome. A registry failure is logged, not propagated: the
    /// call result itself is still valid.
    async fn record(&self, provider: &str, outcome: CallOutcome, before: &ProviderRuntimeState) {
        let after = match self.health.record_outcome(provider, outcome).await {
            Ok(state) => state,
            Err(e) => {
                error!(provider, error = %e, "failed to record provider outcome");
                return;
            }
        };

        if after.auto_disabled && !before.auto_disabled {
            match after.disabled_reason {
                DisabledReason::Auth => warn!(
                    provider,
                    reason = %after.disabled_reason,
                    "provider auto-disabled: credentials rejected"
                ),
                DisabledReason::Billing => warn!(
                    provider,
                    reason = %after.disabled_reason,
                    "provider auto-disabled: billing or quota exhausted"
                ),
                DisabledReason::None | DisabledReason::Unknown => warn!(
                    provider,
                    reason = %after.disabled_reason,
                    "provider auto-disabled"
                ),
            }
            if let Some(tx) = &self.events {
                let _ = tx.send(RuntimeEvent::ProviderAutoDisabled {
                    provider: provider.to_string(),
                    reason: after.disabled_reason,
                });
            }
        } else if before.auto_disabled && !after.auto_disabled {
            info!(provider, "provider re-enabled after successful call");
        }
    }
}

fn emit_all(sink: &dyn StreamSink, events: Vec<StreamEvent>) {
    for event in events {
        sink.emit(event);
    }
}

#[derive(Default)]
struct BufferSink {
    events: parking_lot::Mutex<Vec<StreamEvent>>,
}

impl BufferSink {
    fn take(&self) -> Vec<StreamEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl StreamSink for BufferSink {
    fn emit(&self, event: StreamEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use relay_core::provider::{ProviderCapabilities, ProviderKind};
    use relay_core::stream::{visible_text, MessageOutcome};
    use relay_core::tools::ToolDefinition;
    use serde_json::json;

    use super::*;
    use crate::health::InMemoryHealthRegistry;
    use crate::mock::{MockProvider, MockResponse};

    #[derive(Default)]
    struct Recorder {
        events: parking_lot::Mutex<Vec<StreamEvent>>,
    }

    impl StreamSink for Recorder {
        fn emit(&self, event: StreamEvent) {
            self.events.lock().push(event);
        }
    }

    impl Recorder {
        fn kinds(&self) -> Vec<(String, &'static str)> {
            self.events
                .lock()
                .iter()
                .map(|e| (e.provider().to_string(), e.kind()))
                .collect()
        }
    }

    fn request(text: &str) -> ModelRequest {
        ModelRequest {
            messages: vec![Message::user_text(text)],
            ..Default::default()
        }
    }

    fn router(
        providers: Vec<Arc<MockProvider>>,
        health: Arc<InMemoryHealthRegistry>,
    ) -> FallbackRouter {
        let providers = providers
            .into_iter()
            .map(|p| p as Arc<dyn LlmProvider>)
            .collect();
        FallbackRouter::new(providers, health)
    }

    fn transient() -> MockResponse {
        MockResponse::Error(ProviderError::Network("connection reset".into()))
    }

    #[tokio::test]
    async fn transient_failures_advance_in_order() {
        let a = Arc::new(MockProvider::new(vec![transient()]).named("a"));
        let b = Arc::new(MockProvider::new(vec![transient()]).named("b"));
        let c = Arc::new(MockProvider::new(vec![MockResponse::text("hi")]).named("c"));
        let health = Arc::new(InMemoryHealthRegistry::new());
        let r = router(vec![a.clone(), b.clone(), c.clone()], health.clone());

        let answer = r.send(&request("x"), CallMode::Blocking, &NullSink).await.unwrap();
        assert_eq!(answer.provider, "c");
        assert_eq!(answer.visible_text(), "hi");
        assert_eq!((a.call_count(), b.call_count(), c.call_count()), (1, 1, 1));
        // Transient errors never disable.
        assert!(health.get_state("a").await.unwrap().is_eligible());
    }

    #[tokio::test]
    async fn all_transient_is_unavailable() {
        let a = Arc::new(MockProvider::new(vec![transient()]).named("a"));
        let b = Arc::new(
            MockProvider::new(vec![MockResponse::stream_error(
                "par",
                ProviderError::StreamInterrupted("reset".into()),
            )])
            .named("b"),
        );
        let r = router(vec![a, b], Arc::new(InMemoryHealthRegistry::new()));
        let err = r.send(&request("x"), CallMode::Blocking, &NullSink).await.unwrap_err();
        match err {
            RouterError::AllProvidersUnavailable { attempts } => {
                assert_eq!(attempts.len(), 2);
                assert!(attempts.iter().all(|a| matches!(
                    a.outcome,
                    AttemptOutcome::Failed { class: FailureClass::Transient, .. }
                )));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn auth_error_disables_and_is_skipped_next_time() {
        let a = Arc::new(
            MockProvider::new(vec![MockResponse::Error(ProviderError::api(401, None, "bad key"))])
                .named("a")
                .with_kind(ProviderKind::Anthropic),
        );
        let b = Arc::new(MockProvider::new(vec![MockResponse::text("one"), MockResponse::text("two")]).named("b"));
        let health = Arc::new(InMemoryHealthRegistry::new());
        let (tx, mut rx) = broadcast::channel(8);
        let r = router(vec![a.clone(), b], health.clone()).with_event_bus(tx);

        r.send(&request("x"), CallMode::Blocking, &NullSink).await.unwrap();
        let state = health.get_state("a").await.unwrap();
        assert!(state.auto_disabled);
        assert_eq!(state.disabled_reason, DisabledReason::Auth);
        assert!(matches!(
            rx.try_recv().unwrap(),
            RuntimeEvent::ProviderAutoDisabled { reason: DisabledReason::Auth, .. }
        ));

        let answer = r.send(&request("y"), CallMode::Blocking, &NullSink).await.unwrap();
        assert_eq!(answer.visible_text(), "two");
        assert_eq!(a.call_count(), 1);
    }

    #[tokio::test]
    async fn success_clears_auto_disable_via_credential_test() {
        let a = Arc::new(MockProvider::new(vec![MockResponse::text("OK")]).named("a"));
        let health = Arc::new(InMemoryHealthRegistry::new());
        health.record_outcome("a", CallOutcome::BillingError).await.unwrap();
        let r = router(vec![a.clone()], health.clone());

        let report = r.test_provider("a").await.unwrap();
        assert!(report.ok());
        assert!(!report.state.auto_disabled);
        assert_eq!(a.call_count(), 1);
        assert!(matches!(r.test_provider("zzz").await, Err(RouterError::UnknownProvider(_))));
    }

    #[tokio::test]
    async fn operator_disabled_provider_is_skipped() {
        let a = Arc::new(MockProvider::new(vec![MockResponse::text("a")]).named("a"));
        let b = Arc::new(MockProvider::new(vec![MockResponse::text("b")]).named("b"));
        let health = Arc::new(InMemoryHealthRegistry::new());
        health.set_enabled("a", false).await.unwrap();
        let r = router(vec![a.clone(), b], health);
        let answer = r.send(&request("x"), CallMode::Blocking, &NullSink).await.unwrap();
        assert_eq!(answer.provider, "b");
        assert_eq!(a.call_count(), 0);
    }

    #[tokio::test]
    async fn tool_capability_mismatch_skips_without_recording() {
        let no_tools = ProviderCapabilities {
            tools: false,
            ..Default::default()
        };
        let a = Arc::new(
            MockProvider::new(vec![MockResponse::text("a")])
                .named("a")
                .with_capabilities(no_tools),
        );
        let b = Arc::new(MockProvider::new(vec![MockResponse::text("b")]).named("b"));
        let health = Arc::new(InMemoryHealthRegistry::new());
        let r = router(vec![a.clone(), b], health.clone());

        let mut req = request("x");
        req.tools.push(ToolDefinition {
            name: "exec".into(),
            description: "run".into(),
            parameters_schema: json!({"type": "object"}),
        });
        let answer = r.send(&req, CallMode::Blocking, &NullSink).await.unwrap();
        assert_eq!(answer.provider, "b");
        assert_eq!(a.call_count(), 0);
        // Never touched, so no state row for `a` beyond the eligibility read.
        assert!(health.get_state("a").await.unwrap().is_eligible());
    }

    #[tokio::test]
    async fn thinking_dropped_for_unsupported_provider() {
        let a = Arc::new(MockProvider::new(vec![MockResponse::text("ok")]).named("a"));
        let r = router(vec![a.clone()], Arc::new(InMemoryHealthRegistry::new()));
        let mut req = request("x");
        req.thinking = ThinkingLevel::High;
        r.send(&req, CallMode::Blocking, &NullSink).await.unwrap();
        assert_eq!(a.requests()[0].thinking, ThinkingLevel::Off);
    }

    #[tokio::test]
    async fn end_to_end_billing_disabled_then_success() {
        let a = Arc::new(
            MockProvider::new(vec![MockResponse::Error(ProviderError::api(
                402,
                Some("billing_error".into()),
                "credit balance too low",
            ))])
            .named("a")
            .with_kind(ProviderKind::Anthropic),
        );
        let b = Arc::new(MockProvider::new(vec![MockResponse::text("never")]).named("b"));
        let c = Arc::new(
            MockProvider::new(vec![MockResponse::text_chunks(&["Hel", "lo ", "there"])]).named("c"),
        );
        let health = Arc::new(InMemoryHealthRegistry::new());
        health.set_enabled("b", false).await.unwrap();
        let r = router(vec![a, b.clone(), c], health.clone());

        let sink = Recorder::default();
        let answer = r.send(&request("x"), CallMode::Streaming, &sink).await.unwrap();

        assert_eq!(
            health.get_state("a").await.unwrap().disabled_reason,
            DisabledReason::Billing
        );
        assert_eq!(b.call_count(), 0);

        let kinds = sink.kinds();
        // A failed before its stream opened, so only C appears.
        assert!(kinds.iter().all(|(p, _)| p == "c"));
        let names: Vec<_> = kinds.iter().map(|(_, k)| *k).collect();
        assert_eq!(
            names,
            vec!["message_start", "text_start", "text_delta", "text_delta", "text_delta", "text_end", "message_end"]
        );
        let events = sink.events.lock().clone();
        assert_eq!(visible_text(&events), "Hello there");
        assert_eq!(answer.visible_text(), "Hello there");
    }

    #[tokio::test]
    async fn mid_stream_failure_marks_attempt_failed() {
        let a = Arc::new(
            MockProvider::new(vec![MockResponse::stream_error(
                "partial",
                ProviderError::StreamInterrupted("reset".into()),
            )])
            .named("a"),
        );
        let b = Arc::new(MockProvider::new(vec![MockResponse::text("full")]).named("b"));
        let r = router(vec![a, b], Arc::new(InMemoryHealthRegistry::new()));

        let sink = Recorder::default();
        r.send(&request("x"), CallMode::Streaming, &sink).await.unwrap();
        let events = sink.events.lock().clone();
        let a_end = events
            .iter()
            .find(|e| e.provider() == "a" && e.is_terminal())
            .unwrap();
        assert!(matches!(
            a_end,
            StreamEvent::MessageEnd { outcome: MessageOutcome::Failed, .. }
        ));
        assert!(events.iter().any(|e| e.provider() == "b"));
    }

    #[tokio::test]
    async fn blocking_mode_emits_nothing() {
        let a = Arc::new(MockProvider::new(vec![MockResponse::text("quiet")]).named("a"));
        let r = router(vec![a], Arc::new(InMemoryHealthRegistry::new()));
        let sink = Recorder::default();
        let answer = r.send(&request("x"), CallMode::Blocking, &sink).await.unwrap();
        assert!(sink.events.lock().is_empty());
        assert_eq!(answer.visible_text(), "quiet");
    }

    #[tokio::test]
    async fn tool_calls_land_in_message() {
        let a = Arc::new(
            MockProvider::new(vec![MockResponse::tool_call("exec", json!({"command": "ls"}))]).named("a"),
        );
        let r = router(vec![a], Arc::new(InMemoryHealthRegistry::new()));
        let answer = r.send(&request("x"), CallMode::Blocking, &NullSink).await.unwrap();
        assert_eq!(answer.message.tool_calls().len(), 1);
        assert_eq!(answer.message.stop_reason, Some(StopReason::ToolUse));
    }

    #[tokio::test]
    async fn strict_final_surfaces_only_final_span() {
        let a = Arc::new(MockProvider::new(vec![MockResponse::text("<final>A</final>B")]).named("a"));
        let r = router(vec![a], Arc::new(InMemoryHealthRegistry::new())).with_strict_final(true);
        let answer = r.send(&request("x"), CallMode::Blocking, &NullSink).await.unwrap();
        assert_eq!(answer.visible_text(), "A");
    }

    #[tokio::test]
    async fn strict_final_is_chosen_per_request() {
        let a = Arc::new(
            MockProvider::new(vec![MockResponse::text("<final>A</final>B")])
                .named("a")
                .repeating(),
        );
        let r = router(vec![a], Arc::new(InMemoryHealthRegistry::new()));

        let relaxed = r.send(&request("x"), CallMode::Blocking, &NullSink).await.unwrap();
        assert_eq!(relaxed.visible_text(), "AB");

        let strict = ModelRequest {
            strict_final: Some(true),
            ..request("x")
        };
        let answer = r.send(&strict, CallMode::Blocking, &NullSink).await.unwrap();
        assert_eq!(answer.visible_text(), "A");

        let r = r.with_strict_final(true);
        let opted_out = ModelRequest {
            strict_final: Some(false),
            ..request("x")
        };
        let answer = r.send(&opted_out, CallMode::Blocking, &NullSink).await.unwrap();
        assert_eq!(answer.visible_text(), "AB");
    }
}
