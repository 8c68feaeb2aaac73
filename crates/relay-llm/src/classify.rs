//! Provider failure classification.
//!
//! Adapters report raw metadata ([`ProviderError`]); this module turns it into
//! a [`FailureClass`] using an explicit table per [`ProviderKind`]. Anything the
//! table does not recognise is transient: the router moves on, nothing is
//! disabled.

use serde_json::Value;

use relay_core::errors::ProviderError;
use relay_core::health::FailureClass;
use relay_core::provider::ProviderKind;

/// Parsed error envelope from an HTTP error body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiErrorInfo {
    pub message: String,
    pub code: Option<String>,
}

/// Parse an error body. Handles `{"error": {"message", "type"|"code"}}`,
/// `{"detail": ...}` and flat `{"message", "code"}` envelopes, falling back to
/// the raw body.
pub fn parse_api_error(body: &str, status: u16) -> ApiErrorInfo {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        if let Some(msg) = json["error"]["message"].as_str() {
            // OpenAI puts the specific reason in `code`, Anthropic in `type`.
            let code = json["error"]["code"]
                .as_str()
                .or_else(|| json["error"]["type"].as_str())
                .map(String::from);
            return ApiErrorInfo {
                message: msg.to_string(),
                code,
            };
        }
        if let Some(msg) = json["detail"].as_str().or_else(|| json["message"].as_str()) {
            let code = json["code"]
                .as_str()
                .or_else(|| json["type"].as_str())
                .map(String::from);
            return ApiErrorInfo {
                message: msg.to_string(),
                code,
            };
        }
    }
    ApiErrorInfo {
        message: format!("HTTP {status}: {}", truncate_message(body, 512)),
        code: None,
    }
}

/// Build a [`ProviderError::Api`] from a non-success HTTP response body.
pub fn api_error_from_body(status: u16, body: &str) -> ProviderError {
    let info = parse_api_error(body, status);
    ProviderError::Api {
        status,
        code: info.code,
        message: info.message,
    }
}

pub fn truncate_message(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

/// Classification table, selected by provider kind.
#[derive(Clone, Copy, Debug)]
pub struct ErrorClassifier {
    kind: ProviderKind,
}

impl ErrorClassifier {
    pub fn for_kind(kind: ProviderKind) -> Self {
        Self { kind }
    }

    pub fn classify(&self, err: &ProviderError) -> FailureClass {
        match err {
            ProviderError::Api {
                status,
                code,
                message,
            } => match self.kind {
                ProviderKind::Anthropic => classify_anthropic(*status, code.as_deref(), message),
                ProviderKind::OpenaiCompatible => {
                    classify_openai(*status, code.as_deref(), message)
                }
                ProviderKind::Generic => classify_generic(*status),
            },
            ProviderError::Network(_)
            | ProviderError::StreamInterrupted(_)
            | ProviderError::InvalidResponse(_)
            | ProviderError::Timeout(_)
            | ProviderError::Cancelled => FailureClass::Transient,
        }
    }
}

fn classify_anthropic(status: u16, code: Option<&str>, message: &str) -> FailureClass {
    match (status, code) {
        (401 | 403, _) => FailureClass::Auth,
        (_, Some("authentication_error" | "permission_error")) => FailureClass::Auth,
        (402, _) => FailureClass::Billing,
        (_, Some("billing_error")) => FailureClass::Billing,
        _ if message.to_ascii_lowercase().contains("credit balance") => FailureClass::Billing,
        _ => FailureClass::Transient,
    }
}

fn classify_openai(status: u16, code: Option<&str>, _message: &str) -> FailureClass {
    match (status, code) {
        (401 | 403, _) => FailureClass::Auth,
        (_, Some("invalid_api_key")) => FailureClass::Auth,
        (402, _) => FailureClass::Billing,
        // A 429 carrying a quota code is billing, not rate limiting.
        (_, Some("insufficient_quota" | "billing_hard_limit_reached")) => FailureClass::Billing,
        _ => FailureClass::Transient,
    }
}

fn classify_generic(status: u16) -> FailureClass {
    match status {
        401 | 403 => FailureClass::Auth,
        402 => FailureClass::Billing,
        _ => FailureClass::Transient,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn anthropic() -> ErrorClassifier {
        ErrorClassifier::for_kind(ProviderKind::Anthropic)
    }

    fn openai() -> ErrorClassifier {
        ErrorClassifier::for_kind(ProviderKind::OpenaiCompatible)
    }

    #[test]
    fn anthropic_table() {
        let cases = [
            (401, None, "bad key", FailureClass::Auth),
            (403, None, "forbidden", FailureClass::Auth),
            (400, Some("authentication_error"), "x", FailureClass::Auth),
            (400, Some("permission_error"), "x", FailureClass::Auth),
            (402, None, "pay up", FailureClass::Billing),
            (400, Some("billing_error"), "x", FailureClass::Billing),
            (
                400,
                Some("invalid_request_error"),
                "Your credit balance is too low to access the API",
                FailureClass::Billing,
            ),
            (429, Some("rate_limit_error"), "slow down", FailureClass::Transient),
            (529, Some("overloaded_error"), "Overloaded", FailureClass::Transient),
            (500, Some("api_error"), "internal", FailureClass::Transient),
            (400, Some("invalid_request_error"), "messages: empty", FailureClass::Transient),
        ];
        for (status, code, msg, want) in cases {
            let err = ProviderError::api(status, code.map(String::from), msg);
            assert_eq!(anthropic().classify(&err), want, "{status} {code:?} {msg}");
        }
    }

    #[test]
    fn openai_table() {
        let cases = [
            (401, Some("invalid_api_key"), FailureClass::Auth),
            (400, Some("invalid_api_key"), FailureClass::Auth),
            (402, None, FailureClass::Billing),
            (429, Some("insufficient_quota"), FailureClass::Billing),
            (400, Some("billing_hard_limit_reached"), FailureClass::Billing),
            (429, Some("rate_limit_exceeded"), FailureClass::Transient),
            (503, None, FailureClass::Transient),
            (400, Some("invalid_request_error"), FailureClass::Transient),
        ];
        for (status, code, want) in cases {
            let err = ProviderError::api(status, code.map(String::from), "m");
            assert_eq!(openai().classify(&err), want, "{status} {code:?}");
        }
    }

    #[test]
    fn credit_balance_text_only_matters_for_anthropic() {
        let err = ProviderError::api(400, None, "credit balance too low");
        assert_eq!(anthropic().classify(&err), FailureClass::Billing);
        assert_eq!(openai().classify(&err), FailureClass::Transient);
    }

    #[test]
    fn transport_failures_are_transient() {
        for err in [
            ProviderError::Network("reset".into()),
            ProviderError::StreamInterrupted("eof".into()),
            ProviderError::Timeout(Duration::from_secs(5)),
        ] {
            assert_eq!(anthropic().classify(&err), FailureClass::Transient);
            assert_eq!(openai().classify(&err), FailureClass::Transient);
        }
    }

    #[test]
    fn parse_anthropic_envelope() {
        let body = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        let info = parse_api_error(body, 529);
        assert_eq!(info.message, "Overloaded");
        assert_eq!(info.code.as_deref(), Some("overloaded_error"));
    }

    #[test]
    fn parse_openai_envelope_prefers_code() {
        let body = r#"{"error":{"message":"You exceeded your current quota","type":"insufficient_quota","code":"insufficient_quota"}}"#;
        let err = api_error_from_body(429, body);
        assert_eq!(err.code(), Some("insufficient_quota"));
        assert_eq!(openai().classify(&err), FailureClass::Billing);
    }

    #[test]
    fn parse_flat_and_raw_bodies() {
        let info = parse_api_error(r#"{"message":"Invalid model","code":"model_not_found"}"#, 400);
        assert_eq!(info.code.as_deref(), Some("model_not_found"));

        let info = parse_api_error("Bad Gateway", 502);
        assert_eq!(info.message, "HTTP 502: Bad Gateway");
        assert!(info.code.is_none());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_message("héllo", 2), "hé…");
        assert_eq!(truncate_message("hi", 10), "hi");
    }
}
