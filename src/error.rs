use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Aggregates every failure mode exposed by the unified LLM client.
///
/// Variants are taxonomic: callers match on the kind to decide whether to
/// re-authenticate, back off, fall back to another provider, or surface the
/// message to the user. The library itself never retries.
#[derive(Debug, Error)]
pub enum LLMError {
    /// Invalid or missing credentials (HTTP 401/403).
    #[error("auth failure: {message}")]
    Auth { message: String },
    /// The request payload was rejected by the provider (HTTP 400/422) or
    /// failed local validation before being sent.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    /// The requested resource does not exist (HTTP 404).
    #[error("not found: {message}")]
    NotFound {
        /// Model identifier extracted from the error payload when available.
        model: Option<String>,
        message: String,
    },
    /// The provider throttled the request (HTTP 429).
    #[error("rate limited: {message}")]
    RateLimit {
        message: String,
        /// Wait hint extracted from the body or the `Retry-After` header.
        retry_after: Option<Duration>,
        /// Remaining request budget when the provider reports one.
        remaining: Option<u64>,
    },
    /// Account quota or credits exhausted (HTTP 402, or a 429 whose payload
    /// names `insufficient_quota`).
    #[error("quota exceeded: {message}")]
    QuotaExceeded {
        message: String,
        quota: Option<QuotaKind>,
    },
    /// The provider refused the content on policy grounds.
    #[error("content filtered: {message}")]
    ContentFilter {
        message: String,
        /// Provider-reported filter category, verbatim.
        filter: Option<String>,
    },
    /// The model exists in name but is not available to this account/region.
    #[error("model not available: {model}")]
    ModelNotAvailable { model: String, message: String },
    /// Upstream 5xx.
    #[error("server error (status {status}): {message}")]
    Server { status: u16, message: String },
    /// A connect/send/receive deadline elapsed.
    #[error("timeout: {message}")]
    Timeout { message: String },
    /// The connection could not be established or broke mid-flight.
    #[error("connection error: {message}")]
    Connection { message: String },
    /// The caller cancelled the request through its token.
    #[error("request cancelled: {message}")]
    Cancelled { message: String },
    /// Structured output could not be parsed from the model's answer.
    #[error("response format error: {message}")]
    ResponseFormat {
        message: String,
        /// Truncated raw payload for debugging.
        raw: String,
    },
    /// The selected provider does not implement the requested capability.
    #[error("capability unsupported: {capability}")]
    UnsupportedCapability { capability: &'static str },
    /// Catches opaque or unexpected failures.
    #[error("{message}")]
    Other { message: String },
}

/// Quota categories inferred from provider error payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    Token,
    Request,
    Credit,
}

impl LLMError {
    /// Creates an [`LLMError::InvalidRequest`] from a textual description.
    pub fn invalid_request<T: Into<String>>(message: T) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates an [`LLMError::Connection`] from a textual description.
    pub fn connection<T: Into<String>>(message: T) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates an [`LLMError::Timeout`] from a textual description.
    pub fn timeout<T: Into<String>>(message: T) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Creates an [`LLMError::Cancelled`] from a textual description.
    pub fn cancelled<T: Into<String>>(message: T) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// Creates an [`LLMError::Other`] from a textual description.
    pub fn other<T: Into<String>>(message: T) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Returns `true` for the variants a caller could reasonably retry after
    /// waiting: rate limits, timeouts, connection failures and 5xx.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimit { .. }
                | Self::Timeout { .. }
                | Self::Connection { .. }
                | Self::Server { .. }
        )
    }
}

/// Shape shared by OpenAI- and Anthropic-style error payloads.
#[derive(Debug, Default, Deserialize)]
struct WireError {
    #[serde(default)]
    error: Option<WireErrorInner>,
}

#[derive(Debug, Default, Deserialize)]
struct WireErrorInner {
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    code: Option<serde_json::Value>,
    /// Some vendors nest the wait hint in the body instead of a header.
    #[serde(default)]
    retry_after: Option<u64>,
}

/// Maps a non-2xx HTTP response to a typed [`LLMError`].
///
/// The payload is examined before the status fallback so that, for example, a
/// 429 carrying `insufficient_quota` becomes [`LLMError::QuotaExceeded`]
/// rather than [`LLMError::RateLimit`].
pub fn map_http_error(status: u16, headers: &HashMap<String, String>, body: &str) -> LLMError {
    let parsed = serde_json::from_str::<WireError>(body)
        .ok()
        .and_then(|w| w.error);
    let kind = parsed
        .as_ref()
        .and_then(|e| e.kind.clone())
        .unwrap_or_default();
    let mut message = parsed
        .as_ref()
        .and_then(|e| e.message.clone())
        .unwrap_or_else(|| format!("status {status}: {}", truncate_payload(body)));
    if let Some(code) = parsed.as_ref().and_then(|e| e.code.clone()) {
        if !code.is_null() {
            message = format!("{message} ({code})");
        }
    }
    let lower = message.to_ascii_lowercase();

    // Payload specialization wins over the status fallback.
    if kind == "content_filter" || lower.contains("content policy") {
        return LLMError::ContentFilter {
            filter: (kind == "content_filter").then(|| kind.clone()),
            message,
        };
    }
    if kind == "model_not_found" || (lower.contains("model") && lower.contains("not found")) {
        let model = extract_model_identifier(&message).unwrap_or_default();
        return LLMError::ModelNotAvailable { model, message };
    }
    if kind == "insufficient_quota" || lower.contains("quota") || lower.contains("billing") {
        return LLMError::QuotaExceeded {
            quota: infer_quota_kind(&lower),
            message,
        };
    }

    match status {
        400 | 422 => LLMError::InvalidRequest { message },
        401 | 403 => LLMError::Auth { message },
        402 => LLMError::QuotaExceeded {
            message,
            quota: Some(QuotaKind::Credit),
        },
        404 => LLMError::NotFound {
            model: extract_model_identifier(&message),
            message,
        },
        429 => LLMError::RateLimit {
            retry_after: parsed
                .as_ref()
                .and_then(|e| e.retry_after)
                .map(Duration::from_secs)
                .or_else(|| retry_after_from_headers(headers)),
            remaining: remaining_from_headers(headers),
            message,
        },
        code if (500..600).contains(&code) => LLMError::Server {
            status: code,
            message,
        },
        _ => LLMError::Other { message },
    }
}

/// Extracts the `Retry-After` header (in seconds) if present.
///
/// HTTP-date values are ignored because vendors primarily use the numeric
/// form.
pub(crate) fn retry_after_from_headers(headers: &HashMap<String, String>) -> Option<Duration> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("retry-after"))
        .and_then(|(_, value)| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn remaining_from_headers(headers: &HashMap<String, String>) -> Option<u64> {
    headers
        .iter()
        .find(|(name, _)| {
            name.eq_ignore_ascii_case("x-ratelimit-remaining-requests")
                || name.eq_ignore_ascii_case("x-ratelimit-remaining")
        })
        .and_then(|(_, value)| value.trim().parse::<u64>().ok())
}

fn infer_quota_kind(lower_message: &str) -> Option<QuotaKind> {
    if lower_message.contains("token") {
        Some(QuotaKind::Token)
    } else if lower_message.contains("request") {
        Some(QuotaKind::Request)
    } else if lower_message.contains("credit") || lower_message.contains("billing") {
        Some(QuotaKind::Credit)
    } else {
        None
    }
}

/// Attempts to extract a model identifier quoted inside an error payload.
pub(crate) fn extract_model_identifier(message: &str) -> Option<String> {
    for delimiter in ['`', '"', '\''] {
        if let Some(value) = between_delimiters(message, delimiter) {
            if !value.trim().is_empty() {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

fn between_delimiters(message: &str, delimiter: char) -> Option<String> {
    let start = message.find(delimiter)?;
    let inner = &message[start + delimiter.len_utf8()..];
    let end = inner.find(delimiter)?;
    Some(inner[..end].to_string())
}

const MAX_PAYLOAD_PREVIEW: usize = 512;

/// Truncates a raw payload to a debuggable preview without leaking whole
/// responses into logs.
pub(crate) fn truncate_payload(payload: &str) -> String {
    if payload.len() <= MAX_PAYLOAD_PREVIEW {
        return payload.to_string();
    }
    let mut end = MAX_PAYLOAD_PREVIEW;
    while !payload.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}… ({} bytes)", &payload[..end], payload.len())
}
