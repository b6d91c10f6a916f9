use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::LLMError;

/// HTTP methods understood by the lightweight transport abstraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Delete,
}

/// Minimal HTTP request representation shared across providers.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    /// Query parameters appended to the URL (Gemini-style `?key=` auth).
    pub query: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
    /// Cooperative cancellation; transports bridge this to their own
    /// cancel primitive and release the response body on all exit paths.
    pub cancel: Option<CancellationToken>,
}

impl HttpRequest {
    fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HashMap::new(),
            query: Vec::new(),
            body: None,
            timeout: None,
            cancel: None,
        }
    }

    /// Builds a POST request with a JSON body and `Content-Type` set.
    ///
    /// # Examples
    ///
    /// ```
    /// use tsunagi_llm::http::{HttpMethod, HttpRequest};
    ///
    /// let request = HttpRequest::post_json("https://example.com", br"{}".to_vec());
    /// assert_eq!(request.method, HttpMethod::Post);
    /// assert_eq!(request.headers.get("Content-Type"), Some(&"application/json".to_string()));
    /// ```
    pub fn post_json(url: impl Into<String>, body: Vec<u8>) -> Self {
        let mut request = Self::new(HttpMethod::Post, url);
        request
            .headers
            .insert("Content-Type".to_string(), "application/json".to_string());
        request.body = Some(body);
        request
    }

    /// Builds a GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    /// Builds a DELETE request.
    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, url)
    }

    /// Replaces the request headers after construction.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Appends a query parameter.
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Sets the per-request timeout.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Attaches a cancellation token.
    pub fn with_cancel(mut self, cancel: Option<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Minimal HTTP response representation.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Converts the body into a UTF-8 string.
    ///
    /// # Errors
    ///
    /// Returns [`LLMError::Other`] when the body is not valid UTF-8.
    pub fn into_string(self) -> Result<String, LLMError> {
        String::from_utf8(self.body).map_err(|err| LLMError::other(err.to_string()))
    }
}

/// HTTP response carrying a streaming body.
pub struct HttpStreamResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: HttpBodyStream,
}

/// Alias for the body stream returned by [`HttpTransport::send_stream`].
pub type HttpBodyStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, LLMError>> + Send>>;

/// Transport abstraction decoupling providers from the concrete HTTP client.
///
/// Implementations must honor [`HttpRequest::cancel`] (yielding
/// [`LLMError::Cancelled`]) and [`HttpRequest::timeout`] (yielding
/// [`LLMError::Timeout`]); connection failures map to
/// [`LLMError::Connection`]. Non-2xx statuses are returned as ordinary
/// responses so callers can route the body through the error mapper.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Sends a request and resolves when the full response is available.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LLMError>;

    /// Sends a request and returns a streaming body.
    async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, LLMError>;
}

/// Thread-safe handle to a transport implementation.
pub type DynHttpTransport = Arc<dyn HttpTransport>;

/// Hook that inspects an outgoing request and may adjust its headers.
///
/// Keeps request-body compilation pure: content-derived headers (such as
/// Anthropic beta opt-ins) are stamped here instead of inside the builders.
pub trait RequestInterceptor: Send + Sync {
    fn intercept(&self, url: &str, headers: &mut HashMap<String, String>, body: &Value);
}

/// Serializes `body` to JSON, attaches headers, and issues a POST request.
///
/// # Errors
///
/// Returns [`LLMError::InvalidRequest`] if serialization fails, otherwise
/// forwards the transport error.
pub async fn post_json_with_headers<T: Serialize>(
    transport: &dyn HttpTransport,
    url: impl Into<String>,
    headers: HashMap<String, String>,
    body: &T,
    timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
) -> Result<HttpResponse, LLMError> {
    let payload = serialize_body(body)?;
    let request = HttpRequest::post_json(url, payload)
        .with_headers(headers)
        .with_timeout(timeout)
        .with_cancel(cancel);
    transport.send(request).await
}

/// Issues a JSON POST request and returns the streaming response.
pub async fn post_json_stream_with_headers<T: Serialize>(
    transport: &dyn HttpTransport,
    url: impl Into<String>,
    headers: HashMap<String, String>,
    body: &T,
    timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
) -> Result<HttpStreamResponse, LLMError> {
    let payload = serialize_body(body)?;
    let request = HttpRequest::post_json(url, payload)
        .with_headers(headers)
        .with_timeout(timeout)
        .with_cancel(cancel);
    transport.send_stream(request).await
}

/// Issues a GET request with headers.
pub async fn get_with_headers(
    transport: &dyn HttpTransport,
    url: impl Into<String>,
    headers: HashMap<String, String>,
    cancel: Option<CancellationToken>,
) -> Result<HttpResponse, LLMError> {
    let request = HttpRequest::get(url)
        .with_headers(headers)
        .with_cancel(cancel);
    transport.send(request).await
}

/// Issues a DELETE request with headers.
pub async fn delete_with_headers(
    transport: &dyn HttpTransport,
    url: impl Into<String>,
    headers: HashMap<String, String>,
    cancel: Option<CancellationToken>,
) -> Result<HttpResponse, LLMError> {
    let request = HttpRequest::delete(url)
        .with_headers(headers)
        .with_cancel(cancel);
    transport.send(request).await
}

fn serialize_body<T: Serialize>(body: &T) -> Result<Vec<u8>, LLMError> {
    serde_json::to_vec(body)
        .map_err(|err| LLMError::invalid_request(format!("failed to serialize request: {err}")))
}

/// Fully drains a streaming body, for error reporting on non-2xx streams.
pub(crate) async fn collect_stream_text(mut body: HttpBodyStream) -> Result<String, LLMError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = body.next().await {
        bytes.extend_from_slice(&chunk?);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub mod reqwest;

#[cfg(test)]
mod tests {
    use super::*;
    use serde::ser;

    struct PanicTransport;

    #[async_trait]
    impl HttpTransport for PanicTransport {
        async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, LLMError> {
            panic!("send should not be called");
        }

        async fn send_stream(&self, _request: HttpRequest) -> Result<HttpStreamResponse, LLMError> {
            panic!("send_stream should not be called");
        }
    }

    /// Body type that intentionally fails serialization.
    struct NonSerializableBody;

    impl Serialize for NonSerializableBody {
        fn serialize<S>(&self, _serializer: S) -> Result<S::Ok, S::Error>
        where
            S: serde::Serializer,
        {
            Err(ser::Error::custom(
                "intentional serialization failure for test",
            ))
        }
    }

    #[tokio::test]
    async fn post_json_surfaces_serialization_failure_before_sending() {
        let transport = PanicTransport;
        let result = post_json_with_headers(
            &transport,
            "http://example.com",
            HashMap::new(),
            &NonSerializableBody,
            None,
            None,
        )
        .await;

        match result {
            Err(LLMError::InvalidRequest { message }) => {
                assert!(
                    message.contains("failed to serialize request"),
                    "unexpected message: {message}"
                );
            }
            other => panic!("expected InvalidRequest, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn collect_stream_text_concatenates_chunks() {
        let body: HttpBodyStream = Box::pin(futures_util::stream::iter(vec![
            Ok(b"hello ".to_vec()),
            Ok(b"world".to_vec()),
        ]));
        let text = collect_stream_text(body).await.expect("collect");
        assert_eq!(text, "hello world");
    }
}
