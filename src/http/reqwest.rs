use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::StreamExt;
use reqwest::{Client, Method};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::config::{ProviderConfig, ext};
use crate::error::LLMError;

use super::{
    DynHttpTransport, HttpBodyStream, HttpMethod, HttpRequest, HttpResponse, HttpStreamResponse,
    HttpTransport,
};

/// 基于 reqwest 的默认 HttpTransport。
///
/// One transport is built per provider instance and shared across calls; the
/// underlying connection pool belongs to reqwest.
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Wraps a custom `reqwest::Client`.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Creates a transport with default client settings.
    pub fn default_client() -> Result<Self, LLMError> {
        Client::builder()
            .build()
            .map(Self::new)
            .map_err(|err| LLMError::connection(format!("failed to create reqwest client: {err}")))
    }

    /// Builds a transport honoring the proxy/TLS extensions of a config.
    ///
    /// Recognized keys: [`ext::HTTP_PROXY`], [`ext::BYPASS_SSL_VERIFICATION`],
    /// [`ext::SSL_CERTIFICATE`] (PEM), [`ext::CONNECT_TIMEOUT_MS`]. TLS
    /// bypass is unavailable on browser-like hosts; there it is ignored with
    /// a warning.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, LLMError> {
        let mut builder = Client::builder();
        if let Some(millis) = config.extension::<u64>(ext::CONNECT_TIMEOUT_MS) {
            builder = builder.connect_timeout(std::time::Duration::from_millis(millis));
        }
        if let Some(proxy) = config.extension::<String>(ext::HTTP_PROXY) {
            let proxy = reqwest::Proxy::all(&proxy)
                .map_err(|err| LLMError::invalid_request(format!("invalid http_proxy: {err}")))?;
            builder = builder.proxy(proxy);
        }
        if config
            .extension::<bool>(ext::BYPASS_SSL_VERIFICATION)
            .unwrap_or(false)
        {
            if cfg!(target_arch = "wasm32") {
                tracing::warn!("bypass_ssl_verification is not supported on this host, ignoring");
            } else {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }
        if let Some(pem) = config.extension::<String>(ext::SSL_CERTIFICATE) {
            let cert = reqwest::Certificate::from_pem(pem.as_bytes()).map_err(|err| {
                LLMError::invalid_request(format!("invalid ssl_certificate: {err}"))
            })?;
            builder = builder.add_root_certificate(cert);
        }
        builder
            .build()
            .map(Self::new)
            .map_err(|err| LLMError::connection(format!("failed to create reqwest client: {err}")))
    }

    fn method(method: HttpMethod) -> Method {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Delete => Method::DELETE,
        }
    }

    fn build_request(&self, mut request: HttpRequest) -> Result<reqwest::RequestBuilder, LLMError> {
        let method = Self::method(request.method);
        let mut builder = self.client.request(method, &request.url);

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        for (name, value) in request.headers.drain() {
            let header_name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| LLMError::invalid_request(format!("invalid header name: {err}")))?;
            let header_value = reqwest::header::HeaderValue::from_str(&value).map_err(|err| {
                LLMError::invalid_request(format!("invalid header value for {header_name}: {err}"))
            })?;
            builder = builder.header(header_name, header_value);
        }
        if let Some(body) = request.body.take() {
            builder = builder.body(body);
        }
        Ok(builder)
    }

    fn headers_to_map(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
        headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }

    fn map_transport_error(err: reqwest::Error) -> LLMError {
        if err.is_timeout() {
            LLMError::timeout(err.to_string())
        } else {
            LLMError::connection(err.to_string())
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        ReqwestTransport::default_client().expect("failed to initialize default reqwest transport")
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LLMError> {
        let cancel = request.cancel.clone();
        let builder = self.build_request(request)?;

        let response = match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => {
                        return Err(LLMError::cancelled("request cancelled before completion"));
                    }
                    result = builder.send() => result,
                }
            }
            None => builder.send().await,
        }
        .map_err(Self::map_transport_error)?;

        let status = response.status().as_u16();
        let headers = Self::headers_to_map(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(Self::map_transport_error)?
            .to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, LLMError> {
        let cancel = request.cancel.clone();
        let builder = self.build_request(request)?;

        let response = match &cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => {
                        return Err(LLMError::cancelled("request cancelled before completion"));
                    }
                    result = builder.send() => result,
                }
            }
            None => builder.send().await,
        }
        .map_err(Self::map_transport_error)?;

        let status = response.status().as_u16();
        let headers = Self::headers_to_map(response.headers());
        let inner = response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(Self::map_transport_error)
            })
            .boxed();
        let body: HttpBodyStream = match cancel {
            Some(token) => Box::pin(CancellableBody::new(inner, token)),
            None => inner,
        };

        Ok(HttpStreamResponse {
            status,
            headers,
            body,
        })
    }
}

/// Wraps a body stream so a cancellation token can terminate it mid-flight.
///
/// After the token fires the stream yields a single [`LLMError::Cancelled`]
/// and then ends; the inner body is dropped, releasing the connection.
struct CancellableBody {
    inner: Option<HttpBodyStream>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl CancellableBody {
    fn new(inner: HttpBodyStream, token: CancellationToken) -> Self {
        Self {
            inner: Some(inner),
            cancelled: Box::pin(token.cancelled_owned()),
        }
    }
}

impl Stream for CancellableBody {
    type Item = Result<Vec<u8>, LLMError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };
        if this.cancelled.as_mut().poll(cx).is_ready() {
            this.inner = None;
            return Poll::Ready(Some(Err(LLMError::cancelled(
                "stream cancelled by caller",
            ))));
        }
        match inner.as_mut().poll_next(cx) {
            Poll::Ready(None) => {
                this.inner = None;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

/// 便捷构造线程安全 Transport。
pub fn default_dyn_transport() -> Result<DynHttpTransport, LLMError> {
    Ok(Arc::new(ReqwestTransport::default()))
}
