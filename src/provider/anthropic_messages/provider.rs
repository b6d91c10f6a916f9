use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::capability::{Capability, CapabilitySet};
use crate::config::{ProviderConfig, ext};
use crate::error::{LLMError, map_http_error};
use crate::http::{
    DynHttpTransport, HttpResponse, RequestInterceptor, collect_stream_text,
    post_json_stream_with_headers, post_json_with_headers,
};
use crate::provider::{ChatCall, ChatStream, LanguageModel};
use crate::types::{CallOptions, ChatResponse};

use super::beta::AnthropicBetaInterceptor;
use super::request::build_messages_body;
use super::response::map_response;
use super::stream::create_stream;
use super::types::MessagesResponse;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_VERSION: &str = "2023-06-01";

/// Anthropic Messages language model (Claude), also used by
/// Anthropic-compatible vendors through a base-URL override.
pub struct AnthropicMessagesModel {
    transport: DynHttpTransport,
    config: ProviderConfig,
    provider_id: String,
    api_key_env: String,
    interceptors: Vec<Arc<dyn RequestInterceptor>>,
}

impl AnthropicMessagesModel {
    pub fn new(transport: DynHttpTransport, config: ProviderConfig) -> Self {
        Self::with_identity(transport, config, "anthropic", "ANTHROPIC_API_KEY")
    }

    /// Creates a model with a custom identity (e.g. `minimax`).
    pub fn with_identity(
        transport: DynHttpTransport,
        config: ProviderConfig,
        provider_id: impl Into<String>,
        api_key_env: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            config,
            provider_id: provider_id.into(),
            api_key_env: api_key_env.into(),
            interceptors: vec![Arc::new(AnthropicBetaInterceptor::new())],
        }
    }

    /// Adds a request interceptor applied after the built-in beta stamping.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn RequestInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// `/v1/` normalization shared with Anthropic-compatible base URLs.
    pub(crate) fn endpoint(&self) -> String {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{base}/messages")
        } else {
            format!("{base}/v1/messages")
        }
    }

    fn build_headers(&self, options: &CallOptions) -> Result<HashMap<String, String>, LLMError> {
        let api_key = self
            .config
            .resolve_api_key(&self.api_key_env)
            .ok_or_else(|| LLMError::Auth {
                message: format!(
                    "missing API key for {} (set {} or config.api_key)",
                    self.provider_id, self.api_key_env
                ),
            })?;
        let mut headers = HashMap::new();
        headers.insert("x-api-key".to_string(), api_key);
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        headers.insert("Accept".to_string(), "application/json".to_string());
        headers.insert(
            "anthropic-version".to_string(),
            self.config
                .extension::<String>(ext::ANTHROPIC_VERSION)
                .unwrap_or_else(|| DEFAULT_VERSION.to_string()),
        );
        if let Some(extra) = self
            .config
            .extension::<HashMap<String, String>>(ext::EXTRA_HEADERS)
        {
            headers.extend(extra);
        }
        for (name, value) in &options.headers {
            headers.insert(name.clone(), value.clone());
        }
        if let Some(Value::Object(delta)) = options.provider_delta(&self.provider_id, None) {
            if let Some(Value::Object(extra)) = delta.get("extra_headers") {
                for (name, value) in extra {
                    if let Some(value) = value.as_str() {
                        headers.insert(name.clone(), value.to_string());
                    }
                }
            }
        }
        Ok(headers)
    }

    fn resolve_model(&self, options: &CallOptions) -> Result<String, LLMError> {
        options
            .model
            .clone()
            .or_else(|| self.config.model.clone())
            .ok_or_else(|| {
                LLMError::invalid_request(format!("model is required for {}", self.provider_id))
            })
    }

    fn compile(&self, call: &ChatCall, stream: bool) -> Result<(Value, Vec<String>), LLMError> {
        let model = self.resolve_model(&call.options)?;
        build_messages_body(&call.prompt, &call.options, &self.config, &model, stream)
    }

    fn intercepted_headers(
        &self,
        options: &CallOptions,
        url: &str,
        body: &Value,
    ) -> Result<HashMap<String, String>, LLMError> {
        let mut headers = self.build_headers(options)?;
        for interceptor in &self.interceptors {
            interceptor.intercept(url, &mut headers, body);
        }
        Ok(headers)
    }

    fn ensure_success(&self, response: HttpResponse) -> Result<String, LLMError> {
        let status = response.status;
        if (200..300).contains(&status) {
            response.into_string()
        } else {
            let headers = response.headers.clone();
            let text = response.into_string().unwrap_or_default();
            Err(map_http_error(status, &headers, &text))
        }
    }
}

#[async_trait]
impl LanguageModel for AnthropicMessagesModel {
    async fn chat(&self, call: ChatCall) -> Result<ChatResponse, LLMError> {
        let (body, warnings) = self.compile(&call, false)?;
        let url = self.endpoint();
        let headers = self.intercepted_headers(&call.options, &url, &body)?;
        let response = post_json_with_headers(
            self.transport.as_ref(),
            url.clone(),
            headers,
            &body,
            self.config.timeout,
            call.cancel.clone(),
        )
        .await?;
        let text = self.ensure_success(response)?;
        let parsed: MessagesResponse = serde_json::from_str(&text).map_err(|err| {
            LLMError::other(format!(
                "failed to parse {} response: {err}",
                self.provider_id
            ))
        })?;
        map_response(parsed, url, warnings)
    }

    async fn stream_chat(&self, call: ChatCall) -> Result<ChatStream, LLMError> {
        let (body, _warnings) = self.compile(&call, true)?;
        let url = self.endpoint();
        let headers = self.intercepted_headers(&call.options, &url, &body)?;
        let response = post_json_stream_with_headers(
            self.transport.as_ref(),
            url,
            headers,
            &body,
            self.config.timeout,
            call.cancel.clone(),
        )
        .await?;
        if !(200..300).contains(&response.status) {
            let status = response.status;
            let headers = response.headers;
            let text = collect_stream_text(response.body).await?;
            return Err(map_http_error(status, &headers, &text));
        }
        Ok(create_stream(response.body))
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::of(&[
            Capability::Chat,
            Capability::Streaming,
            Capability::ToolCalling,
            Capability::Reasoning,
            Capability::Vision,
            Capability::LiveSearch,
        ])
    }

    fn provider_id(&self) -> &str {
        &self.provider_id
    }
}
