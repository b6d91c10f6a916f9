use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::capability::{Capability, CapabilitySet};
use crate::config::{ProviderConfig, ext};
use crate::error::{LLMError, map_http_error};
use crate::http::{
    DynHttpTransport, HttpResponse, collect_stream_text, post_json_stream_with_headers,
    post_json_with_headers,
};
use crate::provider::{ChatCall, ChatStream, LanguageModel};
use crate::types::{CallOptions, ChatResponse};

use super::request::build_chat_body;
use super::response::map_response;
use super::stream::create_stream;
use super::types::ChatCompletionResponse;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// Chat Completions language model, reused by every OpenAI-compatible vendor.
pub struct OpenAiChatModel {
    transport: DynHttpTransport,
    config: ProviderConfig,
    provider_id: String,
    /// Base provider id honored alongside a `*-openai` compatibility alias
    /// when looking up per-call provider options.
    alias: Option<String>,
    api_key_env: String,
}

impl std::fmt::Debug for OpenAiChatModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiChatModel")
            .field("config", &self.config)
            .field("provider_id", &self.provider_id)
            .field("alias", &self.alias)
            .field("api_key_env", &self.api_key_env)
            .finish_non_exhaustive()
    }
}

impl OpenAiChatModel {
    /// Creates the canonical `openai` model from a config.
    pub fn new(transport: DynHttpTransport, config: ProviderConfig) -> Self {
        Self::with_identity(transport, config, "openai", None, "OPENAI_API_KEY")
    }

    /// Creates a model with a custom identity, used by the compat layer.
    pub fn with_identity(
        transport: DynHttpTransport,
        config: ProviderConfig,
        provider_id: impl Into<String>,
        alias: Option<String>,
        api_key_env: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            config,
            provider_id: provider_id.into(),
            alias,
            api_key_env: api_key_env.into(),
        }
    }

    pub(crate) fn endpoint(&self) -> String {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
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
        headers.insert("Authorization".to_string(), format!("Bearer {api_key}"));
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        headers.insert("Accept".to_string(), "application/json".to_string());
        if let Some(extra) = self.config.extension::<HashMap<String, String>>(ext::EXTRA_HEADERS) {
            headers.extend(extra);
        }
        for (name, value) in &options.headers {
            headers.insert(name.clone(), value.clone());
        }
        // extra_headers escape hatch from the provider delta
        if let Some(Value::Object(delta)) =
            options.provider_delta(&self.provider_id, self.alias.as_deref())
        {
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
        build_chat_body(
            &call.prompt,
            &call.options,
            &model,
            stream,
            &self.provider_id,
            self.alias.as_deref(),
        )
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
impl LanguageModel for OpenAiChatModel {
    async fn chat(&self, call: ChatCall) -> Result<ChatResponse, LLMError> {
        let (body, warnings) = self.compile(&call, false)?;
        let headers = self.build_headers(&call.options)?;
        let response = post_json_with_headers(
            self.transport.as_ref(),
            self.endpoint(),
            headers,
            &body,
            self.config.timeout,
            call.cancel.clone(),
        )
        .await?;
        let text = self.ensure_success(response)?;
        let parsed: ChatCompletionResponse = serde_json::from_str(&text).map_err(|err| {
            LLMError::other(format!(
                "failed to parse {} response: {err}",
                self.provider_id
            ))
        })?;
        map_response(parsed, &self.provider_id, self.endpoint(), warnings)
    }

    async fn stream_chat(&self, call: ChatCall) -> Result<ChatStream, LLMError> {
        let (body, _warnings) = self.compile(&call, true)?;
        let headers = self.build_headers(&call.options)?;
        let response = post_json_stream_with_headers(
            self.transport.as_ref(),
            self.endpoint(),
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
        ])
    }

    fn provider_id(&self) -> &str {
        &self.provider_id
    }
}
