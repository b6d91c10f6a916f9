use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::capability::{Capability, CapabilitySet};
use crate::config::{ProviderConfig, ext};
use crate::error::{LLMError, map_http_error};
use crate::http::{
    DynHttpTransport, HttpRequest, HttpResponse, collect_stream_text,
    post_json_stream_with_headers, post_json_with_headers,
};
use crate::prompt::{ChatMessage, Prompt};
use crate::provider::{ChatCall, ChatStream, LanguageModel};
use crate::types::{CallOptions, ChatResponse};

use super::request::build_responses_body;
use super::response::map_response;
use super::stream::create_stream;
use super::types::ResponsesResponse;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// OpenAI Responses language model.
///
/// Beyond chat/stream this exposes the stateful response-graph operations:
/// fetching, deleting and cancelling responses by id, listing input items,
/// and continuing or forking a server-side conversation.
pub struct OpenAiResponsesModel {
    transport: DynHttpTransport,
    config: ProviderConfig,
    provider_id: String,
    api_key_env: String,
}

/// Parameters for [`OpenAiResponsesModel::list_input_items`].
#[derive(Debug, Clone, Default)]
pub struct ListInputItemsParams {
    pub after: Option<String>,
    pub before: Option<String>,
    pub include: Option<Vec<String>>,
    pub limit: Option<u32>,
    /// `asc` or `desc`.
    pub order: Option<String>,
}

/// One page of input items.
#[derive(Debug, Clone, Deserialize)]
pub struct InputItemsPage {
    #[serde(default)]
    pub data: Vec<Value>,
    #[serde(default)]
    pub first_id: Option<String>,
    #[serde(default)]
    pub last_id: Option<String>,
    #[serde(default)]
    pub has_more: bool,
}

impl OpenAiResponsesModel {
    pub fn new(transport: DynHttpTransport, config: ProviderConfig) -> Self {
        Self::with_identity(transport, config, "openai", "OPENAI_API_KEY")
    }

    /// Custom identity, e.g. the `xai.responses` alias.
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
        }
    }

    fn base(&self) -> String {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        if base.ends_with("/v1") {
            base.to_string()
        } else {
            format!("{base}/v1")
        }
    }

    pub(crate) fn endpoint(&self) -> String {
        format!("{}/responses", self.base())
    }

    fn response_endpoint(&self, id: &str) -> String {
        format!("{}/responses/{id}", self.base())
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
        if let Some(extra) = self
            .config
            .extension::<HashMap<String, String>>(ext::EXTRA_HEADERS)
        {
            headers.extend(extra);
        }
        for (name, value) in &options.headers {
            headers.insert(name.clone(), value.clone());
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

    fn parse_response(&self, text: &str, endpoint: String) -> Result<ChatResponse, LLMError> {
        let parsed: ResponsesResponse = serde_json::from_str(text).map_err(|err| {
            LLMError::other(format!(
                "failed to parse {} response: {err}",
                self.provider_id
            ))
        })?;
        map_response(parsed, endpoint, Vec::new())
    }

    /// Builds the call used by both conversation continuations; continuing
    /// and forking produce identical request bodies for the same inputs.
    fn conversation_call(&self, previous_response_id: &str, messages: Vec<ChatMessage>) -> ChatCall {
        let options = CallOptions::default().with_provider_option(
            "openai",
            "previous_response_id",
            previous_response_id,
        );
        ChatCall {
            prompt: Prompt::new(messages),
            options,
            cancel: None,
        }
    }

    /// Continues a server-side conversation from `previous_response_id`.
    pub async fn continue_conversation(
        &self,
        previous_response_id: &str,
        messages: Vec<ChatMessage>,
    ) -> Result<ChatResponse, LLMError> {
        self.chat(self.conversation_call(previous_response_id, messages))
            .await
    }

    /// Forks a conversation: identical wire behavior to continuing, but a
    /// new branch of the response graph grows from `from_response_id`.
    pub async fn fork_conversation(
        &self,
        from_response_id: &str,
        messages: Vec<ChatMessage>,
    ) -> Result<ChatResponse, LLMError> {
        self.chat(self.conversation_call(from_response_id, messages))
            .await
    }

    /// Fetches a stored response by id.
    pub async fn get_response(
        &self,
        id: &str,
        include: Option<Vec<String>>,
        starting_after: Option<u64>,
    ) -> Result<ChatResponse, LLMError> {
        let url = self.response_endpoint(id);
        let mut request = HttpRequest::get(url.clone())
            .with_headers(self.build_headers(&CallOptions::default())?)
            .with_timeout(self.config.timeout);
        if let Some(include) = include {
            request = request.with_query("include[]", include.join(","));
        }
        if let Some(after) = starting_after {
            request = request.with_query("starting_after", after.to_string());
        }
        let response = self.transport.send(request).await?;
        let text = self.ensure_success(response)?;
        self.parse_response(&text, url)
    }

    /// Resumes a stored streaming response.
    pub async fn get_response_stream(&self, id: &str) -> Result<ChatStream, LLMError> {
        let url = self.response_endpoint(id);
        let request = HttpRequest::get(url)
            .with_headers(self.build_headers(&CallOptions::default())?)
            .with_timeout(self.config.timeout)
            .with_query("stream", "true");
        let response = self.transport.send_stream(request).await?;
        if !(200..300).contains(&response.status) {
            let status = response.status;
            let headers = response.headers;
            let text = collect_stream_text(response.body).await?;
            return Err(map_http_error(status, &headers, &text));
        }
        Ok(create_stream(response.body))
    }

    /// Deletes a stored response.
    pub async fn delete_response(&self, id: &str) -> Result<(), LLMError> {
        let request = HttpRequest::delete(self.response_endpoint(id))
            .with_headers(self.build_headers(&CallOptions::default())?)
            .with_timeout(self.config.timeout);
        let response = self.transport.send(request).await?;
        self.ensure_success(response).map(|_| ())
    }

    /// Cancels an in-flight background response.
    pub async fn cancel_response(&self, id: &str) -> Result<ChatResponse, LLMError> {
        let url = format!("{}/cancel", self.response_endpoint(id));
        let response = post_json_with_headers(
            self.transport.as_ref(),
            url.clone(),
            self.build_headers(&CallOptions::default())?,
            &serde_json::json!({}),
            self.config.timeout,
            None,
        )
        .await?;
        let text = self.ensure_success(response)?;
        self.parse_response(&text, url)
    }

    /// Lists the input items that produced a response.
    pub async fn list_input_items(
        &self,
        id: &str,
        params: ListInputItemsParams,
    ) -> Result<InputItemsPage, LLMError> {
        let url = format!("{}/input_items", self.response_endpoint(id));
        let mut request = HttpRequest::get(url)
            .with_headers(self.build_headers(&CallOptions::default())?)
            .with_timeout(self.config.timeout);
        if let Some(after) = &params.after {
            request = request.with_query("after", after.as_str());
        }
        if let Some(before) = &params.before {
            request = request.with_query("before", before.as_str());
        }
        if let Some(include) = &params.include {
            request = request.with_query("include[]", include.join(","));
        }
        if let Some(limit) = params.limit {
            request = request.with_query("limit", limit.to_string());
        }
        if let Some(order) = &params.order {
            request = request.with_query("order", order.as_str());
        }
        let response = self.transport.send(request).await?;
        let text = self.ensure_success(response)?;
        serde_json::from_str(&text)
            .map_err(|err| LLMError::other(format!("failed to parse input items page: {err}")))
    }
}

#[async_trait]
impl LanguageModel for OpenAiResponsesModel {
    async fn chat(&self, call: ChatCall) -> Result<ChatResponse, LLMError> {
        let model = self.resolve_model(&call.options)?;
        let (body, warnings) =
            build_responses_body(&call.prompt, &call.options, &model, false)?;
        let headers = self.build_headers(&call.options)?;
        let url = self.endpoint();
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
        let parsed: ResponsesResponse = serde_json::from_str(&text).map_err(|err| {
            LLMError::other(format!(
                "failed to parse {} response: {err}",
                self.provider_id
            ))
        })?;
        map_response(parsed, url, warnings)
    }

    async fn stream_chat(&self, call: ChatCall) -> Result<ChatStream, LLMError> {
        let model = self.resolve_model(&call.options)?;
        let (body, _warnings) = build_responses_body(&call.prompt, &call.options, &model, true)?;
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
            Capability::OpenAiResponses,
            Capability::ImageGeneration,
            Capability::LiveSearch,
        ])
    }

    fn provider_id(&self) -> &str {
        &self.provider_id
    }
}
