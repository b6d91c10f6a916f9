//! Task-oriented public surface.
//!
//! Every function takes a combined `"provider:model"` identifier, resolves
//! it through the global registry, and forwards the call. Per-call
//! overrides (API key, base URL, options, cancellation) ride in
//! [`TaskParams`].

use std::collections::HashMap;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::config::{ProviderConfig, ext};
use crate::embedding::{RankedDocument, rerank_by_embedding};
use crate::error::{LLMError, map_http_error};
use crate::http::post_json_with_headers;
use crate::http::reqwest::ReqwestTransport;
use crate::prompt::Prompt;
use crate::provider::{ChatCall, ChatStream, ImageRequest, ImageResponse};
use crate::registry::RegistryClient;
use crate::stream_parts::{StreamPartAdapter, into_stream_parts};
use crate::structured::{
    GenerateObjectResult, ObjectSpec, StreamObjectResult, generate_object_with_model,
    stream_object_with_model,
};
use crate::types::{CallOptions, ChatResponse};

/// Per-call parameters shared by every task function.
#[derive(Debug, Clone, Default)]
pub struct TaskParams {
    /// API key override; falls back to the provider's environment variable.
    pub api_key: Option<String>,
    /// Base URL override for proxies and gateways.
    pub base_url: Option<String>,
    /// Provider extensions (proxy/TLS settings, thinking budget, ...).
    pub extensions: HashMap<String, Value>,
    /// Per-call option overlay.
    pub options: CallOptions,
    pub cancel: Option<CancellationToken>,
}

impl TaskParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            api_key: self.api_key.clone(),
            base_url: self.base_url.clone(),
            model: None,
            timeout: None,
            extensions: self.extensions.clone(),
        }
    }
}

fn client_for(model_id: &str, params: &TaskParams) -> Result<RegistryClient, LLMError> {
    let client = RegistryClient::new();
    let (provider_id, _) = client.parse(model_id)?;
    let provider_id = provider_id.to_string();
    Ok(client.with_config(provider_id, params.provider_config()))
}

fn chat_call(prompt: Prompt, params: &TaskParams) -> ChatCall {
    ChatCall {
        prompt,
        options: params.options.clone(),
        cancel: params.cancel.clone(),
    }
}

/// Result of [`generate_text`].
#[derive(Debug, Clone)]
pub struct GenerateTextResult {
    pub text: String,
    pub response: ChatResponse,
}

/// Generates a complete text response.
pub async fn generate_text(
    model_id: &str,
    prompt: impl Into<Prompt>,
    params: TaskParams,
) -> Result<GenerateTextResult, LLMError> {
    let model = client_for(model_id, &params)?.language_model(model_id)?;
    let response = model.chat(chat_call(prompt.into(), &params)).await?;
    Ok(GenerateTextResult {
        text: response.text_or_empty().to_string(),
        response,
    })
}

/// Streams protocol-agnostic chat events.
pub async fn stream_text(
    model_id: &str,
    prompt: impl Into<Prompt>,
    params: TaskParams,
) -> Result<ChatStream, LLMError> {
    let model = client_for(model_id, &params)?.language_model(model_id)?;
    model.stream_chat(chat_call(prompt.into(), &params)).await
}

/// Streams uniform stream parts with channel lifecycle markers.
pub async fn stream_text_parts(
    model_id: &str,
    prompt: impl Into<Prompt>,
    params: TaskParams,
) -> Result<StreamPartAdapter, LLMError> {
    let stream = stream_text(model_id, prompt, params).await?;
    Ok(into_stream_parts(stream))
}

/// Generates a typed object constrained by `spec`.
pub async fn generate_object<T: DeserializeOwned>(
    model_id: &str,
    spec: &ObjectSpec,
    prompt: impl Into<Prompt>,
    params: TaskParams,
) -> Result<GenerateObjectResult<T>, LLMError> {
    let model = client_for(model_id, &params)?.language_model(model_id)?;
    generate_object_with_model(model.as_ref(), chat_call(prompt.into(), &params), spec).await
}

/// Streams events while accumulating toward a typed object.
pub async fn stream_object<T: DeserializeOwned>(
    model_id: &str,
    spec: &ObjectSpec,
    prompt: impl Into<Prompt>,
    params: TaskParams,
) -> Result<StreamObjectResult<T>, LLMError> {
    let model = client_for(model_id, &params)?.language_model(model_id)?;
    stream_object_with_model(model.as_ref(), chat_call(prompt.into(), &params), spec).await
}

/// Embeds the inputs, preserving order.
pub async fn embed(
    model_id: &str,
    inputs: Vec<String>,
    params: TaskParams,
) -> Result<Vec<Vec<f32>>, LLMError> {
    let model = client_for(model_id, &params)?.text_embedding_model(model_id)?;
    model.embed(inputs, params.cancel.clone()).await
}

#[derive(Debug, Deserialize)]
struct NativeRerankResponse {
    #[serde(default)]
    results: Vec<NativeRerankEntry>,
}

#[derive(Debug, Deserialize)]
struct NativeRerankEntry {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    relevance_score: f32,
}

/// Ranks documents against a query.
///
/// Providers declaring a native reranker through the
/// [`ext::RERANK_ENDPOINT`] extension are called directly; everyone else
/// goes through the embedding + cosine-similarity fallback.
pub async fn rerank(
    model_id: &str,
    query: &str,
    documents: &[String],
    top_n: Option<usize>,
    params: TaskParams,
) -> Result<Vec<RankedDocument>, LLMError> {
    if let Some(endpoint) = params
        .provider_config()
        .extension::<String>(ext::RERANK_ENDPOINT)
    {
        return rerank_native(model_id, &endpoint, query, documents, top_n, &params).await;
    }
    let model = client_for(model_id, &params)?.text_embedding_model(model_id)?;
    rerank_by_embedding(model.as_ref(), query, documents, top_n, params.cancel.clone()).await
}

async fn rerank_native(
    model_id: &str,
    endpoint: &str,
    query: &str,
    documents: &[String],
    top_n: Option<usize>,
    params: &TaskParams,
) -> Result<Vec<RankedDocument>, LLMError> {
    let client = RegistryClient::new();
    let (_, model) = client.parse(model_id)?;
    let config = params.provider_config();
    let transport = ReqwestTransport::from_config(&config)?;

    let mut headers = HashMap::new();
    headers.insert("Content-Type".to_string(), "application/json".to_string());
    if let Some(api_key) = &config.api_key {
        headers.insert("Authorization".to_string(), format!("Bearer {api_key}"));
    }
    let body = json!({
        "model": model,
        "query": query,
        "documents": documents,
        "top_n": top_n,
    });
    let response = post_json_with_headers(
        &transport,
        endpoint,
        headers,
        &body,
        None,
        params.cancel.clone(),
    )
    .await?;
    let status = response.status;
    if !(200..300).contains(&status) {
        let headers = response.headers.clone();
        let text = response.into_string().unwrap_or_default();
        return Err(map_http_error(status, &headers, &text));
    }
    let text = response.into_string()?;
    let parsed: NativeRerankResponse = serde_json::from_str(&text)
        .map_err(|err| LLMError::other(format!("failed to parse rerank response: {err}")))?;
    Ok(parsed
        .results
        .into_iter()
        .filter(|entry| entry.index < documents.len())
        .map(|entry| RankedDocument {
            index: entry.index,
            document: documents[entry.index].clone(),
            score: entry.relevance_score,
        })
        .collect())
}

/// Generates images from a text prompt.
pub async fn generate_image(
    model_id: &str,
    prompt: impl Into<String>,
    params: TaskParams,
) -> Result<ImageResponse, LLMError> {
    let client = client_for(model_id, &params)?;
    let (_, model_name) = client.parse(model_id)?;
    let model_name = model_name.to_string();
    let model = client.image_model(model_id)?;
    model
        .generate_image(ImageRequest {
            prompt: prompt.into(),
            model: Some(model_name),
            size: None,
            count: None,
            cancel: params.cancel.clone(),
        })
        .await
}
