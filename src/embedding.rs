//! Embedding models plus the cosine-similarity rerank fallback.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::config::ProviderConfig;
use crate::error::{LLMError, map_http_error};
use crate::http::{DynHttpTransport, post_json_with_headers};
use crate::provider::EmbeddingModel;

/// OpenAI `/v1/embeddings` model, also used by compatible gateways.
pub struct OpenAiEmbeddingModel {
    transport: DynHttpTransport,
    config: ProviderConfig,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    #[serde(default)]
    data: Vec<EmbeddingEntry>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingEntry {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    embedding: Vec<f32>,
}

impl OpenAiEmbeddingModel {
    pub fn new(transport: DynHttpTransport, config: ProviderConfig) -> Self {
        Self { transport, config }
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or("https://api.openai.com")
            .trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{base}/embeddings")
        } else {
            format!("{base}/v1/embeddings")
        }
    }
}

#[async_trait]
impl EmbeddingModel for OpenAiEmbeddingModel {
    async fn embed(
        &self,
        inputs: Vec<String>,
        cancel: Option<CancellationToken>,
    ) -> Result<Vec<Vec<f32>>, LLMError> {
        let api_key = self
            .config
            .resolve_api_key("OPENAI_API_KEY")
            .ok_or_else(|| LLMError::Auth {
                message: "missing API key for openai embeddings".to_string(),
            })?;
        let model = self
            .config
            .model
            .clone()
            .unwrap_or_else(|| "text-embedding-3-small".to_string());
        let expected = inputs.len();

        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), format!("Bearer {api_key}"));
        headers.insert("Content-Type".to_string(), "application/json".to_string());

        let body = json!({"model": model, "input": inputs});
        let response = post_json_with_headers(
            self.transport.as_ref(),
            self.endpoint(),
            headers,
            &body,
            self.config.timeout,
            cancel,
        )
        .await?;
        let status = response.status;
        if !(200..300).contains(&status) {
            let headers = response.headers.clone();
            let text = response.into_string().unwrap_or_default();
            return Err(map_http_error(status, &headers, &text));
        }
        let text = response.into_string()?;
        let parsed: EmbeddingsResponse = serde_json::from_str(&text)
            .map_err(|err| LLMError::other(format!("failed to parse embeddings: {err}")))?;

        // Entries come back with explicit indexes; restore input order.
        let mut vectors = vec![Vec::new(); expected];
        for entry in parsed.data {
            if entry.index < vectors.len() {
                vectors[entry.index] = entry.embedding;
            }
        }
        Ok(vectors)
    }

    fn provider_id(&self) -> &str {
        "openai"
    }
}

/// Ollama `/api/embed` model for local embeddings.
pub struct OllamaEmbeddingModel {
    transport: DynHttpTransport,
    config: ProviderConfig,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbeddingModel {
    pub fn new(transport: DynHttpTransport, config: ProviderConfig) -> Self {
        Self { transport, config }
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or("http://localhost:11434")
            .trim_end_matches('/');
        format!("{base}/api/embed")
    }
}

#[async_trait]
impl EmbeddingModel for OllamaEmbeddingModel {
    async fn embed(
        &self,
        inputs: Vec<String>,
        cancel: Option<CancellationToken>,
    ) -> Result<Vec<Vec<f32>>, LLMError> {
        let model = self
            .config
            .model
            .clone()
            .ok_or_else(|| LLMError::invalid_request("model is required for ollama embeddings"))?;
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());

        let body = json!({"model": model, "input": inputs});
        let response = post_json_with_headers(
            self.transport.as_ref(),
            self.endpoint(),
            headers,
            &body,
            self.config.timeout,
            cancel,
        )
        .await?;
        let status = response.status;
        if !(200..300).contains(&status) {
            let headers = response.headers.clone();
            let text = response.into_string().unwrap_or_default();
            return Err(map_http_error(status, &headers, &text));
        }
        let text = response.into_string()?;
        let parsed: OllamaEmbedResponse = serde_json::from_str(&text)
            .map_err(|err| LLMError::other(format!("failed to parse embeddings: {err}")))?;
        Ok(parsed.embeddings)
    }

    fn provider_id(&self) -> &str {
        "ollama"
    }
}

/// Cosine similarity between two vectors; zero-length inputs score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// One reranked document.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedDocument {
    /// Index into the original documents slice.
    pub index: usize,
    pub document: String,
    pub score: f32,
}

/// Ranks `documents` against `query` using embeddings and cosine
/// similarity. This is the fallback used when a provider declares no native
/// reranker (`rerank_endpoint` extension absent).
pub async fn rerank_by_embedding(
    model: &dyn EmbeddingModel,
    query: &str,
    documents: &[String],
    top_n: Option<usize>,
    cancel: Option<CancellationToken>,
) -> Result<Vec<RankedDocument>, LLMError> {
    if documents.is_empty() {
        return Ok(Vec::new());
    }
    let mut inputs = Vec::with_capacity(documents.len() + 1);
    inputs.push(query.to_string());
    inputs.extend(documents.iter().cloned());

    let vectors = model.embed(inputs, cancel).await?;
    let (query_vector, document_vectors) = vectors
        .split_first()
        .ok_or_else(|| LLMError::other("embedding response was empty"))?;

    let mut ranked: Vec<RankedDocument> = document_vectors
        .iter()
        .enumerate()
        .map(|(index, vector)| RankedDocument {
            index,
            document: documents[index].clone(),
            score: cosine_similarity(query_vector, vector),
        })
        .collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    if let Some(top_n) = top_n {
        ranked.truncate(top_n);
    }
    Ok(ranked)
}
