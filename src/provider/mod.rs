use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_core::Stream;
use tokio_util::sync::CancellationToken;

use crate::capability::CapabilitySet;
use crate::error::LLMError;
use crate::prompt::Prompt;
use crate::types::{CallOptions, ChatEvent, ChatResponse};

pub mod anthropic_messages;
pub mod compat;
pub mod google_gemini;
pub mod ollama;
pub mod openai_chat;
pub mod openai_responses;

/// Stream alias returned by language models for incremental responses.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatEvent, LLMError>> + Send>>;

/// One chat invocation: the prompt, the per-call option overlay, and the
/// cooperative cancellation token.
#[derive(Debug, Clone, Default)]
pub struct ChatCall {
    pub prompt: Prompt,
    pub options: CallOptions,
    pub cancel: Option<CancellationToken>,
}

impl ChatCall {
    pub fn new(prompt: impl Into<Prompt>) -> Self {
        Self {
            prompt: prompt.into(),
            options: CallOptions::default(),
            cancel: None,
        }
    }

    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Trait implemented by every chat-capable provider integration.
///
/// Implementations translate a [`ChatCall`] into a vendor-specific HTTP
/// request and map the response back to [`ChatResponse`] or a stream of
/// [`ChatEvent`] values. Capability mismatches are not enforced here;
/// requests are forwarded best-effort and surface as provider errors.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Submits a request and waits for the full response body.
    async fn chat(&self, call: ChatCall) -> Result<ChatResponse, LLMError>;

    /// Submits a request and returns a stream of incremental events.
    async fn stream_chat(&self, call: ChatCall) -> Result<ChatStream, LLMError>;

    /// Capabilities this model instance declares.
    fn capabilities(&self) -> CapabilitySet;

    /// Provider identifier used in logs, error reporting and option lookup.
    fn provider_id(&self) -> &str;
}

/// Thread-safe handle to a language model.
pub type DynLanguageModel = Arc<dyn LanguageModel>;

/// Trait implemented by embedding-capable providers.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Embeds each input string into a vector.
    ///
    /// The result preserves input order and length.
    async fn embed(
        &self,
        inputs: Vec<String>,
        cancel: Option<CancellationToken>,
    ) -> Result<Vec<Vec<f32>>, LLMError>;

    fn provider_id(&self) -> &str;
}

pub type DynEmbeddingModel = Arc<dyn EmbeddingModel>;

/// Image generation request.
#[derive(Debug, Clone, Default)]
pub struct ImageRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub size: Option<String>,
    pub count: Option<u32>,
    pub cancel: Option<CancellationToken>,
}

/// One generated image: either a URL or inline base64 data.
#[derive(Debug, Clone, Default)]
pub struct GeneratedImage {
    pub url: Option<String>,
    pub b64_data: Option<String>,
    pub revised_prompt: Option<String>,
}

/// Image generation response.
#[derive(Debug, Clone, Default)]
pub struct ImageResponse {
    pub images: Vec<GeneratedImage>,
}

/// Trait implemented by image-generation-capable providers.
#[async_trait]
pub trait ImageModel: Send + Sync {
    async fn generate_image(&self, request: ImageRequest) -> Result<ImageResponse, LLMError>;

    fn provider_id(&self) -> &str;
}

pub type DynImageModel = Arc<dyn ImageModel>;
