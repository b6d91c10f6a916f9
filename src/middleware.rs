//! Middleware composition around chat and embed operations.
//!
//! Middlewares wrap a `next` handler and may transform the call, observe
//! the response, or both — on the synchronous and the streaming path alike.
//! Composition follows registration order applied outside-in: the first
//! registered middleware observes the original request last and sees the
//! model's response first.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::capability::CapabilitySet;
use crate::error::LLMError;
use crate::prompt::{ChatMessage, ChatRole};
use crate::provider::{
    ChatCall, ChatStream, DynEmbeddingModel, DynLanguageModel, EmbeddingModel, LanguageModel,
};
use crate::types::{ChatResponse, ToolSpec};

/// The continuation a chat middleware wraps.
#[async_trait]
pub trait ChatHandler: Send + Sync {
    async fn chat(&self, call: ChatCall) -> Result<ChatResponse, LLMError>;
    async fn stream_chat(&self, call: ChatCall) -> Result<ChatStream, LLMError>;
}

/// Per-call middleware around chat operations.
///
/// Default implementations pass through, so a middleware only overrides the
/// paths it cares about. Implementations must not block; streaming wrappers
/// must not aggregate stream content unless explicitly configured to.
#[async_trait]
pub trait ChatMiddleware: Send + Sync {
    async fn chat(&self, call: ChatCall, next: &dyn ChatHandler) -> Result<ChatResponse, LLMError> {
        next.chat(call).await
    }

    async fn stream_chat(
        &self,
        call: ChatCall,
        next: &dyn ChatHandler,
    ) -> Result<ChatStream, LLMError> {
        next.stream_chat(call).await
    }
}

/// Language model wrapped by an ordered middleware chain.
pub struct ChatPipeline {
    model: DynLanguageModel,
    middlewares: Vec<Arc<dyn ChatMiddleware>>,
}

impl ChatPipeline {
    pub fn new(model: DynLanguageModel) -> Self {
        Self {
            model,
            middlewares: Vec::new(),
        }
    }

    /// Appends a middleware; later registrations wrap earlier ones.
    pub fn with(mut self, middleware: Arc<dyn ChatMiddleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn into_model(self) -> DynLanguageModel {
        Arc::new(self)
    }
}

struct Next<'a> {
    model: &'a dyn LanguageModel,
    rest: &'a [Arc<dyn ChatMiddleware>],
}

#[async_trait]
impl ChatHandler for Next<'_> {
    async fn chat(&self, call: ChatCall) -> Result<ChatResponse, LLMError> {
        match self.rest.split_last() {
            Some((middleware, rest)) => {
                let next = Next {
                    model: self.model,
                    rest,
                };
                middleware.chat(call, &next).await
            }
            None => self.model.chat(call).await,
        }
    }

    async fn stream_chat(&self, call: ChatCall) -> Result<ChatStream, LLMError> {
        match self.rest.split_last() {
            Some((middleware, rest)) => {
                let next = Next {
                    model: self.model,
                    rest,
                };
                middleware.stream_chat(call, &next).await
            }
            None => self.model.stream_chat(call).await,
        }
    }
}

#[async_trait]
impl LanguageModel for ChatPipeline {
    async fn chat(&self, call: ChatCall) -> Result<ChatResponse, LLMError> {
        Next {
            model: self.model.as_ref(),
            rest: &self.middlewares,
        }
        .chat(call)
        .await
    }

    async fn stream_chat(&self, call: ChatCall) -> Result<ChatStream, LLMError> {
        Next {
            model: self.model.as_ref(),
            rest: &self.middlewares,
        }
        .stream_chat(call)
        .await
    }

    fn capabilities(&self) -> CapabilitySet {
        self.model.capabilities()
    }

    fn provider_id(&self) -> &str {
        self.model.provider_id()
    }
}

/// Injects a default system prompt and/or default tools when the call
/// leaves them unset.
#[derive(Debug, Default)]
pub struct DefaultChatSettings {
    system_prompt: Option<String>,
    /// Prepend the default prompt even when the caller supplied a system
    /// message of their own.
    always_prepend_system: bool,
    default_tools: Option<Vec<ToolSpec>>,
}

impl DefaultChatSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn always_prepend_system(mut self) -> Self {
        self.always_prepend_system = true;
        self
    }

    pub fn with_default_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.default_tools = Some(tools);
        self
    }

    fn apply(&self, call: &mut ChatCall) {
        if let Some(system) = &self.system_prompt {
            if self.always_prepend_system || !call.prompt.has_system() {
                call.prompt
                    .messages
                    .insert(0, ChatMessage::text(ChatRole::System, system.clone()));
            }
        }
        if call.options.tools.is_none() {
            if let Some(tools) = &self.default_tools {
                call.options.tools = Some(tools.clone());
            }
        }
    }
}

#[async_trait]
impl ChatMiddleware for DefaultChatSettings {
    async fn chat(
        &self,
        mut call: ChatCall,
        next: &dyn ChatHandler,
    ) -> Result<ChatResponse, LLMError> {
        self.apply(&mut call);
        next.chat(call).await
    }

    async fn stream_chat(
        &self,
        mut call: ChatCall,
        next: &dyn ChatHandler,
    ) -> Result<ChatStream, LLMError> {
        self.apply(&mut call);
        next.stream_chat(call).await
    }
}

const DEFAULT_PREVIEW_LIMIT: usize = 200;

/// Structured request/response logging keyed by model id.
///
/// Authorization-style header values are masked, previews are truncated,
/// and stream content is never aggregated.
#[derive(Debug)]
pub struct LoggingMiddleware {
    preview_limit: usize,
}

impl Default for LoggingMiddleware {
    fn default() -> Self {
        Self {
            preview_limit: DEFAULT_PREVIEW_LIMIT,
        }
    }
}

impl LoggingMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_preview_limit(mut self, limit: usize) -> Self {
        self.preview_limit = limit;
        self
    }

    fn preview(&self, text: &str) -> String {
        let mut end = self.preview_limit.min(text.len());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        if end < text.len() {
            format!("{}…", &text[..end])
        } else {
            text.to_string()
        }
    }

    fn describe_call(&self, call: &ChatCall) -> (String, usize, String) {
        let model = call.options.model.clone().unwrap_or_default();
        let headers = mask_headers(&call.options.headers);
        (model, call.prompt.messages.len(), headers)
    }
}

/// Masks secret-carrying header values, keeping a short prefix for
/// correlation.
pub(crate) fn mask_headers(headers: &HashMap<String, String>) -> String {
    let mut parts: Vec<String> = headers
        .iter()
        .map(|(name, value)| {
            let lower = name.to_ascii_lowercase();
            if lower.contains("authorization") || lower.contains("api-key") || lower.contains("key")
            {
                format!("{name}={}", mask_secret(value))
            } else {
                format!("{name}={value}")
            }
        })
        .collect();
    parts.sort();
    parts.join(", ")
}

pub(crate) fn mask_secret(value: &str) -> String {
    let visible = value.len().min(6);
    let mut end = visible;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}***", &value[..end])
}

#[async_trait]
impl ChatMiddleware for LoggingMiddleware {
    async fn chat(&self, call: ChatCall, next: &dyn ChatHandler) -> Result<ChatResponse, LLMError> {
        let (model, messages, headers) = self.describe_call(&call);
        let started = Instant::now();
        tracing::debug!(%model, messages, %headers, "chat request");
        let result = next.chat(call).await;
        match &result {
            Ok(response) => tracing::debug!(
                %model,
                elapsed_ms = started.elapsed().as_millis() as u64,
                finish_reason = ?response.finish_reason,
                preview = %self.preview(response.text_or_empty()),
                "chat response"
            ),
            Err(err) => tracing::debug!(
                %model,
                elapsed_ms = started.elapsed().as_millis() as u64,
                error = %err,
                "chat failed"
            ),
        }
        result
    }

    async fn stream_chat(
        &self,
        call: ChatCall,
        next: &dyn ChatHandler,
    ) -> Result<ChatStream, LLMError> {
        let (model, messages, headers) = self.describe_call(&call);
        tracing::debug!(%model, messages, %headers, "stream request");
        // Stream content is not aggregated here; only setup is logged.
        next.stream_chat(call).await
    }
}

/// The continuation an embedding middleware wraps.
#[async_trait]
pub trait EmbedHandler: Send + Sync {
    async fn embed(
        &self,
        inputs: Vec<String>,
        cancel: Option<CancellationToken>,
    ) -> Result<Vec<Vec<f32>>, LLMError>;
}

/// Per-call middleware around embed operations.
#[async_trait]
pub trait EmbeddingMiddleware: Send + Sync {
    async fn embed(
        &self,
        inputs: Vec<String>,
        cancel: Option<CancellationToken>,
        next: &dyn EmbedHandler,
    ) -> Result<Vec<Vec<f32>>, LLMError> {
        next.embed(inputs, cancel).await
    }
}

/// Embedding model wrapped by an ordered middleware chain.
pub struct EmbeddingPipeline {
    model: DynEmbeddingModel,
    middlewares: Vec<Arc<dyn EmbeddingMiddleware>>,
}

impl EmbeddingPipeline {
    pub fn new(model: DynEmbeddingModel) -> Self {
        Self {
            model,
            middlewares: Vec::new(),
        }
    }

    pub fn with(mut self, middleware: Arc<dyn EmbeddingMiddleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn into_model(self) -> DynEmbeddingModel {
        Arc::new(self)
    }
}

struct EmbedNext<'a> {
    model: &'a dyn EmbeddingModel,
    rest: &'a [Arc<dyn EmbeddingMiddleware>],
}

#[async_trait]
impl EmbedHandler for EmbedNext<'_> {
    async fn embed(
        &self,
        inputs: Vec<String>,
        cancel: Option<CancellationToken>,
    ) -> Result<Vec<Vec<f32>>, LLMError> {
        match self.rest.split_last() {
            Some((middleware, rest)) => {
                let next = EmbedNext {
                    model: self.model,
                    rest,
                };
                middleware.embed(inputs, cancel, &next).await
            }
            None => self.model.embed(inputs, cancel).await,
        }
    }
}

#[async_trait]
impl EmbeddingModel for EmbeddingPipeline {
    async fn embed(
        &self,
        inputs: Vec<String>,
        cancel: Option<CancellationToken>,
    ) -> Result<Vec<Vec<f32>>, LLMError> {
        EmbedNext {
            model: self.model.as_ref(),
            rest: &self.middlewares,
        }
        .embed(inputs, cancel)
        .await
    }

    fn provider_id(&self) -> &str {
        self.model.provider_id()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct RecordingModel {
        seen: Mutex<Vec<ChatCall>>,
    }

    #[async_trait]
    impl LanguageModel for RecordingModel {
        async fn chat(&self, call: ChatCall) -> Result<ChatResponse, LLMError> {
            self.seen.lock().unwrap().push(call);
            Ok(ChatResponse {
                text: Some("ok".to_string()),
                ..Default::default()
            })
        }

        async fn stream_chat(&self, _call: ChatCall) -> Result<ChatStream, LLMError> {
            Ok(Box::pin(futures_util::stream::empty()))
        }

        fn capabilities(&self) -> CapabilitySet {
            CapabilitySet::new()
        }

        fn provider_id(&self) -> &str {
            "mock"
        }
    }

    /// Middleware that tags the user header so ordering is observable.
    struct TagMiddleware {
        tag: &'static str,
    }

    #[async_trait]
    impl ChatMiddleware for TagMiddleware {
        async fn chat(
            &self,
            mut call: ChatCall,
            next: &dyn ChatHandler,
        ) -> Result<ChatResponse, LLMError> {
            let trail = call
                .options
                .headers
                .entry("X-Trail".to_string())
                .or_default();
            trail.push_str(self.tag);
            next.chat(call).await
        }
    }

    #[tokio::test]
    async fn first_registered_middleware_sees_the_request_last() {
        let model = Arc::new(RecordingModel {
            seen: Mutex::new(Vec::new()),
        });
        let pipeline = ChatPipeline::new(model.clone())
            .with(Arc::new(TagMiddleware { tag: "first" }))
            .with(Arc::new(TagMiddleware { tag: "second" }));

        pipeline.chat(ChatCall::new("hi")).await.expect("chat");

        let seen = model.seen.lock().unwrap();
        // second registered is outermost, so it tags before first
        assert_eq!(seen[0].options.headers["X-Trail"], "secondfirst");
    }

    #[tokio::test]
    async fn default_settings_inject_system_prompt_only_when_absent() {
        let model = Arc::new(RecordingModel {
            seen: Mutex::new(Vec::new()),
        });
        let pipeline = ChatPipeline::new(model.clone()).with(Arc::new(
            DefaultChatSettings::new().with_system_prompt("be helpful"),
        ));

        pipeline.chat(ChatCall::new("hi")).await.expect("chat");
        pipeline
            .chat(ChatCall::new(crate::prompt::Prompt::with_system(
                "custom",
                "hi",
            )))
            .await
            .expect("chat");

        let seen = model.seen.lock().unwrap();
        assert_eq!(seen[0].prompt.messages[0].joined_text(), "be helpful");
        // caller-provided system message wins
        assert_eq!(seen[1].prompt.messages[0].joined_text(), "custom");
    }

    #[tokio::test]
    async fn default_tools_do_not_override_call_tools() {
        let model = Arc::new(RecordingModel {
            seen: Mutex::new(Vec::new()),
        });
        let default_tool = ToolSpec::new("default", "", serde_json::json!({}));
        let pipeline = ChatPipeline::new(model.clone()).with(Arc::new(
            DefaultChatSettings::new().with_default_tools(vec![default_tool]),
        ));

        pipeline.chat(ChatCall::new("hi")).await.expect("chat");
        let with_explicit = ChatCall::new("hi").with_options(
            crate::types::CallOptions::default().with_tools(Vec::new()),
        );
        pipeline.chat(with_explicit).await.expect("chat");

        let seen = model.seen.lock().unwrap();
        assert_eq!(seen[0].options.tools.as_ref().unwrap().len(), 1);
        // explicitly empty means "disable", not "inherit"
        assert_eq!(seen[1].options.tools.as_ref().unwrap().len(), 0);
    }

    #[test]
    fn header_masking_keeps_a_prefix_only() {
        let headers = HashMap::from([
            ("Authorization".to_string(), "Bearer sk-secret-123".to_string()),
            ("Accept".to_string(), "application/json".to_string()),
        ]);
        let masked = mask_headers(&headers);
        assert!(masked.contains("Authorization=Bearer***"));
        assert!(masked.contains("Accept=application/json"));
        assert!(!masked.contains("sk-secret-123"));
    }
}
