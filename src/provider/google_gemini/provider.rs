use std::collections::HashMap;

use async_trait::async_trait;

use crate::capability::{Capability, CapabilitySet};
use crate::config::{ProviderConfig, ext};
use crate::error::{LLMError, map_http_error};
use crate::http::{DynHttpTransport, HttpRequest, HttpResponse, collect_stream_text};
use crate::provider::{ChatCall, ChatStream, LanguageModel};
use crate::types::{CallOptions, ChatResponse};

use super::request::build_gemini_body;
use super::response::map_response;
use super::stream::create_stream;
use super::types::GenerateContentResponse;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Google Gemini GenerateContent language model.
pub struct GoogleGeminiModel {
    transport: DynHttpTransport,
    config: ProviderConfig,
}

impl GoogleGeminiModel {
    pub fn new(transport: DynHttpTransport, config: ProviderConfig) -> Self {
        Self { transport, config }
    }

    fn base(&self) -> String {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        if base.ends_with("/v1beta") {
            base.to_string()
        } else {
            format!("{base}/v1beta")
        }
    }

    pub(crate) fn endpoint(&self, model: &str, stream: bool) -> String {
        let method = if stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        format!("{}/{}:{method}", self.base(), normalize_model(model))
    }

    fn api_key(&self) -> Result<String, LLMError> {
        self.config
            .resolve_api_key("GEMINI_API_KEY")
            .ok_or_else(|| LLMError::Auth {
                message: "missing API key for google (set GEMINI_API_KEY or config.api_key)"
                    .to_string(),
            })
    }

    fn build_headers(&self, options: &CallOptions) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        if let Some(extra) = self
            .config
            .extension::<HashMap<String, String>>(ext::EXTRA_HEADERS)
        {
            headers.extend(extra);
        }
        for (name, value) in &options.headers {
            headers.insert(name.clone(), value.clone());
        }
        headers
    }

    fn resolve_model(&self, options: &CallOptions) -> Result<String, LLMError> {
        options
            .model
            .clone()
            .or_else(|| self.config.model.clone())
            .ok_or_else(|| LLMError::invalid_request("model is required for google"))
    }

    fn build_request(
        &self,
        call: &ChatCall,
        stream: bool,
    ) -> Result<(HttpRequest, String, Vec<String>), LLMError> {
        let model = self.resolve_model(&call.options)?;
        let (body, warnings) = build_gemini_body(&call.prompt, &call.options)?;
        let url = self.endpoint(&model, stream);
        let payload = serde_json::to_vec(&body)
            .map_err(|err| LLMError::invalid_request(format!("failed to serialize: {err}")))?;
        // API key travels as a query parameter on this protocol.
        let request = HttpRequest::post_json(url.clone(), payload)
            .with_headers(self.build_headers(&call.options))
            .with_query("key", self.api_key()?)
            .with_timeout(self.config.timeout)
            .with_cancel(call.cancel.clone());
        Ok((request, url, warnings))
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

/// Accepts both `gemini-2.0-flash` and `models/gemini-2.0-flash`.
fn normalize_model(model: &str) -> String {
    if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{model}")
    }
}

#[async_trait]
impl LanguageModel for GoogleGeminiModel {
    async fn chat(&self, call: ChatCall) -> Result<ChatResponse, LLMError> {
        let (request, url, warnings) = self.build_request(&call, false)?;
        let response = self.transport.send(request).await?;
        let text = self.ensure_success(response)?;
        let parsed: GenerateContentResponse = serde_json::from_str(&text)
            .map_err(|err| LLMError::other(format!("failed to parse google response: {err}")))?;
        map_response(parsed, url, warnings)
    }

    async fn stream_chat(&self, call: ChatCall) -> Result<ChatStream, LLMError> {
        let (request, _url, _warnings) = self.build_request(&call, true)?;
        let response = self.transport.send_stream(request).await?;
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
        "google"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::http::{HttpStreamResponse, HttpTransport};

    struct NoopTransport;

    #[async_trait]
    impl HttpTransport for NoopTransport {
        async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, LLMError> {
            Err(LLMError::connection("noop"))
        }

        async fn send_stream(
            &self,
            _request: HttpRequest,
        ) -> Result<HttpStreamResponse, LLMError> {
            Err(LLMError::connection("noop"))
        }
    }

    #[test]
    fn endpoint_normalizes_model_path_and_method() {
        let model = GoogleGeminiModel::new(Arc::new(NoopTransport), ProviderConfig::new());
        assert_eq!(
            model.endpoint("gemini-2.0-flash", false),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent"
        );
        assert_eq!(
            model.endpoint("models/gemini-2.0-flash", true),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:streamGenerateContent"
        );
    }

    #[test]
    fn api_key_is_sent_as_query_parameter() {
        let model = GoogleGeminiModel::new(
            Arc::new(NoopTransport),
            ProviderConfig::new()
                .with_api_key("g-key")
                .with_model("gemini-2.0-flash"),
        );
        let (request, _, _) = model
            .build_request(&ChatCall::new("hi"), false)
            .expect("request");
        assert!(request.query.contains(&("key".to_string(), "g-key".to_string())));
        assert!(request.headers.get("Authorization").is_none());
    }
}
