use std::collections::HashMap;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value, json};

use crate::capability::{Capability, CapabilitySet};
use crate::config::ProviderConfig;
use crate::error::{LLMError, map_http_error};
use crate::http::{
    DynHttpTransport, HttpResponse, collect_stream_text, post_json_stream_with_headers,
    post_json_with_headers,
};
use crate::prompt::{ChatMessage, ChatRole, MessagePart, Prompt};
use crate::provider::{ChatCall, ChatStream, LanguageModel};
use crate::types::{
    CallOptions, ChatResponse, FinishReason, ResponseMetadata, ResponseFormat, TokenUsage,
    ToolCallRequest,
};

use super::stream::create_stream;
use super::types::OllamaChatResponse;

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Ollama chat language model for local deployments.
pub struct OllamaModel {
    transport: DynHttpTransport,
    config: ProviderConfig,
}

impl OllamaModel {
    pub fn new(transport: DynHttpTransport, config: ProviderConfig) -> Self {
        Self { transport, config }
    }

    pub(crate) fn endpoint(&self) -> String {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        format!("{base}/api/chat")
    }

    fn build_headers(&self, options: &CallOptions) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
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
            .ok_or_else(|| LLMError::invalid_request("model is required for ollama"))
    }

    fn compile(&self, call: &ChatCall, stream: bool) -> Result<Value, LLMError> {
        let model = self.resolve_model(&call.options)?;
        let mut body = Map::new();
        body.insert("model".to_string(), Value::String(model));
        body.insert(
            "messages".to_string(),
            Value::Array(convert_messages(&call.prompt)?),
        );
        body.insert("stream".to_string(), Value::Bool(stream));

        let mut runtime = Map::new();
        if let Some(temperature) = call.options.temperature {
            runtime.insert("temperature".to_string(), Value::from(temperature));
        }
        if let Some(top_p) = call.options.top_p {
            runtime.insert("top_p".to_string(), Value::from(top_p));
        }
        if let Some(top_k) = call.options.top_k {
            runtime.insert("top_k".to_string(), Value::from(top_k));
        }
        if let Some(max_tokens) = call.options.max_tokens {
            runtime.insert("num_predict".to_string(), Value::from(max_tokens));
        }
        if let Some(stop) = &call.options.stop_sequences {
            runtime.insert("stop".to_string(), json!(stop));
        }
        if !runtime.is_empty() {
            body.insert("options".to_string(), Value::Object(runtime));
        }

        if let Some(tools) = &call.options.tools {
            if !tools.is_empty() {
                let tools: Vec<Value> = tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": tool.name,
                                "description": tool.description,
                                "parameters": tool.parameters,
                            }
                        })
                    })
                    .collect();
                body.insert("tools".to_string(), Value::Array(tools));
            }
        }
        match &call.options.response_format {
            Some(ResponseFormat::JsonObject) => {
                body.insert("format".to_string(), Value::String("json".to_string()));
            }
            Some(ResponseFormat::JsonSchema { schema, .. }) => {
                body.insert("format".to_string(), schema.clone());
            }
            _ => {}
        }
        Ok(Value::Object(body))
    }
}

fn convert_messages(prompt: &Prompt) -> Result<Vec<Value>, LLMError> {
    let mut out = Vec::new();
    for message in &prompt.messages {
        convert_message(message, &mut out)?;
    }
    Ok(out)
}

fn convert_message(message: &ChatMessage, out: &mut Vec<Value>) -> Result<(), LLMError> {
    let mut text = String::new();
    let mut images = Vec::new();
    let mut tool_calls = Vec::new();
    let mut tool_messages = Vec::new();

    for part in &message.parts {
        match part {
            MessagePart::Text { text: t, .. } => text.push_str(t),
            MessagePart::Reasoning { .. } => {}
            MessagePart::InlineFile { data, mime } => {
                if mime.is_image() {
                    images.push(Value::String(BASE64.encode(data)));
                }
            }
            MessagePart::UrlFile { .. } => {
                return Err(LLMError::invalid_request(
                    "ollama does not accept URL file parts; inline the bytes",
                ));
            }
            MessagePart::ToolCall(call) => {
                let args = call.arguments_value().map_err(|err| {
                    LLMError::invalid_request(format!("tool call args not valid JSON: {err}"))
                })?;
                tool_calls.push(json!({"function": {"name": call.name, "arguments": args}}));
            }
            MessagePart::ToolResult { payload, .. } => {
                tool_messages.push(json!({
                    "role": "tool",
                    "content": payload.to_content_string(),
                }));
            }
        }
    }

    let has_main = !text.is_empty() || !images.is_empty() || !tool_calls.is_empty();
    if !has_main && tool_messages.is_empty() {
        return Err(LLMError::invalid_request(
            "message serializes to empty content",
        ));
    }
    if has_main {
        let mut obj = Map::new();
        obj.insert(
            "role".to_string(),
            Value::String(message.role.as_str().to_string()),
        );
        obj.insert("content".to_string(), Value::String(text));
        if !images.is_empty() {
            obj.insert("images".to_string(), Value::Array(images));
        }
        if !tool_calls.is_empty() {
            if message.role != ChatRole::Assistant {
                return Err(LLMError::invalid_request(
                    "tool-call parts are only valid on assistant messages",
                ));
            }
            obj.insert("tool_calls".to_string(), Value::Array(tool_calls));
        }
        out.push(Value::Object(obj));
    }
    out.extend(tool_messages);
    Ok(())
}

#[async_trait]
impl LanguageModel for OllamaModel {
    async fn chat(&self, call: ChatCall) -> Result<ChatResponse, LLMError> {
        let body = self.compile(&call, false)?;
        let url = self.endpoint();
        let response = post_json_with_headers(
            self.transport.as_ref(),
            url.clone(),
            self.build_headers(&call.options),
            &body,
            self.config.timeout,
            call.cancel.clone(),
        )
        .await?;
        let text = ensure_success(response)?;
        let parsed: OllamaChatResponse = serde_json::from_str(&text)
            .map_err(|err| LLMError::other(format!("failed to parse ollama response: {err}")))?;
        Ok(map_response(parsed, url))
    }

    async fn stream_chat(&self, call: ChatCall) -> Result<ChatStream, LLMError> {
        let body = self.compile(&call, true)?;
        let response = post_json_stream_with_headers(
            self.transport.as_ref(),
            self.endpoint(),
            self.build_headers(&call.options),
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
            Capability::Vision,
            Capability::Embedding,
            Capability::ModelListing,
        ])
    }

    fn provider_id(&self) -> &str {
        "ollama"
    }
}

fn ensure_success(response: HttpResponse) -> Result<String, LLMError> {
    let status = response.status;
    if (200..300).contains(&status) {
        response.into_string()
    } else {
        let headers = response.headers.clone();
        let text = response.into_string().unwrap_or_default();
        Err(map_http_error(status, &headers, &text))
    }
}

fn map_response(resp: OllamaChatResponse, endpoint: String) -> ChatResponse {
    let raw = serde_json::to_value(&resp).ok();
    let mut text = None;
    let mut thinking = None;
    let mut tool_calls = Vec::new();

    if let Some(message) = &resp.message {
        text = message.content.clone().filter(|c| !c.is_empty());
        thinking = message.thinking.clone().filter(|t| !t.is_empty());
        for (idx, call) in message
            .tool_calls
            .clone()
            .unwrap_or_default()
            .into_iter()
            .enumerate()
        {
            let function = call.function.unwrap_or(super::types::OllamaToolFunction {
                name: None,
                arguments: None,
            });
            tool_calls.push(ToolCallRequest {
                id: Some(crate::stream_parts::synthesized_call_id(idx)),
                name: function.name.unwrap_or_default(),
                arguments: function
                    .arguments
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "{}".to_string()),
            });
        }
    }

    let finish_reason = if !tool_calls.is_empty() {
        Some(FinishReason::ToolCalls)
    } else {
        resp.done_reason.as_deref().map(|r| match r {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            other => FinishReason::Other(other.to_string()),
        })
    };

    ChatResponse {
        text,
        thinking,
        tool_calls,
        provider_outputs: Vec::new(),
        usage: Some(TokenUsage {
            prompt_tokens: resp.prompt_eval_count,
            completion_tokens: resp.eval_count,
            reasoning_tokens: None,
            total_tokens: match (resp.prompt_eval_count, resp.eval_count) {
                (Some(p), Some(e)) => Some(p + e),
                _ => None,
            },
            details: None,
        }),
        finish_reason,
        warnings: Vec::new(),
        model: resp.model.clone(),
        metadata: ResponseMetadata {
            provider: "ollama".to_string(),
            request_id: None,
            response_id: None,
            endpoint: Some(endpoint),
            raw,
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::http::{HttpRequest, HttpStreamResponse, HttpTransport};

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

    fn model() -> OllamaModel {
        OllamaModel::new(
            Arc::new(NoopTransport),
            ProviderConfig::new().with_model("llama3.2"),
        )
    }

    #[test]
    fn body_maps_options_into_runtime_options() {
        let call = ChatCall::new("hi").with_options(CallOptions {
            temperature: Some(0.1),
            max_tokens: Some(64),
            ..Default::default()
        });
        let body = model().compile(&call, true).expect("body");
        assert_eq!(body["model"], "llama3.2");
        assert_eq!(body["stream"], true);
        assert_eq!(body["options"]["num_predict"], 64);
        assert_eq!(body["messages"][0]["content"], "hi");
    }

    #[test]
    fn json_schema_response_format_becomes_format_field() {
        let call = ChatCall::new("hi").with_options(
            CallOptions::default().with_response_format(ResponseFormat::JsonSchema {
                name: None,
                schema: serde_json::json!({"type": "object"}),
                strict: None,
            }),
        );
        let body = model().compile(&call, false).expect("body");
        assert_eq!(body["format"]["type"], "object");
    }
}
