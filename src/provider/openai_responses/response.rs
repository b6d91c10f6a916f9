use serde::Deserialize;
use serde_json::Value;

use crate::error::LLMError;
use crate::types::{
    ChatResponse, FinishReason, ResponseMetadata, TokenUsage, ToolCallRequest,
};

use super::types::{ResponsesResponse, WireUsage};

pub(crate) fn map_response(
    resp: ResponsesResponse,
    endpoint: String,
    warnings: Vec<String>,
) -> Result<ChatResponse, LLMError> {
    let raw = serde_json::to_value(&resp).ok();
    let mut text = String::new();
    let mut thinking = String::new();
    let mut tool_calls = Vec::new();
    let mut provider_outputs = Vec::new();

    for item in &resp.output {
        match item.get("type").and_then(|t| t.as_str()).unwrap_or("") {
            "message" => {
                if let Some(content) = item.get("content").and_then(|c| c.as_array()) {
                    for part in content {
                        match part.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                            "output_text" | "text" => {
                                if let Some(t) = part.get("text").and_then(|t| t.as_str()) {
                                    text.push_str(t);
                                }
                            }
                            "refusal" => {
                                if let Some(t) = part.get("refusal").and_then(|t| t.as_str()) {
                                    text.push_str(t);
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }
            "reasoning" => {
                if let Some(summary) = item.get("summary").and_then(|s| s.as_array()) {
                    for entry in summary {
                        if let Some(t) = entry.get("text").and_then(|t| t.as_str()) {
                            thinking.push_str(t);
                        }
                    }
                }
            }
            "function_call" => {
                tool_calls.push(ToolCallRequest {
                    id: item
                        .get("call_id")
                        .or_else(|| item.get("id"))
                        .and_then(|v| v.as_str())
                        .map(String::from),
                    name: item
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    arguments: item
                        .get("arguments")
                        .and_then(|v| v.as_str())
                        .unwrap_or("{}")
                        .to_string(),
                });
            }
            // Built-in tool calls executed server-side pass through for the
            // typed views below.
            _ => provider_outputs.push(item.clone()),
        }
    }

    let finish_reason = if resp.incomplete_details.is_some() {
        Some(FinishReason::Length)
    } else if !tool_calls.is_empty() {
        Some(FinishReason::ToolCalls)
    } else if resp.status.as_deref() == Some("completed") {
        Some(FinishReason::Stop)
    } else {
        resp.status.clone().map(FinishReason::Other)
    };

    Ok(ChatResponse {
        text: (!text.is_empty()).then_some(text),
        thinking: (!thinking.is_empty()).then_some(thinking),
        tool_calls,
        provider_outputs,
        usage: resp.usage.as_ref().map(convert_usage),
        finish_reason,
        warnings,
        model: resp.model.clone(),
        metadata: ResponseMetadata {
            provider: "openai".to_string(),
            request_id: resp.id.clone(),
            response_id: resp.id.clone(),
            endpoint: Some(endpoint),
            raw,
        },
    })
}

pub(crate) fn convert_usage(usage: &WireUsage) -> TokenUsage {
    TokenUsage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        reasoning_tokens: usage
            .output_tokens_details
            .as_ref()
            .and_then(|d| d.reasoning_tokens),
        total_tokens: usage.total_tokens,
        details: None,
    }
}

/// Typed view over one entry of a Responses `output` array.
///
/// Use [`output_views`] to adapt the raw items a response carried (exposed
/// through `ChatResponse::provider_outputs` plus the parsed tool calls).
#[derive(Debug, Clone)]
pub enum OutputItemView {
    FunctionCall(FunctionCallView),
    WebSearchCall(WebSearchCallView),
    FileSearchCall(FileSearchCallView),
    CodeInterpreterCall(CodeInterpreterCallView),
    ImageGenerationCall(ImageGenerationCallView),
    /// Message and any future item kinds, raw.
    Other(Value),
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionCallView {
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arguments: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSearchCallView {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub action: Option<WebSearchAction>,
}

/// The action behind a web-search call: `search`, `open_page` or `find`.
#[derive(Debug, Clone, Deserialize)]
pub struct WebSearchAction {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub sources: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileSearchCallView {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub queries: Vec<String>,
    #[serde(default)]
    pub results: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CodeInterpreterCallView {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub outputs: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageGenerationCallView {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    /// Base64 image payload, when the call finished.
    #[serde(default)]
    pub result: Option<String>,
}

/// Adapts raw output items into typed views, filtering by `type`.
pub fn output_views(items: &[Value]) -> Vec<OutputItemView> {
    items
        .iter()
        .map(|item| {
            let kind = item.get("type").and_then(|t| t.as_str()).unwrap_or("");
            match kind {
                "function_call" => serde_json::from_value(item.clone())
                    .map(OutputItemView::FunctionCall)
                    .unwrap_or_else(|_| OutputItemView::Other(item.clone())),
                "web_search_call" => serde_json::from_value(item.clone())
                    .map(OutputItemView::WebSearchCall)
                    .unwrap_or_else(|_| OutputItemView::Other(item.clone())),
                "file_search_call" => serde_json::from_value(item.clone())
                    .map(OutputItemView::FileSearchCall)
                    .unwrap_or_else(|_| OutputItemView::Other(item.clone())),
                "code_interpreter_call" => serde_json::from_value(item.clone())
                    .map(OutputItemView::CodeInterpreterCall)
                    .unwrap_or_else(|_| OutputItemView::Other(item.clone())),
                "image_generation_call" => serde_json::from_value(item.clone())
                    .map(OutputItemView::ImageGenerationCall)
                    .unwrap_or_else(|_| OutputItemView::Other(item.clone())),
                _ => OutputItemView::Other(item.clone()),
            }
        })
        .collect()
}
