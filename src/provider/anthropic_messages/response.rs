use std::collections::HashMap;

use serde_json::Value;

use crate::error::LLMError;
use crate::types::{
    ChatResponse, FinishReason, ResponseMetadata, TokenUsage, ToolCallRequest,
};

use super::types::{ContentBlock, MessagesResponse, WireUsage};

pub(crate) fn map_response(
    resp: MessagesResponse,
    endpoint: String,
    warnings: Vec<String>,
) -> Result<ChatResponse, LLMError> {
    let raw = serde_json::to_value(&resp).ok();
    let mut text = String::new();
    let mut thinking = String::new();
    let mut tool_calls = Vec::new();
    let mut provider_outputs = Vec::new();

    for block in &resp.content {
        match block.kind.as_str() {
            "text" => {
                if let Some(t) = &block.text {
                    text.push_str(t);
                }
            }
            "thinking" => {
                if let Some(t) = &block.thinking {
                    thinking.push_str(t);
                }
            }
            "tool_use" => tool_calls.push(convert_tool_use(block)?),
            // Server-executed blocks pass through unchanged; MCP tool uses
            // are not surfaced as local tool calls.
            _ => {
                if let Ok(value) = serde_json::to_value(block) {
                    provider_outputs.push(value);
                }
            }
        }
    }

    Ok(ChatResponse {
        text: (!text.is_empty()).then_some(text),
        thinking: (!thinking.is_empty()).then_some(thinking),
        tool_calls,
        provider_outputs,
        usage: resp.usage.as_ref().map(convert_usage),
        finish_reason: resp.stop_reason.as_deref().map(convert_finish_reason),
        warnings,
        model: resp.model.clone(),
        metadata: ResponseMetadata {
            provider: "anthropic".to_string(),
            request_id: resp.id.clone(),
            response_id: None,
            endpoint: Some(endpoint),
            raw,
        },
    })
}

fn convert_tool_use(block: &ContentBlock) -> Result<ToolCallRequest, LLMError> {
    let arguments = match &block.input {
        Some(input) => serde_json::to_string(input)
            .map_err(|err| LLMError::other(format!("tool_use input not serializable: {err}")))?,
        None => "{}".to_string(),
    };
    Ok(ToolCallRequest {
        id: block.id.clone(),
        name: block.name.clone().unwrap_or_default(),
        arguments,
    })
}

pub(crate) fn convert_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "end_turn" | "stop_sequence" => FinishReason::Stop,
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        "refusal" => FinishReason::ContentFilter,
        "pause_turn" => FinishReason::PauseTurn,
        other => FinishReason::Other(other.to_string()),
    }
}

pub(crate) fn convert_usage(usage: &WireUsage) -> TokenUsage {
    let mut details: HashMap<String, Value> = HashMap::new();
    if let Some(created) = usage.cache_creation_input_tokens {
        details.insert("cache_creation_input_tokens".to_string(), created.into());
    }
    if let Some(read) = usage.cache_read_input_tokens {
        details.insert("cache_read_input_tokens".to_string(), read.into());
    }
    TokenUsage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        reasoning_tokens: None,
        total_tokens: match (usage.input_tokens, usage.output_tokens) {
            (Some(i), Some(o)) => Some(i + o),
            _ => None,
        },
        details: (!details.is_empty()).then_some(details),
    }
}
