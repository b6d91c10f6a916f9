use crate::error::LLMError;
use crate::types::{
    ChatResponse, FinishReason, ResponseMetadata, TokenUsage, ToolCallRequest,
};

use super::stream::split_think_spans;
use super::types::{ChatCompletionResponse, MessageContent, WireToolCall, WireUsage};

pub(crate) fn map_response(
    resp: ChatCompletionResponse,
    provider: &str,
    endpoint: String,
    warnings: Vec<String>,
) -> Result<ChatResponse, LLMError> {
    let raw = serde_json::to_value(&resp).ok();
    let choice = resp
        .choices
        .first()
        .ok_or_else(|| LLMError::other("chat completion carried no choices"))?;

    let mut text = None;
    let mut thinking = None;
    let mut tool_calls = Vec::new();

    if let Some(message) = &choice.message {
        let content = match &message.content {
            Some(MessageContent::Text(value)) => value.clone(),
            Some(MessageContent::Parts(parts)) => parts
                .iter()
                .filter_map(|p| p.text.clone())
                .collect::<Vec<_>>()
                .join(""),
            None => String::new(),
        };
        // Dedicated reasoning fields win; otherwise inline <think> spans are
        // extracted from the content.
        let explicit_reasoning = message
            .reasoning_content
            .clone()
            .or_else(|| message.reasoning.clone())
            .filter(|r| !r.is_empty());
        let (visible, inline_thinking) = split_think_spans(&content);
        if !visible.is_empty() {
            text = Some(visible);
        }
        thinking = explicit_reasoning.or_else(|| {
            (!inline_thinking.is_empty()).then_some(inline_thinking)
        });

        for call in message.tool_calls.clone().unwrap_or_default() {
            tool_calls.push(convert_tool_call(call)?);
        }
    }

    Ok(ChatResponse {
        text,
        thinking,
        tool_calls,
        provider_outputs: Vec::new(),
        usage: resp.usage.as_ref().map(convert_usage),
        finish_reason: choice
            .finish_reason
            .as_deref()
            .map(convert_finish_reason),
        warnings,
        model: resp.model.clone(),
        metadata: ResponseMetadata {
            provider: provider.to_string(),
            request_id: resp.id.clone(),
            response_id: None,
            endpoint: Some(endpoint),
            raw,
        },
    })
}

pub(crate) fn convert_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "content_filter" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

pub(crate) fn convert_usage(usage: &WireUsage) -> TokenUsage {
    TokenUsage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        reasoning_tokens: usage
            .completion_tokens_details
            .as_ref()
            .and_then(|d| d.reasoning_tokens),
        total_tokens: usage.total_tokens,
        details: None,
    }
}

fn convert_tool_call(call: WireToolCall) -> Result<ToolCallRequest, LLMError> {
    if let Some(kind) = &call.kind {
        if kind != "function" {
            return Err(LLMError::other(format!(
                "unsupported tool call type {kind}"
            )));
        }
    }
    let function = call.function.unwrap_or(super::types::WireToolFunction {
        name: None,
        arguments: None,
    });
    Ok(ToolCallRequest {
        id: call.id,
        name: function.name.unwrap_or_default(),
        arguments: function.arguments.unwrap_or_default(),
    })
}
