use crate::error::LLMError;
use crate::types::{
    ChatResponse, FinishReason, ResponseMetadata, TokenUsage, ToolCallRequest,
};

use super::types::{GenerateContentResponse, UsageMetadata};

pub(crate) fn map_response(
    resp: GenerateContentResponse,
    endpoint: String,
    warnings: Vec<String>,
) -> Result<ChatResponse, LLMError> {
    let raw = serde_json::to_value(&resp).ok();
    let mut text = String::new();
    let mut thinking = String::new();
    let mut tool_calls = Vec::new();

    if let Some(candidate) = resp.candidates.first() {
        if let Some(content) = &candidate.content {
            for (idx, part) in content.parts.iter().enumerate() {
                if let Some(t) = &part.text {
                    if part.thought.unwrap_or(false) {
                        thinking.push_str(t);
                    } else {
                        text.push_str(t);
                    }
                }
                if let Some(call) = &part.function_call {
                    let arguments = call
                        .args
                        .as_ref()
                        .map(|a| a.to_string())
                        .unwrap_or_else(|| "{}".to_string());
                    tool_calls.push(ToolCallRequest {
                        // Gemini does not emit call ids; synthesize stable
                        // ones from the part index.
                        id: Some(crate::stream_parts::synthesized_call_id(idx)),
                        name: call.name.clone(),
                        arguments,
                    });
                }
            }
        }
    }

    let finish_reason = resp
        .candidates
        .first()
        .and_then(|c| c.finish_reason.as_deref())
        .map(convert_finish_reason);

    Ok(ChatResponse {
        text: (!text.is_empty()).then_some(text),
        thinking: (!thinking.is_empty()).then_some(thinking),
        tool_calls,
        provider_outputs: Vec::new(),
        usage: resp.usage_metadata.as_ref().map(convert_usage),
        finish_reason,
        warnings,
        model: resp.model_version.clone(),
        metadata: ResponseMetadata {
            provider: "google".to_string(),
            request_id: None,
            response_id: None,
            endpoint: Some(endpoint),
            raw,
        },
    })
}

pub(crate) fn convert_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" => FinishReason::ContentFilter,
        "MALFORMED_FUNCTION_CALL" => FinishReason::Error,
        other => FinishReason::Other(other.to_string()),
    }
}

pub(crate) fn convert_usage(usage: &UsageMetadata) -> TokenUsage {
    TokenUsage {
        prompt_tokens: usage.prompt_token_count,
        completion_tokens: usage.candidates_token_count,
        reasoning_tokens: usage.thoughts_token_count,
        total_tokens: usage.total_token_count,
        details: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_text_thought_and_function_call_parts() {
        let resp: GenerateContentResponse = serde_json::from_str(
            r#"{
                "candidates": [{
                    "content": {"role": "model", "parts": [
                        {"text": "internal", "thought": true},
                        {"text": "The answer."},
                        {"functionCall": {"name": "calc", "args": {"a": 1}}}
                    ]},
                    "finishReason": "STOP"
                }],
                "usageMetadata": {"promptTokenCount": 6, "candidatesTokenCount": 3,
                                   "totalTokenCount": 9, "thoughtsTokenCount": 2}
            }"#,
        )
        .unwrap();

        let mapped = map_response(resp, "e".to_string(), Vec::new()).unwrap();
        assert_eq!(mapped.text.as_deref(), Some("The answer."));
        assert_eq!(mapped.thinking.as_deref(), Some("internal"));
        assert_eq!(mapped.tool_calls[0].name, "calc");
        assert_eq!(mapped.tool_calls[0].arguments, r#"{"a":1}"#);
        assert_eq!(mapped.tool_calls[0].id.as_deref(), Some("call_2"));
        assert_eq!(mapped.usage.unwrap().reasoning_tokens, Some(2));
    }

    #[test]
    fn finish_reasons_cover_safety_blocks() {
        assert_eq!(convert_finish_reason("SAFETY"), FinishReason::ContentFilter);
        assert_eq!(convert_finish_reason("MAX_TOKENS"), FinishReason::Length);
    }
}
