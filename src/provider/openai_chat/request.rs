use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value, json};

use crate::error::LLMError;
use crate::prompt::{ChatMessage, ChatRole, MessagePart, Prompt};
use crate::types::{CallOptions, ResponseFormat, ToolChoice, ToolSpec};

/// 构建 Chat Completions 请求体。
///
/// Returns the JSON body plus the non-fatal warnings collected while
/// compiling (dropped parts, unsupported provider tools).
pub(crate) fn build_chat_body(
    prompt: &Prompt,
    options: &CallOptions,
    model: &str,
    stream: bool,
    provider_id: &str,
    alias: Option<&str>,
) -> Result<(Value, Vec<String>), LLMError> {
    let mut warnings = Vec::new();
    let mut body = Map::new();
    body.insert("model".to_string(), Value::String(model.to_string()));
    body.insert(
        "messages".to_string(),
        Value::Array(convert_messages(&prompt.messages, &mut warnings)?),
    );

    if let Some(max_tokens) = options.max_tokens {
        // Chat Completions historically uses `max_tokens`; many compatible
        // gateways still have not adopted `max_completion_tokens`.
        body.insert("max_tokens".to_string(), Value::from(max_tokens));
    }
    if let Some(temperature) = options.temperature {
        body.insert("temperature".to_string(), Value::from(temperature));
    }
    if let Some(top_p) = options.top_p {
        body.insert("top_p".to_string(), Value::from(top_p));
    }
    if let Some(top_k) = options.top_k {
        body.insert("top_k".to_string(), Value::from(top_k));
    }
    if let Some(stop) = &options.stop_sequences {
        body.insert("stop".to_string(), json!(stop));
    }
    if let Some(user) = &options.user {
        body.insert("user".to_string(), Value::String(user.clone()));
    }
    if let Some(tier) = &options.service_tier {
        body.insert("service_tier".to_string(), Value::String(tier.clone()));
    }
    if let Some(effort) = &options.reasoning_effort {
        body.insert(
            "reasoning_effort".to_string(),
            Value::String(effort.as_str().to_string()),
        );
    }
    if let Some(parallel) = options.disable_parallel_tool_use {
        body.insert("parallel_tool_calls".to_string(), Value::from(!parallel));
    }

    // Call-level tools supersede anything injected upstream; an explicitly
    // empty list disables tools for this call.
    if let Some(tools) = &options.tools {
        if !tools.is_empty() {
            body.insert("tools".to_string(), Value::Array(convert_tools(tools)));
        }
    }
    if !options.provider_tools.is_empty() {
        warnings.push(
            "provider-executed tools are not available on Chat Completions; use the Responses API"
                .to_string(),
        );
    }
    if let Some(choice) = &options.tool_choice {
        body.insert("tool_choice".to_string(), convert_tool_choice(choice));
    }
    if let Some(format) = &options.response_format {
        body.insert("response_format".to_string(), convert_response_format(format));
    }
    if !options.metadata.is_empty() {
        let meta: Map<String, Value> = options
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        body.insert("metadata".to_string(), Value::Object(meta));
    }

    apply_provider_delta(&mut body, options, provider_id, alias);

    body.insert("stream".to_string(), Value::Bool(stream));
    if stream {
        // Ask for the trailing usage chunk most gateways support.
        body.insert("stream_options".to_string(), json!({"include_usage": true}));
    }

    Ok((Value::Object(body), warnings))
}

/// Merges the provider-specific delta into the body.
///
/// Every key of the delta object is forwarded verbatim except the two escape
/// hatches: `extra_body` is shallow-merged last (later keys win) and
/// `extra_headers` is handled at the transport layer.
fn apply_provider_delta(
    body: &mut Map<String, Value>,
    options: &CallOptions,
    provider_id: &str,
    alias: Option<&str>,
) {
    let Some(Value::Object(delta)) = options.provider_delta(provider_id, alias) else {
        return;
    };
    for (key, value) in delta {
        if key == "extra_body" || key == "extra_headers" {
            continue;
        }
        body.insert(key.clone(), value.clone());
    }
    if let Some(Value::Object(extra)) = delta.get("extra_body") {
        for (key, value) in extra {
            body.insert(key.clone(), value.clone());
        }
    }
}

fn convert_messages(
    messages: &[ChatMessage],
    warnings: &mut Vec<String>,
) -> Result<Vec<Value>, LLMError> {
    let mut converted = Vec::new();
    for message in messages {
        convert_message(message, &mut converted, warnings)?;
    }
    Ok(converted)
}

/// Converts one prompt message, appending the wire messages it expands to.
///
/// Tool-result parts are promoted to dedicated `role: "tool"` messages that
/// follow the containing message, preserving part order.
fn convert_message(
    message: &ChatMessage,
    out: &mut Vec<Value>,
    warnings: &mut Vec<String>,
) -> Result<(), LLMError> {
    let mut content_parts = Vec::new();
    let mut tool_calls = Vec::new();
    let mut tool_messages = Vec::new();

    for part in &message.parts {
        match part {
            MessagePart::Text { text, .. } => {
                content_parts.push(json!({"type": "text", "text": text}));
            }
            MessagePart::Reasoning { .. } => {
                warnings.push("reasoning parts are not replayed to Chat Completions".to_string());
            }
            MessagePart::InlineFile { data, mime } => {
                content_parts.push(convert_inline_file(data, mime.as_str()));
            }
            MessagePart::UrlFile { url, mime } => {
                if mime.is_image() {
                    content_parts.push(json!({
                        "type": "image_url",
                        "image_url": {"url": url}
                    }));
                } else {
                    content_parts.push(json!({
                        "type": "file",
                        "file": {"file_url": url}
                    }));
                }
            }
            MessagePart::ToolCall(call) => {
                let mut obj = Map::new();
                if let Some(id) = &call.id {
                    obj.insert("id".to_string(), Value::String(id.clone()));
                }
                obj.insert("type".to_string(), Value::String("function".to_string()));
                obj.insert(
                    "function".to_string(),
                    json!({"name": call.name, "arguments": call.arguments}),
                );
                tool_calls.push(Value::Object(obj));
            }
            MessagePart::ToolResult { call_id, payload } => {
                tool_messages.push(json!({
                    "role": "tool",
                    "tool_call_id": call_id,
                    "content": payload.to_content_string(),
                }));
            }
        }
    }

    let has_main = !content_parts.is_empty() || !tool_calls.is_empty();
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
        obj.insert("content".to_string(), collapse_content(content_parts));
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

/// Pure text collapses to a plain string for interop with minimalist
/// OpenAI-compatible servers.
fn collapse_content(parts: Vec<Value>) -> Value {
    if parts.is_empty() {
        return Value::Null;
    }
    let all_text = parts.iter().all(|p| p["type"] == "text");
    if all_text {
        let joined = parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n");
        Value::String(joined)
    } else {
        Value::Array(parts)
    }
}

fn convert_inline_file(data: &[u8], mime: &str) -> Value {
    let encoded = BASE64.encode(data);
    if mime.starts_with("image/") {
        json!({
            "type": "image_url",
            "image_url": {"url": format!("data:{mime};base64,{encoded}")}
        })
    } else {
        json!({
            "type": "file",
            "file": {"file_data": format!("data:{mime};base64,{encoded}")}
        })
    }
}

fn convert_tools(tools: &[ToolSpec]) -> Vec<Value> {
    tools
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
        .collect()
}

fn convert_tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => Value::String("auto".to_string()),
        ToolChoice::Any => Value::String("required".to_string()),
        ToolChoice::None => Value::String("none".to_string()),
        ToolChoice::Tool { name } => json!({
            "type": "function",
            "function": {"name": name}
        }),
    }
}

fn convert_response_format(format: &ResponseFormat) -> Value {
    match format {
        ResponseFormat::Text => json!({"type": "text"}),
        ResponseFormat::JsonObject => json!({"type": "json_object"}),
        ResponseFormat::JsonSchema {
            name,
            schema,
            strict,
        } => {
            let mut schema = schema.clone();
            // Structured output endpoints reject open schemas unless
            // additionalProperties is pinned.
            if let Value::Object(obj) = &mut schema {
                obj.entry("additionalProperties".to_string())
                    .or_insert(Value::Bool(false));
            }
            json!({
                "type": "json_schema",
                "json_schema": {
                    "name": name.clone().unwrap_or_else(|| "response".to_string()),
                    "schema": schema,
                    "strict": strict.unwrap_or(true),
                }
            })
        }
    }
}
