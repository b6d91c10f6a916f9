use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value, json};

use crate::error::LLMError;
use crate::prompt::{ChatMessage, ChatRole, MessagePart, Prompt};
use crate::types::{CallOptions, ResponseFormat, ToolChoice, ToolSpec};

/// 构建 GenerateContent 请求体。
pub(crate) fn build_gemini_body(
    prompt: &Prompt,
    options: &CallOptions,
) -> Result<(Value, Vec<String>), LLMError> {
    let mut warnings = Vec::new();
    let mut body = Map::new();

    let mut system_texts = Vec::new();
    let mut contents = Vec::new();
    for message in &prompt.messages {
        match message.role {
            ChatRole::System => {
                let text = message.joined_text();
                if !text.is_empty() {
                    system_texts.push(text);
                }
            }
            _ => contents.push(convert_content(message, &mut warnings)?),
        }
    }
    if contents.is_empty() {
        return Err(LLMError::invalid_request(
            "Gemini requires at least one user/model message",
        ));
    }
    body.insert("contents".to_string(), Value::Array(contents));
    if !system_texts.is_empty() {
        body.insert(
            "systemInstruction".to_string(),
            json!({"parts": [{"text": system_texts.join("\n\n")}]}),
        );
    }

    let mut generation = Map::new();
    if let Some(temperature) = options.temperature {
        generation.insert("temperature".to_string(), Value::from(temperature));
    }
    if let Some(top_p) = options.top_p {
        generation.insert("topP".to_string(), Value::from(top_p));
    }
    if let Some(top_k) = options.top_k {
        generation.insert("topK".to_string(), Value::from(top_k));
    }
    if let Some(max_tokens) = options.max_tokens {
        generation.insert("maxOutputTokens".to_string(), Value::from(max_tokens));
    }
    if let Some(stop) = &options.stop_sequences {
        generation.insert("stopSequences".to_string(), json!(stop));
    }
    if let Some(format) = &options.response_format {
        match format {
            ResponseFormat::Text => {}
            ResponseFormat::JsonObject => {
                generation.insert(
                    "responseMimeType".to_string(),
                    Value::String("application/json".to_string()),
                );
            }
            ResponseFormat::JsonSchema { schema, .. } => {
                generation.insert(
                    "responseMimeType".to_string(),
                    Value::String("application/json".to_string()),
                );
                generation.insert("responseSchema".to_string(), strip_schema(schema));
            }
        }
    }
    if !generation.is_empty() {
        body.insert("generationConfig".to_string(), Value::Object(generation));
    }

    if let Some(tools) = &options.tools {
        if !tools.is_empty() {
            body.insert(
                "tools".to_string(),
                json!([{"function_declarations": tools
                    .iter()
                    .map(convert_tool)
                    .collect::<Vec<_>>()}]),
            );
        }
    }
    if let Some(choice) = &options.tool_choice {
        body.insert("toolConfig".to_string(), convert_tool_choice(choice));
    }

    // Provider delta passthrough (safetySettings, cachedContent, ...).
    if let Some(Value::Object(delta)) = options.provider_delta("google", None) {
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

    Ok((Value::Object(body), warnings))
}

fn convert_content(
    message: &ChatMessage,
    warnings: &mut Vec<String>,
) -> Result<Value, LLMError> {
    let role = match message.role {
        ChatRole::Assistant => "model",
        _ => "user",
    };
    let mut parts = Vec::new();
    for part in &message.parts {
        match part {
            MessagePart::Text { text, .. } => parts.push(json!({"text": text})),
            MessagePart::Reasoning { .. } => {
                warnings.push("reasoning parts are not replayed to Gemini".to_string());
            }
            MessagePart::InlineFile { data, mime } => parts.push(json!({
                "inline_data": {"mime_type": mime.as_str(), "data": BASE64.encode(data)}
            })),
            MessagePart::UrlFile { url, mime } => parts.push(json!({
                "file_data": {"mime_type": mime.as_str(), "file_uri": url}
            })),
            MessagePart::ToolCall(call) => {
                let args = call.arguments_value().map_err(|err| {
                    LLMError::invalid_request(format!("functionCall args not valid JSON: {err}"))
                })?;
                parts.push(json!({"functionCall": {"name": call.name, "args": args}}));
            }
            MessagePart::ToolResult { call_id, payload } => {
                // Gemini correlates function responses by name, not id; the
                // call_id carries the function name for this protocol.
                parts.push(json!({
                    "functionResponse": {
                        "name": call_id,
                        "response": {"result": payload.to_content_string()},
                    }
                }));
            }
        }
    }
    if parts.is_empty() {
        return Err(LLMError::invalid_request(
            "message serializes to empty content",
        ));
    }
    Ok(json!({"role": role, "parts": parts}))
}

fn convert_tool(tool: &ToolSpec) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "parameters": strip_schema(&tool.parameters),
    })
}

/// Gemini rejects JSON-schema keywords it does not know; strip the usual
/// offenders recursively.
fn strip_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                if matches!(key.as_str(), "additionalProperties" | "$schema" | "default") {
                    continue;
                }
                out.insert(key.clone(), strip_schema(value));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(strip_schema).collect()),
        other => other.clone(),
    }
}

fn convert_tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!({"function_calling_config": {"mode": "AUTO"}}),
        ToolChoice::Any => json!({"function_calling_config": {"mode": "ANY"}}),
        ToolChoice::None => json!({"function_calling_config": {"mode": "NONE"}}),
        ToolChoice::Tool { name } => json!({
            "function_calling_config": {"mode": "ANY", "allowed_function_names": [name]}
        }),
    }
}
