use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value, json};

use crate::error::LLMError;
use crate::prompt::{ChatMessage, ChatRole, MessagePart, Prompt};
use crate::types::{CallOptions, ResponseFormat, ToolChoice, ToolSpec};

/// Builds the request body expected by the Responses API.
pub(crate) fn build_responses_body(
    prompt: &Prompt,
    options: &CallOptions,
    model: &str,
    stream: bool,
) -> Result<(Value, Vec<String>), LLMError> {
    let mut warnings = Vec::new();
    let mut body = Map::new();
    body.insert("model".to_string(), Value::String(model.to_string()));

    // System/developer text folds into `instructions`; the rest becomes the
    // list-form `input`.
    let mut instructions = Vec::new();
    let mut input_items = Vec::new();
    for message in &prompt.messages {
        match message.role {
            ChatRole::System => {
                let text = message.joined_text();
                if !text.is_empty() {
                    instructions.push(text);
                }
            }
            _ => convert_input_message(message, &mut input_items, &mut warnings)?,
        }
    }
    if !instructions.is_empty() {
        body.insert(
            "instructions".to_string(),
            Value::String(instructions.join("\n\n")),
        );
    }
    if !input_items.is_empty() {
        body.insert("input".to_string(), Value::Array(input_items));
    }

    // `max_output_tokens` replaces `max_tokens` for all models here.
    if let Some(max_tokens) = options.max_tokens {
        body.insert("max_output_tokens".to_string(), Value::from(max_tokens));
    }
    if let Some(temperature) = options.temperature {
        body.insert("temperature".to_string(), Value::from(temperature));
    }
    if let Some(top_p) = options.top_p {
        body.insert("top_p".to_string(), Value::from(top_p));
    }
    if let Some(user) = &options.user {
        body.insert("user".to_string(), Value::String(user.clone()));
    }
    if let Some(tier) = &options.service_tier {
        body.insert("service_tier".to_string(), Value::String(tier.clone()));
    }
    if let Some(parallel) = options.disable_parallel_tool_use {
        body.insert("parallel_tool_calls".to_string(), Value::from(!parallel));
    }
    // `reasoning.effort` only applies to reasoning-capable models; sending
    // it elsewhere is a hard 400.
    if let Some(effort) = &options.reasoning_effort {
        if is_reasoning_model(model) {
            body.insert(
                "reasoning".to_string(),
                json!({"effort": effort.as_str()}),
            );
        } else {
            warnings.push(format!("model {model} does not accept reasoning.effort"));
        }
    }

    let mut tools = Vec::new();
    if let Some(call_tools) = &options.tools {
        for tool in call_tools {
            tools.push(convert_function_tool(tool));
        }
    }
    for spec in &options.provider_tools {
        let (provider, name) = spec.split_id();
        if provider != "openai" {
            continue;
        }
        match builtin_tool(name, &spec.args) {
            Some(tool) => tools.push(tool),
            None => warnings.push(format!("unknown openai provider tool `{name}`")),
        }
    }
    if !tools.is_empty() {
        body.insert("tools".to_string(), Value::Array(tools));
    }
    if let Some(choice) = &options.tool_choice {
        body.insert("tool_choice".to_string(), convert_tool_choice(choice));
    }

    if let Some(format) = &options.response_format {
        body.insert("text".to_string(), convert_text_config(format));
    }
    if !options.metadata.is_empty() {
        let meta: Map<String, Value> = options
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        body.insert("metadata".to_string(), Value::Object(meta));
    }

    // Provider delta passthrough (previous_response_id, background, include,
    // store, ...) plus the extra_body escape hatch.
    if let Some(Value::Object(delta)) = options.provider_delta("openai", None) {
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

    body.insert("stream".to_string(), Value::Bool(stream));
    Ok((Value::Object(body), warnings))
}

/// Reasoning-capable model families accepted by `reasoning.effort`.
pub(crate) fn is_reasoning_model(model: &str) -> bool {
    model.starts_with("o1")
        || model.starts_with("o3")
        || model.starts_with("o4")
        || model.starts_with("gpt-5")
        || model.contains("codex")
}

fn convert_input_message(
    message: &ChatMessage,
    out: &mut Vec<Value>,
    warnings: &mut Vec<String>,
) -> Result<(), LLMError> {
    let role = message.role.as_str();
    let mut content = Vec::new();
    for part in &message.parts {
        match part {
            MessagePart::Text { text, .. } => {
                let kind = if message.role == ChatRole::Assistant {
                    "output_text"
                } else {
                    "input_text"
                };
                content.push(json!({"type": kind, "text": text}));
            }
            MessagePart::Reasoning { .. } => {
                warnings.push("reasoning parts are not replayed to the Responses API".to_string());
            }
            MessagePart::InlineFile { data, mime } => {
                let encoded = BASE64.encode(data);
                if mime.is_image() {
                    content.push(json!({
                        "type": "input_image",
                        "image_url": format!("data:{};base64,{encoded}", mime.as_str()),
                    }));
                } else {
                    content.push(json!({
                        "type": "input_file",
                        "file_data": format!("data:{};base64,{encoded}", mime.as_str()),
                    }));
                }
            }
            MessagePart::UrlFile { url, mime } => {
                if mime.is_image() {
                    content.push(json!({"type": "input_image", "image_url": url}));
                } else {
                    content.push(json!({"type": "input_file", "file_url": url}));
                }
            }
            // Function calls and their outputs are standalone input items in
            // this protocol, not message content.
            MessagePart::ToolCall(call) => {
                out.push(json!({
                    "type": "function_call",
                    "call_id": call.id.clone().unwrap_or_default(),
                    "name": call.name,
                    "arguments": call.arguments,
                }));
            }
            MessagePart::ToolResult { call_id, payload } => {
                out.push(json!({
                    "type": "function_call_output",
                    "call_id": call_id,
                    "output": payload.to_content_string(),
                }));
            }
        }
    }
    if !content.is_empty() {
        out.push(json!({
            "type": "message",
            "role": role,
            "content": content,
        }));
    }
    Ok(())
}

fn convert_function_tool(tool: &ToolSpec) -> Value {
    json!({
        "type": "function",
        "name": tool.name,
        "description": tool.description,
        "parameters": tool.parameters,
    })
}

/// Maps `openai.<name>` provider tool ids to Responses tool entries.
fn builtin_tool(name: &str, args: &std::collections::HashMap<String, Value>) -> Option<Value> {
    let mut tool = Map::new();
    match name {
        "web_search" => {
            tool.insert("type".to_string(), Value::String("web_search".to_string()));
        }
        "file_search" => {
            tool.insert("type".to_string(), Value::String("file_search".to_string()));
        }
        "code_interpreter" => {
            tool.insert(
                "type".to_string(),
                Value::String("code_interpreter".to_string()),
            );
            tool.entry("container".to_string())
                .or_insert_with(|| json!({"type": "auto"}));
        }
        "image_generation" => {
            tool.insert(
                "type".to_string(),
                Value::String("image_generation".to_string()),
            );
        }
        _ => return None,
    }
    for (key, value) in args {
        tool.insert(key.clone(), value.clone());
    }
    Some(Value::Object(tool))
}

fn convert_tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => Value::String("auto".to_string()),
        ToolChoice::Any => Value::String("required".to_string()),
        ToolChoice::None => Value::String("none".to_string()),
        ToolChoice::Tool { name } => json!({"type": "function", "name": name}),
    }
}

fn convert_text_config(format: &ResponseFormat) -> Value {
    match format {
        ResponseFormat::Text => json!({"format": {"type": "text"}}),
        ResponseFormat::JsonObject => json!({"format": {"type": "json_object"}}),
        ResponseFormat::JsonSchema {
            name,
            schema,
            strict,
        } => {
            let mut schema = schema.clone();
            if let Value::Object(obj) = &mut schema {
                obj.entry("additionalProperties".to_string())
                    .or_insert(Value::Bool(false));
            }
            json!({
                "format": {
                    "type": "json_schema",
                    "name": name.clone().unwrap_or_else(|| "response".to_string()),
                    "schema": schema,
                    "strict": strict.unwrap_or(true),
                }
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::{MessageBuilder, ToolResultPayload};
    use crate::types::{ProviderToolSpec, ReasoningEffort, ToolCallRequest};

    #[test]
    fn input_items_use_responses_shapes() {
        let prompt = Prompt::with_system("guide", "question");
        let (body, _) = build_responses_body(
            &prompt,
            &CallOptions::default().with_max_tokens(128),
            "gpt-4o",
            false,
        )
        .expect("body");

        assert_eq!(body["instructions"], json!("guide"));
        assert_eq!(body["max_output_tokens"], json!(128));
        let input = body["input"].as_array().expect("input items");
        assert_eq!(input[0]["type"], json!("message"));
        assert_eq!(input[0]["content"][0]["type"], json!("input_text"));
    }

    #[test]
    fn tool_calls_and_outputs_become_standalone_items() {
        let assistant = MessageBuilder::new(ChatRole::Assistant)
            .tool_call(ToolCallRequest::new(
                Some("call_1".to_string()),
                "lookup",
                "{}",
            ))
            .build();
        let result = MessageBuilder::new(ChatRole::User)
            .tool_result("call_1", ToolResultPayload::Text { text: "found".to_string() })
            .build();
        let prompt = Prompt::new(vec![
            ChatMessage::text(ChatRole::User, "find it"),
            assistant,
            result,
        ]);
        let (body, _) =
            build_responses_body(&prompt, &CallOptions::default(), "gpt-4o", false).expect("body");

        let input = body["input"].as_array().expect("items");
        assert_eq!(input.len(), 3);
        assert_eq!(input[1]["type"], json!("function_call"));
        assert_eq!(input[1]["call_id"], json!("call_1"));
        assert_eq!(input[2]["type"], json!("function_call_output"));
        assert_eq!(input[2]["output"], json!("found"));
    }

    #[test]
    fn reasoning_effort_only_for_reasoning_models() {
        let options = CallOptions {
            reasoning_effort: Some(ReasoningEffort::High),
            ..Default::default()
        };
        let (body, warnings) =
            build_responses_body(&Prompt::user("hi"), &options, "o3-mini", false).expect("body");
        assert_eq!(body["reasoning"]["effort"], json!("high"));
        assert!(warnings.is_empty());

        let (body, warnings) =
            build_responses_body(&Prompt::user("hi"), &options, "gpt-4o", false).expect("body");
        assert!(body.get("reasoning").is_none());
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn builtin_tool_ids_translate_to_responses_tools() {
        let options = CallOptions {
            provider_tools: vec![
                ProviderToolSpec::new("openai.web_search"),
                ProviderToolSpec::new("openai.file_search")
                    .with_arg("vector_store_ids", json!(["vs_1"])),
                ProviderToolSpec::new("openai.code_interpreter"),
                ProviderToolSpec::new("openai.image_generation"),
            ],
            ..Default::default()
        };
        let (body, warnings) =
            build_responses_body(&Prompt::user("hi"), &options, "gpt-4o", false).expect("body");

        let tools = body["tools"].as_array().expect("tools");
        assert_eq!(tools.len(), 4);
        assert_eq!(tools[0]["type"], json!("web_search"));
        assert_eq!(tools[1]["type"], json!("file_search"));
        assert_eq!(tools[1]["vector_store_ids"], json!(["vs_1"]));
        assert_eq!(tools[2]["container"], json!({"type": "auto"}));
        assert_eq!(tools[3]["type"], json!("image_generation"));
        assert!(warnings.is_empty());
    }

    #[test]
    fn previous_response_id_and_background_flow_through_delta() {
        let options = CallOptions::default()
            .with_provider_option("openai", "previous_response_id", "resp_123")
            .with_provider_option("openai", "background", true);
        let (body, _) =
            build_responses_body(&Prompt::user("hi"), &options, "gpt-4o", false).expect("body");
        assert_eq!(body["previous_response_id"], json!("resp_123"));
        assert_eq!(body["background"], json!(true));
    }
}
