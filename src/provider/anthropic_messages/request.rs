use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value, json};

use crate::config::{ProviderConfig, WebSearchConfig, ext};
use crate::error::LLMError;
use crate::prompt::{ChatMessage, ChatRole, MessagePart, Prompt};
use crate::types::{CallOptions, ToolChoice, ToolSpec};

/// Default `max_tokens` when neither call nor config specify one; the field
/// is mandatory on this protocol.
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Largest number of `cache_control` breakpoints the API accepts.
const MAX_CACHE_BREAKPOINTS: usize = 4;

const WEB_SEARCH_TOOL_TYPE: &str = "web_search_20250305";

/// 构建 Anthropic Messages 请求体。
pub(crate) fn build_messages_body(
    prompt: &Prompt,
    options: &CallOptions,
    config: &ProviderConfig,
    model: &str,
    stream: bool,
) -> Result<(Value, Vec<String>), LLMError> {
    let mut warnings = Vec::new();
    let mut body = Map::new();
    body.insert("model".to_string(), Value::String(model.to_string()));

    // System messages fold into the top-level `system` array of text blocks;
    // every block keeps its cache_control.
    let mut system_blocks = Vec::new();
    let mut messages = Vec::new();
    for message in &prompt.messages {
        match message.role {
            ChatRole::System => {
                for part in &message.parts {
                    if let MessagePart::Text { text, .. } = part {
                        let mut block = Map::new();
                        block.insert("type".to_string(), Value::String("text".to_string()));
                        block.insert("text".to_string(), Value::String(text.clone()));
                        attach_cache_control(&mut block, part);
                        system_blocks.push(Value::Object(block));
                    }
                }
            }
            _ => messages.push(convert_message(message, &mut warnings)?),
        }
    }
    if messages.is_empty() {
        return Err(LLMError::invalid_request(
            "Anthropic Messages requires at least one user/assistant message",
        ));
    }
    body.insert("messages".to_string(), Value::Array(messages));
    if !system_blocks.is_empty() {
        body.insert("system".to_string(), Value::Array(system_blocks));
    }

    // Extended thinking reshapes the sampling parameters: temperature/top_p/
    // top_k must be absent and max_tokens grows by the thinking budget,
    // clamped to the model ceiling.
    let thinking_budget = thinking_budget(options, config);
    let base_max = options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
    if let Some(budget) = thinking_budget {
        body.insert(
            "thinking".to_string(),
            json!({"type": "enabled", "budget_tokens": budget}),
        );
        let ceiling = model_max_tokens(model);
        let total = base_max.saturating_add(budget).min(ceiling);
        body.insert("max_tokens".to_string(), Value::from(total));
    } else {
        body.insert("max_tokens".to_string(), Value::from(base_max));
        if let Some(temperature) = options.temperature {
            body.insert("temperature".to_string(), Value::from(temperature));
        }
        if let Some(top_p) = options.top_p {
            body.insert("top_p".to_string(), Value::from(top_p));
        }
        if let Some(top_k) = options.top_k {
            body.insert("top_k".to_string(), Value::from(top_k));
        }
    }

    if let Some(stop) = &options.stop_sequences {
        body.insert("stop_sequences".to_string(), json!(stop));
    }
    if let Some(tier) = &options.service_tier {
        body.insert("service_tier".to_string(), Value::String(tier.clone()));
    }

    let tools = convert_tools(options, config, &mut warnings);
    if !tools.is_empty() {
        body.insert("tools".to_string(), Value::Array(tools));
    }
    if let Some(choice) = &options.tool_choice {
        body.insert(
            "tool_choice".to_string(),
            convert_tool_choice(choice, options.disable_parallel_tool_use),
        );
    }

    if let Some(metadata) = build_metadata(options, config) {
        body.insert("metadata".to_string(), metadata);
    }
    if let Some(container) = config.extension::<Value>(ext::CONTAINER) {
        body.insert("container".to_string(), container);
    }
    if let Some(servers) = config.extension::<Value>(ext::MCP_SERVERS) {
        body.insert("mcp_servers".to_string(), servers);
    }

    // Provider delta passthrough plus the extra_body escape hatch.
    if let Some(Value::Object(delta)) = options.provider_delta("anthropic", None) {
        for (key, value) in delta {
            if key == "extra_body" || key == "extra_headers" || key == "thinking_budget" {
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

    let mut value = Value::Object(body);
    enforce_cache_breakpoints(&mut value);
    Ok((value, warnings))
}

fn thinking_budget(options: &CallOptions, config: &ProviderConfig) -> Option<u32> {
    if let Some(Value::Object(delta)) = options.provider_delta("anthropic", None) {
        if let Some(budget) = delta.get("thinking_budget").and_then(|v| v.as_u64()) {
            return Some(budget as u32);
        }
    }
    config.extension::<u32>(ext::THINKING_BUDGET)
}

/// Output ceilings per model family; unknown models use a conservative cap.
pub(crate) fn model_max_tokens(model: &str) -> u32 {
    if model.contains("claude-sonnet-4")
        || model.contains("claude-3-7")
        || model.contains("claude-haiku-4-5")
    {
        64000
    } else if model.contains("claude-opus-4") {
        32000
    } else if model.contains("claude-3-5-haiku") {
        8192
    } else if model.contains("claude-3-haiku") {
        4096
    } else {
        4096
    }
}

fn attach_cache_control(block: &mut Map<String, Value>, part: &MessagePart) {
    if let Some(control) = part.provider_option("anthropic", "cache_control") {
        block.insert("cache_control".to_string(), control.clone());
    }
}

fn convert_message(
    message: &ChatMessage,
    warnings: &mut Vec<String>,
) -> Result<Value, LLMError> {
    let role = match message.role {
        ChatRole::Assistant => "assistant",
        _ => "user",
    };
    let mut blocks = Vec::new();
    for part in &message.parts {
        match part {
            MessagePart::Text { text, .. } => {
                let mut block = Map::new();
                block.insert("type".to_string(), Value::String("text".to_string()));
                block.insert("text".to_string(), Value::String(text.clone()));
                attach_cache_control(&mut block, part);
                blocks.push(Value::Object(block));
            }
            MessagePart::Reasoning { .. } => {
                warnings.push("reasoning parts are not replayed to the Messages API".to_string());
            }
            MessagePart::InlineFile { data, mime } => {
                blocks.push(convert_inline_file(data, mime.as_str(), warnings));
            }
            MessagePart::UrlFile { url, mime } => {
                if mime.is_image() {
                    blocks.push(json!({
                        "type": "image",
                        "source": {"type": "url", "url": url}
                    }));
                } else {
                    blocks.push(json!({
                        "type": "document",
                        "source": {"type": "url", "url": url}
                    }));
                }
            }
            MessagePart::ToolCall(call) => {
                let input = call.arguments_value().map_err(|err| {
                    LLMError::invalid_request(format!("tool_use input is not valid JSON: {err}"))
                })?;
                blocks.push(json!({
                    "type": "tool_use",
                    "id": call.id.clone().unwrap_or_default(),
                    "name": call.name,
                    "input": input,
                }));
            }
            MessagePart::ToolResult { call_id, payload } => {
                blocks.push(json!({
                    "type": "tool_result",
                    "tool_use_id": call_id,
                    "content": payload.to_content_string(),
                    "is_error": payload.is_error(),
                }));
            }
        }
    }
    if blocks.is_empty() {
        return Err(LLMError::invalid_request(
            "message serializes to empty content",
        ));
    }
    Ok(json!({"role": role, "content": blocks}))
}

fn convert_inline_file(data: &[u8], mime: &str, warnings: &mut Vec<String>) -> Value {
    let encoded = BASE64.encode(data);
    if mime.starts_with("image/") {
        json!({
            "type": "image",
            "source": {"type": "base64", "media_type": mime, "data": encoded}
        })
    } else if mime == "application/pdf" {
        json!({
            "type": "document",
            "source": {"type": "base64", "media_type": mime, "data": encoded}
        })
    } else if mime.starts_with("text/") {
        json!({
            "type": "document",
            "source": {
                "type": "text",
                "media_type": "text/plain",
                "data": String::from_utf8_lossy(data),
            }
        })
    } else {
        warnings.push(format!("unsupported inline file type {mime}, sent as document"));
        json!({
            "type": "document",
            "source": {"type": "base64", "media_type": mime, "data": encoded}
        })
    }
}

/// Normalizes a tool schema: the API insists on `type: "object"` with a
/// `properties` object, defaulted to empty when missing.
fn normalize_schema(schema: &Value) -> Value {
    let mut obj = match schema {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    obj.insert("type".to_string(), Value::String("object".to_string()));
    obj.entry("properties".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    Value::Object(obj)
}

fn convert_tools(
    options: &CallOptions,
    config: &ProviderConfig,
    warnings: &mut Vec<String>,
) -> Vec<Value> {
    let mut result = Vec::new();
    if let Some(tools) = &options.tools {
        for tool in tools {
            result.push(convert_tool(tool, config));
        }
    }
    for spec in &options.provider_tools {
        let (provider, name) = spec.split_id();
        if provider != "anthropic" {
            continue;
        }
        match name {
            "web_search" => result.push(web_search_tool(config, Some(&spec.args))),
            other => {
                warnings.push(format!("unknown anthropic provider tool `{other}`"));
            }
        }
    }
    result
}

fn convert_tool(tool: &ToolSpec, config: &ProviderConfig) -> Value {
    // The reserved name `web_search` remaps to the server-side builtin.
    if tool.name == "web_search" {
        return web_search_tool(config, None);
    }
    let mut obj = Map::new();
    obj.insert("name".to_string(), Value::String(tool.name.clone()));
    obj.insert("description".to_string(), json!(tool.description));
    obj.insert(
        "input_schema".to_string(),
        normalize_schema(&tool.parameters),
    );
    if let Some(control) = &tool.cache_control {
        obj.insert("cache_control".to_string(), control.clone());
    }
    Value::Object(obj)
}

fn web_search_tool(
    config: &ProviderConfig,
    args: Option<&std::collections::HashMap<String, Value>>,
) -> Value {
    let ws: WebSearchConfig = config.extension(ext::WEB_SEARCH).unwrap_or_default();
    let mut tool = Map::new();
    tool.insert(
        "type".to_string(),
        Value::String(WEB_SEARCH_TOOL_TYPE.to_string()),
    );
    tool.insert("name".to_string(), Value::String("web_search".to_string()));
    if let Some(max_uses) = ws.max_uses {
        tool.insert("max_uses".to_string(), Value::from(max_uses));
    }
    if let Some(allowed) = &ws.allowed_domains {
        tool.insert("allowed_domains".to_string(), json!(allowed));
    }
    if let Some(blocked) = &ws.blocked_domains {
        tool.insert("blocked_domains".to_string(), json!(blocked));
    }
    if let Some(location) = &ws.user_location {
        tool.insert("user_location".to_string(), location.clone());
    }
    if let Some(args) = args {
        for (key, value) in args {
            tool.insert(key.clone(), value.clone());
        }
    }
    Value::Object(tool)
}

fn convert_tool_choice(choice: &ToolChoice, disable_parallel: Option<bool>) -> Value {
    let mut obj = match choice {
        ToolChoice::Auto => json!({"type": "auto"}),
        ToolChoice::Any => json!({"type": "any"}),
        ToolChoice::None => json!({"type": "none"}),
        ToolChoice::Tool { name } => json!({"type": "tool", "name": name}),
    };
    if let (Some(true), Value::Object(map)) = (disable_parallel, &mut obj) {
        map.insert("disable_parallel_tool_use".to_string(), Value::Bool(true));
    }
    obj
}

fn build_metadata(options: &CallOptions, config: &ProviderConfig) -> Option<Value> {
    let mut metadata = Map::new();
    if let Some(user_id) = config.extension::<String>(ext::USER_ID) {
        metadata.insert("user_id".to_string(), Value::String(user_id));
    }
    if let Some(Value::Object(static_meta)) = config.extensions.get(ext::METADATA) {
        for (key, value) in static_meta {
            metadata.insert(key.clone(), value.clone());
        }
    }
    for (key, value) in &options.metadata {
        metadata.insert(key.clone(), value.clone());
    }
    if let Some(user) = &options.user {
        metadata.insert("user_id".to_string(), Value::String(user.clone()));
    }
    if metadata.is_empty() {
        None
    } else {
        Some(Value::Object(metadata))
    }
}

/// Drops `cache_control` entries beyond the request budget, in input order,
/// and from contexts where the API rejects them (only system text blocks,
/// message parts and the last tool are allowed). Excess settings are
/// dropped silently for now.
fn enforce_cache_breakpoints(body: &mut Value) {
    let mut remaining = MAX_CACHE_BREAKPOINTS;

    if let Some(Value::Array(system)) = body.get_mut("system") {
        for block in system {
            take_breakpoint(block, &mut remaining);
        }
    }
    if let Some(Value::Array(messages)) = body.get_mut("messages") {
        for message in messages {
            if let Some(Value::Array(blocks)) = message.get_mut("content") {
                for block in blocks {
                    take_breakpoint(block, &mut remaining);
                }
            }
        }
    }
    if let Some(Value::Array(tools)) = body.get_mut("tools") {
        let last = tools.len().saturating_sub(1);
        for (idx, tool) in tools.iter_mut().enumerate() {
            if idx != last {
                // disallowed context
                if let Some(obj) = tool.as_object_mut() {
                    obj.remove("cache_control");
                }
            } else {
                take_breakpoint(tool, &mut remaining);
            }
        }
    }
}

fn take_breakpoint(block: &mut Value, remaining: &mut usize) {
    let Some(obj) = block.as_object_mut() else {
        return;
    };
    if obj.contains_key("cache_control") {
        if *remaining == 0 {
            obj.remove("cache_control");
        } else {
            *remaining -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::MessageBuilder;

    fn base_options() -> CallOptions {
        CallOptions::default().with_max_tokens(256)
    }

    #[test]
    fn basic_text_message_builds_block_content() {
        let (body, _) = build_messages_body(
            &Prompt::user("Hello, Claude"),
            &base_options(),
            &ProviderConfig::new(),
            "claude-sonnet-4-20250514",
            false,
        )
        .expect("body");

        assert_eq!(body["max_tokens"], json!(256));
        let content = body["messages"][0]["content"].as_array().expect("blocks");
        assert_eq!(content[0], json!({"type": "text", "text": "Hello, Claude"}));
    }

    #[test]
    fn system_messages_fold_into_system_block_array() {
        let prompt = Prompt::with_system("be terse", "hi");
        let (body, _) = build_messages_body(
            &prompt,
            &base_options(),
            &ProviderConfig::new(),
            "claude-sonnet-4-20250514",
            false,
        )
        .expect("body");

        let system = body["system"].as_array().expect("system array");
        assert_eq!(system[0]["type"], json!("text"));
        assert_eq!(system[0]["text"], json!("be terse"));
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    /// 超过 4 个 cache_control 断点时按输入顺序静默丢弃
    #[test]
    fn at_most_four_cache_breakpoints_survive() {
        let mut builder = MessageBuilder::new(ChatRole::User);
        for i in 0..6 {
            builder = builder.cache_ephemeral().text(format!("part {i}"));
        }
        let prompt = Prompt::new(vec![builder.build()]);
        let (body, _) = build_messages_body(
            &prompt,
            &base_options(),
            &ProviderConfig::new(),
            "claude-sonnet-4-20250514",
            false,
        )
        .expect("body");

        let blocks = body["messages"][0]["content"].as_array().expect("blocks");
        let tagged: Vec<bool> = blocks
            .iter()
            .map(|b| b.get("cache_control").is_some())
            .collect();
        assert_eq!(tagged, vec![true, true, true, true, false, false]);
    }

    /// thinking 开启时不得出现采样参数，max_tokens 按模型上限截断
    #[test]
    fn thinking_omits_sampling_and_clamps_max_tokens() {
        let options = CallOptions {
            max_tokens: Some(30000),
            temperature: Some(0.5),
            top_p: Some(0.9),
            top_k: Some(40),
            ..Default::default()
        };
        let config = ProviderConfig::new().with_extension(ext::THINKING_BUDGET, 8000u32);
        let (body, _) = build_messages_body(
            &Prompt::user("think hard"),
            &options,
            &config,
            "claude-opus-4-20250514",
            false,
        )
        .expect("body");

        assert_eq!(body["thinking"], json!({"type": "enabled", "budget_tokens": 8000}));
        assert!(body.get("temperature").is_none());
        assert!(body.get("top_p").is_none());
        assert!(body.get("top_k").is_none());
        // 30000 + 8000 clamped to the opus-4 ceiling
        assert_eq!(body["max_tokens"], json!(32000));
    }

    #[test]
    fn unknown_model_uses_conservative_ceiling() {
        assert_eq!(model_max_tokens("claude-sonnet-4-20250514"), 64000);
        assert_eq!(model_max_tokens("claude-3-7-sonnet-20250219"), 64000);
        assert_eq!(model_max_tokens("claude-3-5-haiku-20241022"), 8192);
        assert_eq!(model_max_tokens("claude-3-haiku-20240307"), 4096);
        assert_eq!(model_max_tokens("someday-model"), 4096);
    }

    #[test]
    fn tool_schema_is_normalized_to_object_with_properties() {
        let options = base_options().with_tools(vec![ToolSpec::new(
            "lookup",
            "find things",
            json!({"required": ["q"]}),
        )]);
        let (body, _) = build_messages_body(
            &Prompt::user("hi"),
            &options,
            &ProviderConfig::new(),
            "claude-sonnet-4-20250514",
            false,
        )
        .expect("body");

        let schema = &body["tools"][0]["input_schema"];
        assert_eq!(schema["type"], json!("object"));
        assert_eq!(schema["properties"], json!({}));
        assert_eq!(schema["required"], json!(["q"]));
    }

    #[test]
    fn web_search_tool_remaps_to_builtin_with_config() {
        let config = ProviderConfig::new().with_extension(
            ext::WEB_SEARCH,
            json!({"max_uses": 5, "blocked_domains": ["spam.example"]}),
        );
        let options = base_options().with_tools(vec![ToolSpec {
            name: "web_search".to_string(),
            description: None,
            parameters: json!({}),
            cache_control: None,
        }]);
        let (body, _) = build_messages_body(
            &Prompt::user("search it"),
            &options,
            &config,
            "claude-sonnet-4-20250514",
            false,
        )
        .expect("body");

        let tool = &body["tools"][0];
        assert_eq!(tool["type"], json!(WEB_SEARCH_TOOL_TYPE));
        assert_eq!(tool["max_uses"], json!(5));
        assert_eq!(tool["blocked_domains"], json!(["spam.example"]));
    }

    /// 只有最后一个工具允许携带 cache_control
    #[test]
    fn only_the_last_tool_keeps_its_cache_control() {
        let options = base_options().with_tools(vec![
            ToolSpec::new("first", "", json!({})).with_cache_ephemeral(),
            ToolSpec::new("last", "", json!({})).with_cache_ephemeral(),
        ]);
        let (body, _) = build_messages_body(
            &Prompt::user("hi"),
            &options,
            &ProviderConfig::new(),
            "claude-sonnet-4-20250514",
            false,
        )
        .expect("body");

        let tools = body["tools"].as_array().expect("tools");
        assert!(tools[0].get("cache_control").is_none());
        assert_eq!(tools[1]["cache_control"], json!({"type": "ephemeral"}));
    }

    #[test]
    fn tool_cache_control_counts_against_the_breakpoint_budget() {
        let mut builder = MessageBuilder::new(ChatRole::User);
        for i in 0..4 {
            builder = builder.cache_ephemeral().text(format!("part {i}"));
        }
        let prompt = Prompt::new(vec![builder.build()]);
        let options = base_options()
            .with_tools(vec![ToolSpec::new("lookup", "", json!({})).with_cache_ephemeral()]);
        let (body, _) = build_messages_body(
            &prompt,
            &options,
            &ProviderConfig::new(),
            "claude-sonnet-4-20250514",
            false,
        )
        .expect("body");

        // four message breakpoints exhaust the budget before the tool
        let blocks = body["messages"][0]["content"].as_array().expect("blocks");
        assert!(blocks.iter().all(|b| b.get("cache_control").is_some()));
        assert!(body["tools"][0].get("cache_control").is_none());
    }

    #[test]
    fn tool_choice_carries_disable_parallel_flag() {
        let options = CallOptions {
            max_tokens: Some(100),
            tool_choice: Some(ToolChoice::Tool {
                name: "calc".to_string(),
            }),
            disable_parallel_tool_use: Some(true),
            ..Default::default()
        };
        let (body, _) = build_messages_body(
            &Prompt::user("hi"),
            &options,
            &ProviderConfig::new(),
            "claude-sonnet-4-20250514",
            false,
        )
        .expect("body");

        assert_eq!(
            body["tool_choice"],
            json!({"type": "tool", "name": "calc", "disable_parallel_tool_use": true})
        );
    }

    #[test]
    fn metadata_merges_user_id_config_and_call_metadata() {
        let config = ProviderConfig::new()
            .with_extension(ext::USER_ID, "u-1")
            .with_extension(ext::METADATA, json!({"team": "core"}));
        let mut options = base_options();
        options
            .metadata
            .insert("trace".to_string(), json!("t-9"));
        let (body, _) = build_messages_body(
            &Prompt::user("hi"),
            &options,
            &config,
            "claude-sonnet-4-20250514",
            false,
        )
        .expect("body");

        assert_eq!(body["metadata"]["user_id"], json!("u-1"));
        assert_eq!(body["metadata"]["team"], json!("core"));
        assert_eq!(body["metadata"]["trace"], json!("t-9"));
    }

    #[test]
    fn prompt_without_conversation_messages_is_rejected() {
        let prompt = Prompt::new(vec![ChatMessage::text(ChatRole::System, "only system")]);
        let err = build_messages_body(
            &prompt,
            &base_options(),
            &ProviderConfig::new(),
            "claude-sonnet-4-20250514",
            false,
        )
        .expect_err("should fail");
        assert!(matches!(err, LLMError::InvalidRequest { .. }));
    }
}
