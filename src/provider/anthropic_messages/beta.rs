use std::collections::HashMap;

use serde_json::Value;

use crate::http::RequestInterceptor;

const BETA_HEADER: &str = "anthropic-beta";
const INTERLEAVED_THINKING: &str = "interleaved-thinking-2025-05-14";
const FILES_API: &str = "files-api-2025-04-14";
const MCP_CLIENT: &str = "mcp-client-2025-04-04";
const EXTENDED_CACHE_TTL: &str = "extended-cache-ttl-2025-04-11";
const WEB_FETCH: &str = "web-fetch-2025-09-10";

/// Stamps `anthropic-beta` opt-ins derived from the outgoing request.
///
/// Request-body compilation stays pure; this interceptor inspects the final
/// endpoint and body right before send and appends the betas the request
/// actually needs. Existing header values are preserved and deduplicated.
#[derive(Debug, Default)]
pub struct AnthropicBetaInterceptor;

impl AnthropicBetaInterceptor {
    pub fn new() -> Self {
        Self
    }

    fn required_betas(url: &str, body: &Value) -> Vec<&'static str> {
        let mut betas = Vec::new();
        if url.contains("/files") {
            betas.push(FILES_API);
        }
        if body.get("mcp_servers").is_some() {
            betas.push(MCP_CLIENT);
        }
        if thinking_enabled(body) && model_supports_interleaved(body) {
            betas.push(INTERLEAVED_THINKING);
        }
        if has_one_hour_cache_ttl(body) {
            betas.push(EXTENDED_CACHE_TTL);
        }
        if has_web_fetch_tool(body) {
            betas.push(WEB_FETCH);
        }
        betas
    }
}

fn thinking_enabled(body: &Value) -> bool {
    body.get("thinking")
        .and_then(|t| t.get("type"))
        .and_then(|t| t.as_str())
        == Some("enabled")
}

fn model_supports_interleaved(body: &Value) -> bool {
    let Some(model) = body.get("model").and_then(|m| m.as_str()) else {
        return false;
    };
    model.contains("claude-sonnet-4")
        || model.contains("claude-opus-4")
        || model.contains("claude-haiku-4-5")
        || model.contains("claude-3-7")
}

/// Any `cache_control.ttl == "1h"` in system blocks or message parts.
fn has_one_hour_cache_ttl(body: &Value) -> bool {
    let block_has_ttl = |block: &Value| {
        block
            .get("cache_control")
            .and_then(|c| c.get("ttl"))
            .and_then(|t| t.as_str())
            == Some("1h")
    };
    if let Some(system) = body.get("system").and_then(|s| s.as_array()) {
        if system.iter().any(block_has_ttl) {
            return true;
        }
    }
    if let Some(messages) = body.get("messages").and_then(|m| m.as_array()) {
        for message in messages {
            if let Some(blocks) = message.get("content").and_then(|c| c.as_array()) {
                if blocks.iter().any(block_has_ttl) {
                    return true;
                }
            }
        }
    }
    false
}

fn has_web_fetch_tool(body: &Value) -> bool {
    body.get("tools")
        .and_then(|t| t.as_array())
        .is_some_and(|tools| {
            tools.iter().any(|tool| {
                tool.get("type")
                    .and_then(|t| t.as_str())
                    .is_some_and(|t| t.starts_with("web_fetch"))
            })
        })
}

impl RequestInterceptor for AnthropicBetaInterceptor {
    fn intercept(&self, url: &str, headers: &mut HashMap<String, String>, body: &Value) {
        let required = Self::required_betas(url, body);
        if required.is_empty() {
            return;
        }
        let mut betas: Vec<String> = headers
            .get(BETA_HEADER)
            .map(|existing| {
                existing
                    .split(',')
                    .map(|b| b.trim().to_string())
                    .filter(|b| !b.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        for beta in required {
            if !betas.iter().any(|b| b == beta) {
                betas.push(beta.to_string());
            }
        }
        headers.insert(BETA_HEADER.to_string(), betas.join(","));
    }
}
