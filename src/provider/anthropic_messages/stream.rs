use std::collections::BTreeMap;

use futures_util::StreamExt;
use futures_util::stream;
use serde_json::Value;

use crate::error::LLMError;
use crate::http::HttpBodyStream;
use crate::provider::ChatStream;
use crate::sse::{SseDecoder, SseEvent};
use crate::types::{ChatEvent, TokenUsage, ToolCallRequest};

use super::response::{convert_finish_reason, convert_usage};
use super::types::{StreamFrame, WireUsage};

#[derive(Debug, Clone)]
enum BlockKind {
    Text,
    Thinking,
    ToolUse { id: Option<String>, name: String },
    Passthrough,
}

struct BlockState {
    kind: BlockKind,
    /// Concatenated `partial_json` fragments for tool_use blocks.
    json_buffer: String,
}

struct AnthropicStreamState {
    blocks: BTreeMap<usize, BlockState>,
    usage: WireUsage,
    stop_reason: Option<String>,
    terminal_emitted: bool,
}

impl AnthropicStreamState {
    fn new() -> Self {
        Self {
            blocks: BTreeMap::new(),
            usage: WireUsage::default(),
            stop_reason: None,
            terminal_emitted: false,
        }
    }

    fn merge_usage(&mut self, incoming: &WireUsage) {
        if incoming.input_tokens.is_some() {
            self.usage.input_tokens = incoming.input_tokens;
        }
        if incoming.output_tokens.is_some() {
            self.usage.output_tokens = incoming.output_tokens;
        }
        if incoming.cache_creation_input_tokens.is_some() {
            self.usage.cache_creation_input_tokens = incoming.cache_creation_input_tokens;
        }
        if incoming.cache_read_input_tokens.is_some() {
            self.usage.cache_read_input_tokens = incoming.cache_read_input_tokens;
        }
    }

    fn cumulative_usage(&self) -> TokenUsage {
        convert_usage(&self.usage)
    }
}

enum Input {
    Event(SseEvent),
    Error(LLMError),
    End,
}

/// Converts an event-typed Messages SSE body into a [`ChatStream`].
pub(crate) fn create_stream(body: HttpBodyStream) -> ChatStream {
    let mut state = AnthropicStreamState::new();

    let inputs = SseDecoder::new(body)
        .map(|item| match item {
            Ok(event) => Input::Event(event),
            Err(err) => Input::Error(err),
        })
        .chain(stream::once(async { Input::End }));

    let events = inputs.flat_map(move |input| {
        let out: Vec<Result<ChatEvent, LLMError>> = match input {
            Input::Event(SseEvent::Frame { data, .. }) => {
                match serde_json::from_str::<StreamFrame>(&data) {
                    Ok(frame) => handle_frame(&mut state, frame),
                    Err(err) => {
                        tracing::debug!(error = %err, "dropping undecodable stream event");
                        Vec::new()
                    }
                }
            }
            Input::Event(SseEvent::Done) | Input::End => {
                if state.terminal_emitted {
                    Vec::new()
                } else {
                    state.terminal_emitted = true;
                    vec![Ok(ChatEvent::Completion {
                        finish_reason: state
                            .stop_reason
                            .as_deref()
                            .map(convert_finish_reason),
                        usage: Some(state.cumulative_usage()),
                        terminal: true,
                    })]
                }
            }
            Input::Error(err) => vec![Err(err)],
        };
        stream::iter(out)
    });

    Box::pin(events)
}

fn handle_frame(
    state: &mut AnthropicStreamState,
    frame: StreamFrame,
) -> Vec<Result<ChatEvent, LLMError>> {
    match frame.kind.as_str() {
        "message_start" => {
            let mut events = Vec::new();
            if let Some(message) = &frame.message {
                if let Some(id) = message.get("id").and_then(|v| v.as_str()) {
                    events.push(Ok(ChatEvent::ResponseId { id: id.to_string() }));
                }
                if let Some(usage) = message.get("usage") {
                    if let Ok(usage) = serde_json::from_value::<WireUsage>(usage.clone()) {
                        state.merge_usage(&usage);
                    }
                }
            }
            // Cumulative usage without signaling termination.
            events.push(Ok(ChatEvent::Completion {
                finish_reason: None,
                usage: Some(state.cumulative_usage()),
                terminal: false,
            }));
            events
        }
        "content_block_start" => handle_block_start(state, &frame),
        "content_block_delta" => handle_block_delta(state, &frame),
        "content_block_stop" => handle_block_stop(state, &frame),
        "message_delta" => {
            let mut events = Vec::new();
            if let Some(usage) = &frame.usage {
                state.merge_usage(usage);
            }
            if let Some(delta) = &frame.delta {
                if let Some(usage) = delta.get("usage") {
                    if let Ok(usage) = serde_json::from_value::<WireUsage>(usage.clone()) {
                        state.merge_usage(&usage);
                    }
                }
                if let Some(reason) = delta.get("stop_reason").and_then(|v| v.as_str()) {
                    // `pause_turn` marks a long-running server operation; it
                    // is reported but does not terminate the stream.
                    state.stop_reason = Some(reason.to_string());
                }
            }
            events.push(Ok(ChatEvent::Completion {
                finish_reason: state.stop_reason.as_deref().map(convert_finish_reason),
                usage: Some(state.cumulative_usage()),
                terminal: false,
            }));
            events
        }
        "message_stop" => {
            if state.terminal_emitted {
                return Vec::new();
            }
            state.terminal_emitted = true;
            vec![Ok(ChatEvent::Completion {
                finish_reason: state.stop_reason.as_deref().map(convert_finish_reason),
                usage: Some(state.cumulative_usage()),
                terminal: true,
            })]
        }
        "error" => {
            let (kind, message) = frame
                .error
                .map(|e| {
                    (
                        e.kind.unwrap_or_default(),
                        e.message.unwrap_or_else(|| "stream error".to_string()),
                    )
                })
                .unwrap_or_default();
            vec![Err(map_stream_error(&kind, message))]
        }
        // ping and future event types are ignored
        _ => Vec::new(),
    }
}

fn handle_block_start(
    state: &mut AnthropicStreamState,
    frame: &StreamFrame,
) -> Vec<Result<ChatEvent, LLMError>> {
    let index = frame.index.unwrap_or(0);
    let Some(block) = &frame.content_block else {
        return Vec::new();
    };
    let kind = block.get("type").and_then(|v| v.as_str()).unwrap_or("");
    match kind {
        "text" => {
            state.blocks.insert(
                index,
                BlockState {
                    kind: BlockKind::Text,
                    json_buffer: String::new(),
                },
            );
            Vec::new()
        }
        "thinking" | "redacted_thinking" => {
            state.blocks.insert(
                index,
                BlockState {
                    kind: BlockKind::Thinking,
                    json_buffer: String::new(),
                },
            );
            Vec::new()
        }
        "tool_use" => {
            let id = block.get("id").and_then(|v| v.as_str()).map(String::from);
            let name = block
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            state.blocks.insert(
                index,
                BlockState {
                    kind: BlockKind::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                    },
                    json_buffer: String::new(),
                },
            );
            vec![Ok(ChatEvent::ToolCallDelta {
                index,
                id,
                name: Some(name),
                arguments_delta: None,
            })]
        }
        // server_tool_use, *_tool_result, mcp_tool_* are preserved for
        // pass-through; they are executed by the provider, never locally.
        _ => {
            state.blocks.insert(
                index,
                BlockState {
                    kind: BlockKind::Passthrough,
                    json_buffer: String::new(),
                },
            );
            vec![Ok(ChatEvent::ProviderExecuted {
                block: block.clone(),
            })]
        }
    }
}

fn handle_block_delta(
    state: &mut AnthropicStreamState,
    frame: &StreamFrame,
) -> Vec<Result<ChatEvent, LLMError>> {
    let index = frame.index.unwrap_or(0);
    let Some(delta) = &frame.delta else {
        return Vec::new();
    };
    let delta_type = delta.get("type").and_then(|v| v.as_str()).unwrap_or("");
    match delta_type {
        "text_delta" => {
            let Some(text) = delta.get("text").and_then(|v| v.as_str()) else {
                return Vec::new();
            };
            vec![Ok(ChatEvent::TextDelta {
                index,
                text: text.to_string(),
            })]
        }
        "thinking_delta" => {
            let Some(text) = delta.get("thinking").and_then(|v| v.as_str()) else {
                return Vec::new();
            };
            vec![Ok(ChatEvent::ThinkingDelta {
                text: text.to_string(),
            })]
        }
        "input_json_delta" => {
            let Some(partial) = delta.get("partial_json").and_then(|v| v.as_str()) else {
                return Vec::new();
            };
            if let Some(block) = state.blocks.get_mut(&index) {
                block.json_buffer.push_str(partial);
            }
            vec![Ok(ChatEvent::ToolCallDelta {
                index,
                id: None,
                name: None,
                arguments_delta: Some(partial.to_string()),
            })]
        }
        // Citations attach to the surrounding text block instead of being
        // dropped.
        "citations_delta" => {
            let citation = delta
                .get("citation")
                .cloned()
                .unwrap_or(Value::Null);
            vec![Ok(ChatEvent::CitationsDelta { index, citation })]
        }
        // signature_delta and unknown delta kinds carry nothing we surface
        _ => Vec::new(),
    }
}

fn handle_block_stop(
    state: &mut AnthropicStreamState,
    frame: &StreamFrame,
) -> Vec<Result<ChatEvent, LLMError>> {
    let index = frame.index.unwrap_or(0);
    let Some(block) = state.blocks.remove(&index) else {
        return Vec::new();
    };
    match block.kind {
        BlockKind::ToolUse { id, name } => {
            let arguments = if block.json_buffer.trim().is_empty() {
                "{}".to_string()
            } else {
                block.json_buffer
            };
            vec![Ok(ChatEvent::ToolCall {
                index,
                call: ToolCallRequest {
                    id,
                    name,
                    arguments,
                },
            })]
        }
        _ => Vec::new(),
    }
}

fn map_stream_error(kind: &str, message: String) -> LLMError {
    match kind {
        "authentication_error" | "permission_error" => LLMError::Auth { message },
        "invalid_request_error" => LLMError::InvalidRequest { message },
        "not_found_error" => LLMError::NotFound {
            model: None,
            message,
        },
        "rate_limit_error" => LLMError::RateLimit {
            message,
            retry_after: None,
            remaining: None,
        },
        "overloaded_error" => LLMError::Server {
            status: 529,
            message,
        },
        "api_error" => LLMError::Server {
            status: 500,
            message,
        },
        _ => LLMError::Other { message },
    }
}
