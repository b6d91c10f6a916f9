use std::collections::BTreeMap;

use futures_util::StreamExt;
use futures_util::stream;

use crate::error::LLMError;
use crate::http::HttpBodyStream;
use crate::provider::ChatStream;
use crate::sse::{SseDecoder, SseEvent};
use crate::types::{ChatEvent, FinishReason, TokenUsage, ToolCallRequest};

use super::response::convert_usage;
use super::types::{StreamEvent, WireUsage};

#[derive(Default)]
struct PendingCall {
    id: Option<String>,
    name: String,
    arguments: String,
    emitted: bool,
}

struct ResponsesStreamState {
    calls: BTreeMap<usize, PendingCall>,
    usage: Option<TokenUsage>,
    saw_tool_call: bool,
    incomplete: bool,
    terminal_emitted: bool,
}

impl ResponsesStreamState {
    fn new() -> Self {
        Self {
            calls: BTreeMap::new(),
            usage: None,
            saw_tool_call: false,
            incomplete: false,
            terminal_emitted: false,
        }
    }

    fn finish_reason(&self) -> FinishReason {
        if self.incomplete {
            FinishReason::Length
        } else if self.saw_tool_call {
            FinishReason::ToolCalls
        } else {
            FinishReason::Stop
        }
    }
}

enum Input {
    Event(SseEvent),
    Error(LLMError),
    End,
}

/// Converts a Responses SSE body into a [`ChatStream`].
pub(crate) fn create_stream(body: HttpBodyStream) -> ChatStream {
    let mut state = ResponsesStreamState::new();

    let inputs = SseDecoder::new(body)
        .map(|item| match item {
            Ok(event) => Input::Event(event),
            Err(err) => Input::Error(err),
        })
        .chain(stream::once(async { Input::End }));

    let events = inputs.flat_map(move |input| {
        let out: Vec<Result<ChatEvent, LLMError>> = match input {
            Input::Event(SseEvent::Frame { data, .. }) => {
                match serde_json::from_str::<StreamEvent>(&data) {
                    Ok(event) => handle_event(&mut state, event),
                    Err(err) => {
                        tracing::debug!(error = %err, "dropping undecodable stream event");
                        Vec::new()
                    }
                }
            }
            Input::Event(SseEvent::Done) | Input::End => finalize(&mut state),
            Input::Error(err) => vec![Err(err)],
        };
        stream::iter(out)
    });

    Box::pin(events)
}

fn handle_event(
    state: &mut ResponsesStreamState,
    event: StreamEvent,
) -> Vec<Result<ChatEvent, LLMError>> {
    match event.kind.as_str() {
        "response.created" => {
            let id = event
                .response
                .as_ref()
                .and_then(|r| r.get("id"))
                .and_then(|v| v.as_str());
            match id {
                Some(id) => vec![Ok(ChatEvent::ResponseId { id: id.to_string() })],
                None => Vec::new(),
            }
        }
        "response.output_text.delta" => match event.delta {
            Some(delta) if !delta.is_empty() => vec![Ok(ChatEvent::TextDelta {
                index: event.output_index.unwrap_or(0),
                text: delta,
            })],
            _ => Vec::new(),
        },
        "response.reasoning_summary_text.delta" => match event.delta {
            Some(delta) if !delta.is_empty() => {
                vec![Ok(ChatEvent::ThinkingDelta { text: delta })]
            }
            _ => Vec::new(),
        },
        "response.output_item.added" => {
            let index = event.output_index.unwrap_or(0);
            let Some(item) = &event.item else {
                return Vec::new();
            };
            match item.get("type").and_then(|t| t.as_str()) {
                Some("function_call") => {
                    let id = item
                        .get("call_id")
                        .or_else(|| item.get("id"))
                        .and_then(|v| v.as_str())
                        .map(String::from);
                    let name = item
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    state.saw_tool_call = true;
                    state.calls.insert(
                        index,
                        PendingCall {
                            id: id.clone(),
                            name: name.clone(),
                            arguments: String::new(),
                            emitted: false,
                        },
                    );
                    vec![Ok(ChatEvent::ToolCallDelta {
                        index,
                        id,
                        name: Some(name),
                        arguments_delta: None,
                    })]
                }
                // web_search_call / file_search_call / code_interpreter_call
                // / image_generation_call progress items pass through.
                Some(kind) if kind.ends_with("_call") => {
                    vec![Ok(ChatEvent::ProviderExecuted {
                        block: item.clone(),
                    })]
                }
                _ => Vec::new(),
            }
        }
        "response.function_call_arguments.delta" => {
            let index = event.output_index.unwrap_or(0);
            let Some(delta) = event.delta.filter(|d| !d.is_empty()) else {
                return Vec::new();
            };
            if let Some(call) = state.calls.get_mut(&index) {
                call.arguments.push_str(&delta);
            }
            vec![Ok(ChatEvent::ToolCallDelta {
                index,
                id: None,
                name: None,
                arguments_delta: Some(delta),
            })]
        }
        "response.function_call_arguments.done" | "response.output_item.done" => {
            let index = event.output_index.unwrap_or(0);
            let Some(call) = state.calls.get_mut(&index) else {
                return Vec::new();
            };
            if call.emitted {
                return Vec::new();
            }
            call.emitted = true;
            // The done event may carry the authoritative full arguments.
            if let Some(full) = &event.arguments {
                call.arguments = full.clone();
            } else if let Some(args) = event
                .item
                .as_ref()
                .and_then(|i| i.get("arguments"))
                .and_then(|v| v.as_str())
            {
                call.arguments = args.to_string();
            }
            vec![Ok(ChatEvent::ToolCall {
                index,
                call: ToolCallRequest {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: if call.arguments.is_empty() {
                        "{}".to_string()
                    } else {
                        call.arguments.clone()
                    },
                },
            })]
        }
        "response.completed" | "response.incomplete" => {
            if event.kind == "response.incomplete" {
                state.incomplete = true;
            }
            if let Some(usage) = event
                .response
                .as_ref()
                .and_then(|r| r.get("usage"))
                .and_then(|u| serde_json::from_value::<WireUsage>(u.clone()).ok())
            {
                state.usage = Some(convert_usage(&usage));
            }
            finalize(state)
        }
        "response.failed" | "error" => {
            let message = event
                .response
                .as_ref()
                .and_then(|r| r.get("error"))
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("response failed")
                .to_string();
            vec![Err(LLMError::other(message))]
        }
        _ => Vec::new(),
    }
}

fn finalize(state: &mut ResponsesStreamState) -> Vec<Result<ChatEvent, LLMError>> {
    if state.terminal_emitted {
        return Vec::new();
    }
    state.terminal_emitted = true;
    let mut events = Vec::new();
    // Flush calls whose done event never arrived.
    let indexes: Vec<usize> = state.calls.keys().copied().collect();
    for index in indexes {
        let call = state.calls.get_mut(&index).expect("call exists");
        if !call.emitted {
            call.emitted = true;
            events.push(Ok(ChatEvent::ToolCall {
                index,
                call: ToolCallRequest {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: if call.arguments.is_empty() {
                        "{}".to_string()
                    } else {
                        call.arguments.clone()
                    },
                },
            }));
        }
    }
    events.push(Ok(ChatEvent::Completion {
        finish_reason: Some(state.finish_reason()),
        usage: state.usage.clone(),
        terminal: true,
    }));
    events
}
