use futures_util::StreamExt;
use futures_util::stream;

use crate::codec::{JsonLine, JsonLinesDecoder};
use crate::error::LLMError;
use crate::http::HttpBodyStream;
use crate::provider::ChatStream;
use crate::types::{ChatEvent, FinishReason, TokenUsage, ToolCallRequest};

use super::types::OllamaChatResponse;

enum Input {
    Chunk(Vec<u8>),
    Error(LLMError),
    End,
}

struct OllamaStreamState {
    decoder: JsonLinesDecoder,
    tool_index: usize,
    terminal_emitted: bool,
}

/// Converts a JSON-lines chat body into a [`ChatStream`].
pub(crate) fn create_stream(body: HttpBodyStream) -> ChatStream {
    let mut state = OllamaStreamState {
        decoder: JsonLinesDecoder::new(),
        tool_index: 0,
        terminal_emitted: false,
    };

    let inputs = body
        .map(|item| match item {
            Ok(bytes) => Input::Chunk(bytes),
            Err(err) => Input::Error(err),
        })
        .chain(stream::once(async { Input::End }));

    let events = inputs.flat_map(move |input| {
        let out: Vec<Result<ChatEvent, LLMError>> = match input {
            Input::Chunk(bytes) => {
                let lines = state.decoder.push(&bytes);
                decode_lines(&mut state, lines)
            }
            Input::End => {
                let mut events = match state.decoder.finish() {
                    Some(line) => decode_lines(&mut state, vec![line]),
                    None => Vec::new(),
                };
                if !state.terminal_emitted {
                    state.terminal_emitted = true;
                    events.push(Ok(ChatEvent::Completion {
                        finish_reason: None,
                        usage: None,
                        terminal: true,
                    }));
                }
                events
            }
            Input::Error(err) => vec![Err(err)],
        };
        stream::iter(out)
    });

    Box::pin(events)
}

fn decode_lines(
    state: &mut OllamaStreamState,
    lines: Vec<JsonLine>,
) -> Vec<Result<ChatEvent, LLMError>> {
    let mut events = Vec::new();
    for line in lines {
        match line {
            JsonLine::Value(value) => {
                match serde_json::from_value::<OllamaChatResponse>(value) {
                    Ok(resp) => events.extend(handle_response(state, resp).into_iter().map(Ok)),
                    Err(err) => {
                        tracing::debug!(error = %err, "dropping undecodable chat line");
                    }
                }
            }
            JsonLine::Undecodable(text) => {
                tracing::debug!(line = %text, "dropping non-JSON chat line");
            }
        }
    }
    events
}

fn handle_response(state: &mut OllamaStreamState, resp: OllamaChatResponse) -> Vec<ChatEvent> {
    let mut events = Vec::new();
    if let Some(message) = &resp.message {
        if let Some(thinking) = &message.thinking {
            if !thinking.is_empty() {
                events.push(ChatEvent::ThinkingDelta {
                    text: thinking.clone(),
                });
            }
        }
        if let Some(content) = &message.content {
            if !content.is_empty() {
                events.push(ChatEvent::TextDelta {
                    index: 0,
                    text: content.clone(),
                });
            }
        }
        for call in message.tool_calls.clone().unwrap_or_default() {
            let index = state.tool_index;
            state.tool_index += 1;
            let function = call.function.unwrap_or(super::types::OllamaToolFunction {
                name: None,
                arguments: None,
            });
            events.push(ChatEvent::ToolCall {
                index,
                call: ToolCallRequest {
                    id: Some(crate::stream_parts::synthesized_call_id(index)),
                    name: function.name.unwrap_or_default(),
                    arguments: function
                        .arguments
                        .map(|a| a.to_string())
                        .unwrap_or_else(|| "{}".to_string()),
                },
            });
        }
    }
    if resp.done && !state.terminal_emitted {
        state.terminal_emitted = true;
        let tool_calls_seen = state.tool_index > 0;
        events.push(ChatEvent::Completion {
            finish_reason: Some(match resp.done_reason.as_deref() {
                Some("length") => FinishReason::Length,
                _ if tool_calls_seen => FinishReason::ToolCalls,
                Some("stop") | None => FinishReason::Stop,
                Some(other) => FinishReason::Other(other.to_string()),
            }),
            usage: Some(TokenUsage {
                prompt_tokens: resp.prompt_eval_count,
                completion_tokens: resp.eval_count,
                reasoning_tokens: None,
                total_tokens: match (resp.prompt_eval_count, resp.eval_count) {
                    (Some(p), Some(e)) => Some(p + e),
                    _ => None,
                },
                details: None,
            }),
            terminal: true,
        });
    }
    events
}
