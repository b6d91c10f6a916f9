use futures_util::StreamExt;
use futures_util::stream;

use crate::codec::Utf8StreamDecoder;
use crate::error::LLMError;
use crate::http::HttpBodyStream;
use crate::provider::ChatStream;
use crate::types::{ChatEvent, TokenUsage, ToolCallRequest};

use super::response::{convert_finish_reason, convert_usage};
use super::types::GenerateContentResponse;

/// Incrementally extracts complete top-level JSON objects from a streamed
/// JSON array (`[{...},\n{...}]`).
///
/// The transport delivers arbitrary chunk boundaries, so this tracks brace
/// depth and string/escape state instead of waiting for whole lines. Array
/// punctuation between objects is skipped.
#[derive(Debug, Default)]
pub(crate) struct JsonArrayDecoder {
    buffer: String,
    utf8: Utf8StreamDecoder,
    depth: usize,
    in_string: bool,
    escaped: bool,
    object_start: Option<usize>,
}

impl JsonArrayDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let decoded = self.utf8.decode(chunk);
        self.extract(&decoded)
    }

    fn extract(&mut self, decoded: &str) -> Vec<String> {
        let base = self.buffer.len();
        self.buffer.push_str(decoded);
        let mut complete = Vec::new();

        let bytes: Vec<(usize, char)> = self.buffer[base..]
            .char_indices()
            .map(|(i, c)| (base + i, c))
            .collect();
        for (idx, ch) in bytes {
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if ch == '\\' {
                    self.escaped = true;
                } else if ch == '"' {
                    self.in_string = false;
                }
                continue;
            }
            match ch {
                '"' => {
                    if self.depth > 0 {
                        self.in_string = true;
                    }
                }
                '{' => {
                    if self.depth == 0 {
                        self.object_start = Some(idx);
                    }
                    self.depth += 1;
                }
                '}' => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        if let Some(start) = self.object_start.take() {
                            complete.push(self.buffer[start..=idx].to_string());
                        }
                    }
                }
                // array punctuation and whitespace between objects
                _ => {}
            }
        }

        // Compact the buffer once every started object has been emitted.
        if self.depth == 0 && self.object_start.is_none() {
            self.buffer.clear();
        }
        complete
    }
}

enum Input {
    Chunk(Vec<u8>),
    Error(LLMError),
    End,
}

struct GeminiStreamState {
    decoder: JsonArrayDecoder,
    usage: Option<TokenUsage>,
    finish_reason: Option<String>,
    tool_index: usize,
    terminal_emitted: bool,
}

/// Converts a streamed GenerateContent body into a [`ChatStream`].
pub(crate) fn create_stream(body: HttpBodyStream) -> ChatStream {
    let mut state = GeminiStreamState {
        decoder: JsonArrayDecoder::new(),
        usage: None,
        finish_reason: None,
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
                let mut events = Vec::new();
                for object in state.decoder.push(&bytes) {
                    match serde_json::from_str::<GenerateContentResponse>(&object) {
                        Ok(resp) => events.extend(handle_response(&mut state, resp).into_iter().map(Ok)),
                        Err(err) => {
                            tracing::debug!(error = %err, "dropping undecodable stream object");
                        }
                    }
                }
                events
            }
            Input::End => {
                if state.terminal_emitted {
                    Vec::new()
                } else {
                    state.terminal_emitted = true;
                    vec![Ok(ChatEvent::Completion {
                        finish_reason: state
                            .finish_reason
                            .as_deref()
                            .map(convert_finish_reason),
                        usage: state.usage.clone(),
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

fn handle_response(
    state: &mut GeminiStreamState,
    resp: GenerateContentResponse,
) -> Vec<ChatEvent> {
    let mut events = Vec::new();
    if let Some(usage) = &resp.usage_metadata {
        state.usage = Some(convert_usage(usage));
    }
    if let Some(candidate) = resp.candidates.first() {
        if let Some(content) = &candidate.content {
            for part in &content.parts {
                if let Some(text) = &part.text {
                    if !text.is_empty() {
                        if part.thought.unwrap_or(false) {
                            events.push(ChatEvent::ThinkingDelta { text: text.clone() });
                        } else {
                            events.push(ChatEvent::TextDelta {
                                index: 0,
                                text: text.clone(),
                            });
                        }
                    }
                }
                if let Some(call) = &part.function_call {
                    let index = state.tool_index;
                    state.tool_index += 1;
                    let arguments = call
                        .args
                        .as_ref()
                        .map(|a| a.to_string())
                        .unwrap_or_else(|| "{}".to_string());
                    // Whole calls arrive in one object on this protocol.
                    events.push(ChatEvent::ToolCall {
                        index,
                        call: ToolCallRequest {
                            id: Some(crate::stream_parts::synthesized_call_id(index)),
                            name: call.name.clone(),
                            arguments,
                        },
                    });
                }
            }
        }
        if let Some(reason) = &candidate.finish_reason {
            state.finish_reason = Some(reason.clone());
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;
    use crate::types::FinishReason;

    #[test]
    fn json_array_decoder_handles_arbitrary_chunk_boundaries() {
        let payload = br#"[{"a": "one {\" two"},
{"b": 2}]"#;
        for split in 0..payload.len() {
            let mut decoder = JsonArrayDecoder::new();
            let mut objects = decoder.push(&payload[..split]);
            objects.extend(decoder.push(&payload[split..]));
            assert_eq!(objects.len(), 2, "split at {split}");
            assert_eq!(objects[0], r#"{"a": "one {\" two"}"#);
            assert_eq!(objects[1], r#"{"b": 2}"#);
        }
    }

    #[tokio::test]
    async fn streamed_candidates_become_deltas_and_terminal_completion() {
        let chunks: Vec<Result<Vec<u8>, LLMError>> = vec![
            Ok(br#"[{"candidates":[{"content":{"parts":[{"text":"Hel"}],"role":"model"}}]},"#.to_vec()),
            Ok(br#"{"candidates":[{"content":{"parts":[{"text":"lo"}],"role":"model"},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":2,"candidatesTokenCount":1,"totalTokenCount":3}}]"#.to_vec()),
        ];
        let body: HttpBodyStream = Box::pin(stream::iter(chunks));
        let events: Vec<ChatEvent> = create_stream(body)
            .map(|e| e.expect("event"))
            .collect()
            .await;

        let text: String = events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::TextDelta { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Hello");
        match events.last().unwrap() {
            ChatEvent::Completion {
                finish_reason,
                usage,
                terminal: true,
            } => {
                assert_eq!(finish_reason, &Some(FinishReason::Stop));
                assert_eq!(usage.as_ref().unwrap().total_tokens, Some(3));
            }
            other => panic!("expected terminal completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn function_call_parts_become_tool_calls_with_synthesized_ids() {
        let chunks: Vec<Result<Vec<u8>, LLMError>> = vec![Ok(
            br#"[{"candidates":[{"content":{"parts":[{"functionCall":{"name":"calc","args":{"a":1}}}],"role":"model"},"finishReason":"STOP"}]}]"#.to_vec(),
        )];
        let body: HttpBodyStream = Box::pin(stream::iter(chunks));
        let events: Vec<ChatEvent> = create_stream(body)
            .map(|e| e.expect("event"))
            .collect()
            .await;

        let call = events
            .iter()
            .find_map(|e| match e {
                ChatEvent::ToolCall { call, .. } => Some(call.clone()),
                _ => None,
            })
            .expect("tool call");
        assert_eq!(call.id.as_deref(), Some("call_0"));
        assert_eq!(call.arguments, r#"{"a":1}"#);
    }
}
