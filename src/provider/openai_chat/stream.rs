use std::collections::BTreeMap;

use futures_util::StreamExt;
use futures_util::stream;

use crate::error::LLMError;
use crate::http::HttpBodyStream;
use crate::provider::ChatStream;
use crate::sse::{SseDecoder, SseEvent};
use crate::types::{ChatEvent, TokenUsage, ToolCallRequest};

use super::response::{convert_finish_reason, convert_usage};
use super::types::{StreamChunk, WireToolCallDelta};

/// Per-index aggregation state for streamed tool calls.
///
/// Only the first chunk of a call carries `id` and `function.name`;
/// subsequent chunks reference the slot by index and append argument
/// fragments. A call completes when a terminal finish reason arrives or a
/// new index starts.
#[derive(Debug, Default)]
pub(crate) struct ToolCallStreamState {
    calls: BTreeMap<usize, PendingToolCall>,
    last_index: Option<usize>,
}

#[derive(Debug, Default)]
struct PendingToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
    emitted: bool,
}

impl ToolCallStreamState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Applies one wire fragment, returning the events it produces.
    ///
    /// The concatenation of emitted `arguments_delta` values equals the
    /// concatenation of input fragments, and the first non-empty name is
    /// preserved.
    pub(crate) fn apply(
        &mut self,
        delta: &WireToolCallDelta,
        fallback_index: usize,
    ) -> Vec<ChatEvent> {
        let index = delta.index.unwrap_or(fallback_index);
        let mut events = Vec::new();

        // A new slot completes every earlier slot that is still pending.
        if self.last_index != Some(index) {
            events.extend(self.complete_before(index));
            self.last_index = Some(index);
        }

        let entry = self.calls.entry(index).or_default();
        if entry.id.is_none() {
            entry.id = delta.id.clone();
        }
        let (name, arguments) = delta
            .function
            .as_ref()
            .map(|f| (f.name.clone(), f.arguments.clone()))
            .unwrap_or((None, None));
        if entry.name.is_empty() {
            if let Some(name) = &name {
                entry.name = name.clone();
            }
        }
        if let Some(fragment) = &arguments {
            entry.arguments.push_str(fragment);
        }

        events.push(ChatEvent::ToolCallDelta {
            index,
            id: delta.id.clone(),
            name,
            arguments_delta: arguments,
        });
        events
    }

    fn complete_before(&mut self, new_index: usize) -> Vec<ChatEvent> {
        let indexes: Vec<usize> = self
            .calls
            .iter()
            .filter(|(idx, call)| **idx != new_index && !call.emitted)
            .map(|(idx, _)| *idx)
            .collect();
        indexes
            .into_iter()
            .filter_map(|idx| self.emit(idx))
            .collect()
    }

    fn emit(&mut self, index: usize) -> Option<ChatEvent> {
        let call = self.calls.get_mut(&index)?;
        if call.emitted {
            return None;
        }
        call.emitted = true;
        Some(ChatEvent::ToolCall {
            index,
            call: ToolCallRequest {
                id: call.id.clone(),
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            },
        })
    }

    /// Completes every pending call; used on terminal finish reasons and at
    /// stream end to recover late-arriving chunks.
    pub(crate) fn finish_all(&mut self) -> Vec<ChatEvent> {
        let indexes: Vec<usize> = self.calls.keys().copied().collect();
        indexes
            .into_iter()
            .filter_map(|idx| self.emit(idx))
            .collect()
    }

    pub(crate) fn has_calls(&self) -> bool {
        !self.calls.is_empty()
    }
}

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// Splits inline `<think>…</think>` spans out of a complete text.
pub(crate) fn split_think_spans(text: &str) -> (String, String) {
    let mut splitter = ThinkTagSplitter::default();
    let (mut visible, mut thinking) = splitter.feed(text);
    let (tail_visible, tail_thinking) = splitter.flush();
    visible.push_str(&tail_visible);
    thinking.push_str(&tail_thinking);
    (visible, thinking)
}

/// Stateful splitter for `<think>` spans that may break across deltas.
///
/// A chunk ending mid-tag is carried over until the next chunk decides
/// whether the bytes belonged to a tag or to ordinary text.
#[derive(Debug, Default)]
struct ThinkTagSplitter {
    inside: bool,
    carry: String,
}

impl ThinkTagSplitter {
    fn feed(&mut self, input: &str) -> (String, String) {
        let mut text = String::new();
        let mut thinking = String::new();
        let mut rest = std::mem::take(&mut self.carry);
        rest.push_str(input);

        loop {
            let (tag, out): (&str, &mut String) = if self.inside {
                (THINK_CLOSE, &mut thinking)
            } else {
                (THINK_OPEN, &mut text)
            };
            if let Some(pos) = rest.find(tag) {
                out.push_str(&rest[..pos]);
                rest = rest[pos + tag.len()..].to_string();
                self.inside = !self.inside;
                continue;
            }
            // keep the longest suffix that could still become a tag
            let keep = longest_tag_prefix_suffix(&rest, tag);
            let split = rest.len() - keep;
            out.push_str(&rest[..split]);
            self.carry = rest[split..].to_string();
            break;
        }
        (text, thinking)
    }

    fn flush(&mut self) -> (String, String) {
        let carry = std::mem::take(&mut self.carry);
        if self.inside {
            (String::new(), carry)
        } else {
            (carry, String::new())
        }
    }
}

fn longest_tag_prefix_suffix(text: &str, tag: &str) -> usize {
    let max = tag.len().saturating_sub(1).min(text.len());
    for len in (1..=max).rev() {
        if text.is_char_boundary(text.len() - len) && tag.starts_with(&text[text.len() - len..]) {
            return len;
        }
    }
    0
}

enum Input {
    Event(SseEvent),
    Error(LLMError),
    End,
}

struct OpenAiStreamState {
    tool_state: ToolCallStreamState,
    think: ThinkTagSplitter,
    finish_reason: Option<String>,
    usage: Option<TokenUsage>,
    terminal_emitted: bool,
}

/// Converts a Chat Completions SSE body into a [`ChatStream`].
pub(crate) fn create_stream(body: HttpBodyStream) -> ChatStream {
    let mut state = OpenAiStreamState {
        tool_state: ToolCallStreamState::new(),
        think: ThinkTagSplitter::default(),
        finish_reason: None,
        usage: None,
        terminal_emitted: false,
    };

    let inputs = SseDecoder::new(body)
        .map(|item| match item {
            Ok(event) => Input::Event(event),
            Err(err) => Input::Error(err),
        })
        .chain(stream::once(async { Input::End }));

    let events = inputs.flat_map(move |input| {
        let out: Vec<Result<ChatEvent, LLMError>> = match input {
            Input::Event(SseEvent::Frame { data, .. }) => match serde_json::from_str::<StreamChunk>(&data)
            {
                Ok(chunk) => handle_chunk(&mut state, chunk).into_iter().map(Ok).collect(),
                Err(err) => {
                    // Undecodable chunks are logged and dropped; the stream
                    // continues.
                    tracing::debug!(error = %err, "dropping undecodable stream chunk");
                    Vec::new()
                }
            },
            Input::Event(SseEvent::Done) | Input::End => finalize(&mut state)
                .into_iter()
                .map(Ok)
                .collect(),
            Input::Error(err) => vec![Err(err)],
        };
        stream::iter(out)
    });

    Box::pin(events)
}

fn handle_chunk(state: &mut OpenAiStreamState, chunk: StreamChunk) -> Vec<ChatEvent> {
    let mut events = Vec::new();

    // A trailing usage chunk may arrive after finish_reason (Azure); the
    // newest report replaces the buffered one.
    if let Some(usage) = &chunk.usage {
        state.usage = Some(convert_usage(usage));
    }

    for choice in &chunk.choices {
        if let Some(delta) = &choice.delta {
            if let Some(content) = &delta.content {
                let (text, thinking) = state.think.feed(content);
                if !thinking.is_empty() {
                    events.push(ChatEvent::ThinkingDelta { text: thinking });
                }
                if !text.is_empty() {
                    events.push(ChatEvent::TextDelta {
                        index: choice.index,
                        text,
                    });
                }
            }
            if let Some(reasoning) = delta
                .reasoning_content
                .as_ref()
                .or(delta.reasoning.as_ref())
            {
                if !reasoning.is_empty() {
                    events.push(ChatEvent::ThinkingDelta {
                        text: reasoning.clone(),
                    });
                }
            }
            if let Some(tool_calls) = &delta.tool_calls {
                for tool_call in tool_calls {
                    events.extend(state.tool_state.apply(tool_call, choice.index));
                }
            }
        }
        if let Some(reason) = &choice.finish_reason {
            if state.finish_reason.is_none() {
                state.finish_reason = Some(reason.clone());
                if state.tool_state.has_calls() {
                    events.extend(state.tool_state.finish_all());
                }
                events.push(ChatEvent::Completion {
                    finish_reason: Some(convert_finish_reason(reason)),
                    usage: state.usage.clone(),
                    terminal: false,
                });
            }
        }
    }
    events
}

/// Emits the terminal completion exactly once, flushing leftover state.
fn finalize(state: &mut OpenAiStreamState) -> Vec<ChatEvent> {
    if state.terminal_emitted {
        return Vec::new();
    }
    state.terminal_emitted = true;
    let mut events = Vec::new();
    let (text, thinking) = state.think.flush();
    if !thinking.is_empty() {
        events.push(ChatEvent::ThinkingDelta { text: thinking });
    }
    if !text.is_empty() {
        events.push(ChatEvent::TextDelta { index: 0, text });
    }
    events.extend(state.tool_state.finish_all());
    events.push(ChatEvent::Completion {
        finish_reason: state
            .finish_reason
            .as_deref()
            .map(convert_finish_reason),
        usage: state.usage.clone(),
        terminal: true,
    });
    events
}
