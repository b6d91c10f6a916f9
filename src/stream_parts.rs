//! Uniform stream parts lifted from the protocol-agnostic event stream.
//!
//! Every protocol parser produces [`ChatEvent`] values; this adapter
//! converts them into [`StreamTextPart`] sequences with explicit channel
//! lifecycle markers. Per logical channel (each text index, each tool call)
//! a *Start* precedes any *Delta* and exactly one *End* precedes the
//! terminal *Finish*; events are never reordered across channels.

use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use serde::{Deserialize, Serialize};

use crate::error::LLMError;
use crate::provider::ChatStream;
use crate::types::{ChatEvent, FinishReason, TokenUsage};

/// Protocol-agnostic streaming part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamTextPart {
    TextStart { id: String },
    TextDelta { id: String, delta: String },
    TextEnd { id: String },
    ThinkingDelta { delta: String },
    ToolInputStart { id: String, tool_name: String },
    ToolInputDelta { id: String, partial_json: String },
    ToolInputEnd { id: String },
    /// Fully aggregated tool call; always emitted, even when the partial
    /// JSON fragments never parsed cleanly mid-stream.
    ToolCall {
        id: String,
        tool_name: String,
        arguments: String,
    },
    Finish {
        reason: Option<FinishReason>,
        usage: Option<TokenUsage>,
    },
}

/// Converts a [`ChatStream`] into a stream of [`StreamTextPart`] values.
pub fn into_stream_parts(inner: ChatStream) -> StreamPartAdapter {
    StreamPartAdapter::new(inner)
}

struct ToolChannel {
    id: String,
    name: String,
    open: bool,
}

/// Stream adapter enforcing the channel lifecycle invariants.
pub struct StreamPartAdapter {
    inner: ChatStream,
    pending: VecDeque<Result<StreamTextPart, LLMError>>,
    open_text: BTreeMap<usize, String>,
    tools: BTreeMap<usize, ToolChannel>,
    pending_reason: Option<FinishReason>,
    pending_usage: Option<TokenUsage>,
    finished: bool,
}

impl StreamPartAdapter {
    pub fn new(inner: ChatStream) -> Self {
        Self {
            inner,
            pending: VecDeque::new(),
            open_text: BTreeMap::new(),
            tools: BTreeMap::new(),
            pending_reason: None,
            pending_usage: None,
            finished: false,
        }
    }

    fn push(&mut self, part: StreamTextPart) {
        self.pending.push_back(Ok(part));
    }

    fn handle_event(&mut self, event: ChatEvent) {
        if self.finished {
            return;
        }
        match event {
            ChatEvent::TextDelta { index, text } => {
                if text.is_empty() {
                    return;
                }
                let id = match self.open_text.get(&index) {
                    Some(id) => id.clone(),
                    None => {
                        let id = format!("txt_{index}");
                        self.open_text.insert(index, id.clone());
                        self.push(StreamTextPart::TextStart { id: id.clone() });
                        id
                    }
                };
                self.push(StreamTextPart::TextDelta { id, delta: text });
            }
            ChatEvent::ThinkingDelta { text } => {
                if !text.is_empty() {
                    self.push(StreamTextPart::ThinkingDelta { delta: text });
                }
            }
            ChatEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments_delta,
            } => {
                if !self.tools.contains_key(&index) {
                    let channel = ToolChannel {
                        id: id.unwrap_or_else(|| synthesized_call_id(index)),
                        name: name.clone().unwrap_or_default(),
                        open: true,
                    };
                    self.push(StreamTextPart::ToolInputStart {
                        id: channel.id.clone(),
                        tool_name: channel.name.clone(),
                    });
                    self.tools.insert(index, channel);
                } else if let Some(name) = name.filter(|n| !n.is_empty()) {
                    // keep the first non-empty name
                    let channel = self.tools.get_mut(&index).expect("channel exists");
                    if channel.name.is_empty() {
                        channel.name = name;
                    }
                }
                if let Some(delta) = arguments_delta.filter(|d| !d.is_empty()) {
                    let id = self.tools[&index].id.clone();
                    self.push(StreamTextPart::ToolInputDelta {
                        id,
                        partial_json: delta,
                    });
                }
            }
            ChatEvent::ToolCall { index, call } => {
                let (id, was_open) = match self.tools.get_mut(&index) {
                    Some(channel) => {
                        let open = channel.open;
                        channel.open = false;
                        (channel.id.clone(), open)
                    }
                    None => {
                        // Whole call arrived in one event; open and close the
                        // channel around it to keep the lifecycle invariant.
                        let id = call
                            .id
                            .clone()
                            .unwrap_or_else(|| synthesized_call_id(index));
                        self.push(StreamTextPart::ToolInputStart {
                            id: id.clone(),
                            tool_name: call.name.clone(),
                        });
                        self.tools.insert(
                            index,
                            ToolChannel {
                                id: id.clone(),
                                name: call.name.clone(),
                                open: false,
                            },
                        );
                        (id, true)
                    }
                };
                if was_open {
                    self.push(StreamTextPart::ToolInputEnd { id: id.clone() });
                }
                self.push(StreamTextPart::ToolCall {
                    id: call.id.unwrap_or(id),
                    tool_name: call.name,
                    arguments: call.arguments,
                });
            }
            ChatEvent::Completion {
                finish_reason,
                usage,
                terminal,
            } => {
                if let Some(usage) = usage {
                    self.pending_usage = Some(usage);
                }
                if let Some(reason) = finish_reason {
                    self.pending_reason = Some(reason);
                }
                if terminal {
                    self.finish();
                }
            }
            // Citations and provider-executed blocks stay on the event
            // stream; they have no uniform-part representation.
            ChatEvent::CitationsDelta { .. }
            | ChatEvent::ProviderExecuted { .. }
            | ChatEvent::ResponseId { .. } => {}
        }
    }

    /// Closes every open channel and emits the single terminal Finish.
    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let open_text = std::mem::take(&mut self.open_text);
        for id in open_text.into_values() {
            self.push(StreamTextPart::TextEnd { id });
        }
        let tools = std::mem::take(&mut self.tools);
        for channel in tools.into_values() {
            if channel.open {
                self.push(StreamTextPart::ToolInputEnd { id: channel.id });
            }
        }
        let reason = self.pending_reason.take();
        let usage = self.pending_usage.take();
        self.push(StreamTextPart::Finish { reason, usage });
    }
}

/// Stable id for tool-call slots whose wire format omits one.
pub(crate) fn synthesized_call_id(index: usize) -> String {
    format!("call_{index}")
}

impl Stream for StreamPartAdapter {
    type Item = Result<StreamTextPart, LLMError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(part) = this.pending.pop_front() {
                return Poll::Ready(Some(part));
            }
            if this.finished {
                return Poll::Ready(None);
            }
            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => this.handle_event(event),
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Some(Err(err))),
                Poll::Ready(None) => {
                    // Stream ended without a terminal completion; still close
                    // channels and emit Finish so consumers see a full shape.
                    this.finish();
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
