use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;

use crate::codec::SseLineBuffer;
use crate::error::LLMError;
use crate::http::HttpBodyStream;

/// Standardized SSE event yielded by [`SseDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// One complete frame: the optional `event:` name and the joined `data:`
    /// payload.
    Frame {
        event: Option<String>,
        data: String,
    },
    /// Terminal marker reported via `data: [DONE]`.
    Done,
}

/// Normalizes provider SSE feeds into [`SseEvent`] values.
///
/// Handles both plain OpenAI-style streams (`data:` lines only) and
/// Anthropic's event-typed framing (`event: <name>\ndata: <json>\n\n`).
/// Chunks are split into lines by a [`SseLineBuffer`], at the byte level,
/// so multi-byte characters crossing chunk boundaries never corrupt a
/// frame.
pub struct SseDecoder {
    body: HttpBodyStream,
    lines: SseLineBuffer,
    event_name: Option<String>,
    data_lines: Vec<Vec<u8>>,
    pending: VecDeque<Result<SseEvent, LLMError>>,
    stream_closed: bool,
    done_received: bool,
}

impl SseDecoder {
    /// Wraps a raw HTTP body stream and prepares it for SSE decoding.
    pub fn new(body: HttpBodyStream) -> Self {
        Self {
            body,
            lines: SseLineBuffer::new(),
            event_name: None,
            data_lines: Vec::new(),
            pending: VecDeque::new(),
            stream_closed: false,
            done_received: false,
        }
    }

    fn handle_line(&mut self, line: Vec<u8>) {
        if let Some(rest) = line.strip_prefix(b"data:") {
            let mut data = rest.to_vec();
            if data.first() == Some(&b' ') {
                data.remove(0);
            }
            self.data_lines.push(data);
        } else if let Some(rest) = line.strip_prefix(b"event:") {
            let name = String::from_utf8_lossy(rest).trim().to_string();
            if !name.is_empty() {
                self.event_name = Some(name);
            }
        }
        // Comment (`:`) and `id:`/`retry:` lines are ignored.
    }

    fn flush_event(&mut self) -> Result<(), LLMError> {
        let event = self.event_name.take();
        if self.data_lines.is_empty() {
            return Ok(());
        }

        let mut joined = Vec::new();
        for (idx, mut segment) in self.data_lines.drain(..).enumerate() {
            if idx > 0 {
                joined.push(b'\n');
            }
            joined.append(&mut segment);
        }
        if joined.is_empty() {
            return Ok(());
        }

        let data = String::from_utf8(joined)
            .map_err(|err| LLMError::other(format!("invalid UTF-8 in stream chunk: {err}")))?;

        if data.trim() == "[DONE]" {
            if !self.done_received {
                self.done_received = true;
                self.pending.push_back(Ok(SseEvent::Done));
            }
        } else {
            self.pending.push_back(Ok(SseEvent::Frame { event, data }));
        }
        Ok(())
    }
}

impl Stream for SseDecoder {
    type Item = Result<SseEvent, LLMError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(event) = this.pending.pop_front() {
            return Poll::Ready(Some(event));
        }
        if this.done_received && this.pending.is_empty() {
            return Poll::Ready(None);
        }

        loop {
            if this.stream_closed {
                if let Some(partial) = this.lines.take_partial() {
                    this.handle_line(partial);
                }
                if let Err(err) = this.flush_event() {
                    return Poll::Ready(Some(Err(err)));
                }
                return this
                    .pending
                    .pop_front()
                    .map_or(Poll::Ready(None), |event| Poll::Ready(Some(event)));
            }

            match this.body.as_mut().poll_next(cx) {
                Poll::Ready(Some(chunk_result)) => match chunk_result {
                    Ok(bytes) => {
                        for line in this.lines.push(&bytes) {
                            if line.is_empty() {
                                if let Err(err) = this.flush_event() {
                                    return Poll::Ready(Some(Err(err)));
                                }
                            } else {
                                this.handle_line(line);
                            }
                        }
                        if let Some(event) = this.pending.pop_front() {
                            return Poll::Ready(Some(event));
                        }
                    }
                    Err(err) => return Poll::Ready(Some(Err(err))),
                },
                Poll::Ready(None) => {
                    this.stream_closed = true;
                    continue;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;
    use futures_util::stream;

    use super::*;

    fn build_body(chunks: Vec<Result<Vec<u8>, LLMError>>) -> HttpBodyStream {
        Box::pin(stream::iter(chunks))
    }

    #[tokio::test]
    async fn decoder_emits_data_and_done_events() {
        let chunks = vec![
            Ok(b"data: {\"text\":\"hi\"}\n\n".to_vec()),
            Ok(b"data: [DONE]\n\n".to_vec()),
        ];
        let mut decoder = SseDecoder::new(build_body(chunks));

        let first = decoder.next().await.expect("event").expect("ok");
        assert_eq!(
            first,
            SseEvent::Frame {
                event: None,
                data: "{\"text\":\"hi\"}".to_string()
            }
        );
        let second = decoder.next().await.expect("event").expect("ok");
        assert_eq!(second, SseEvent::Done);
        assert!(decoder.next().await.is_none());
    }

    #[tokio::test]
    async fn decoder_carries_event_names_for_typed_frames() {
        let chunks = vec![Ok(
            b"event: message_start\ndata: {\"type\":\"message_start\"}\n\n".to_vec(),
        )];
        let mut decoder = SseDecoder::new(build_body(chunks));
        let event = decoder.next().await.expect("event").expect("ok");
        assert_eq!(
            event,
            SseEvent::Frame {
                event: Some("message_start".to_string()),
                data: "{\"type\":\"message_start\"}".to_string()
            }
        );
    }

    /// 单个事件被任意切分时仍应完整重组
    #[tokio::test]
    async fn decoder_reassembles_frames_split_across_chunks() {
        let chunks = vec![
            Ok(b"event: content_block".to_vec()),
            Ok(b"_delta\nda".to_vec()),
            Ok(b"ta: {\"a\":1}\n".to_vec()),
            Ok(b"\n".to_vec()),
        ];
        let mut decoder = SseDecoder::new(build_body(chunks));
        let event = decoder.next().await.expect("event").expect("ok");
        assert_eq!(
            event,
            SseEvent::Frame {
                event: Some("content_block_delta".to_string()),
                data: "{\"a\":1}".to_string()
            }
        );
    }

    #[tokio::test]
    async fn decoder_combines_multiline_payloads() {
        let chunks = vec![
            Ok(b"data: line one\n".to_vec()),
            Ok(b"data: line two\n\n".to_vec()),
        ];
        let mut decoder = SseDecoder::new(build_body(chunks));
        let event = decoder.next().await.expect("event").expect("ok");
        assert_eq!(
            event,
            SseEvent::Frame {
                event: None,
                data: "line one\nline two".to_string()
            }
        );
        assert!(decoder.next().await.is_none());
    }

    #[tokio::test]
    async fn decoder_reports_utf8_errors() {
        let chunks = vec![Ok(b"data: \xff\n\n".to_vec())];
        let mut decoder = SseDecoder::new(build_body(chunks));
        let err = decoder.next().await.expect("event").unwrap_err();
        assert!(matches!(err, LLMError::Other { .. }));
    }
}
