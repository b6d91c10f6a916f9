//! Byte-level decoding utilities shared by the streaming protocol parsers.
//!
//! These helpers are deliberately dumb: they split chunks into strings, lines
//! or JSON values without interpreting any protocol semantics. The SSE
//! `event:`/`data:` framing lives in [`crate::sse`].

use serde_json::Value;

/// Incremental UTF-8 decoder that tolerates chunk boundaries splitting
/// multi-byte sequences.
///
/// Trailing incomplete sequences are buffered until the next chunk arrives;
/// `flush` drains whatever remains at end of stream. For input that is valid
/// UTF-8 once concatenated, the emitted strings concatenate to exactly the
/// decoded input, never containing replacement characters from split code
/// points.
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    pending: Vec<u8>,
}

impl Utf8StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes the next chunk, returning all complete characters seen so far.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let boundary = complete_utf8_boundary(&self.pending);
        let rest = self.pending.split_off(boundary);
        let complete = std::mem::replace(&mut self.pending, rest);
        String::from_utf8_lossy(&complete).into_owned()
    }

    /// Flushes buffered bytes at end of stream.
    ///
    /// An incomplete trailing sequence decodes lossily at this point; the
    /// stream ended mid-character and there is nothing better to emit.
    pub fn flush(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&pending).into_owned()
    }
}

/// Returns the length of the longest prefix of `bytes` that does not end in a
/// partial multi-byte sequence.
fn complete_utf8_boundary(bytes: &[u8]) -> usize {
    let len = bytes.len();
    // A UTF-8 sequence is at most 4 bytes; only the tail can be incomplete.
    let scan_from = len.saturating_sub(3);
    for idx in (scan_from..len).rev() {
        let byte = bytes[idx];
        let width = match byte {
            b if b & 0b1000_0000 == 0 => 1,
            b if b & 0b1110_0000 == 0b1100_0000 => 2,
            b if b & 0b1111_0000 == 0b1110_0000 => 3,
            b if b & 0b1111_1000 == 0b1111_0000 => 4,
            // continuation byte, keep scanning backwards
            _ => continue,
        };
        if idx + width > len {
            return idx;
        }
        return len;
    }
    len
}

/// Accumulates byte chunks and yields complete `\n`-terminated lines.
///
/// Carriage returns preceding the newline are stripped. The trailing partial
/// line is retained across calls and exposed through
/// [`SseLineBuffer::take_partial`] at end of stream. No `data:`/`event:`
/// interpretation happens here.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every line completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }

    /// Takes the buffered partial line, if any.
    pub fn take_partial(&mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}

/// Splits a byte stream into one JSON value per `\n`-terminated line.
///
/// Blank lines are skipped; undecodable lines are reported so the caller can
/// log and drop them without killing the stream (Ollama's wire format).
#[derive(Debug, Default)]
pub struct JsonLinesDecoder {
    lines: SseLineBuffer,
    utf8: Utf8StreamDecoder,
}

/// One decoded line, or the raw text of a line that failed to parse.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonLine {
    Value(Value),
    Undecodable(String),
}

impl JsonLinesDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<JsonLine> {
        self.lines
            .push(chunk)
            .into_iter()
            .filter_map(|line| Self::decode_line(&mut self.utf8, line))
            .collect()
    }

    /// Flushes a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<JsonLine> {
        let line = self.lines.take_partial()?;
        Self::decode_line(&mut self.utf8, line)
    }

    fn decode_line(utf8: &mut Utf8StreamDecoder, line: Vec<u8>) -> Option<JsonLine> {
        let mut text = utf8.decode(&line);
        text.push_str(&utf8.flush());
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        match serde_json::from_str(trimmed) {
            Ok(value) => Some(JsonLine::Value(value)),
            Err(_) => Some(JsonLine::Undecodable(trimmed.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// 任意切分点下的 UTF-8 解码结果必须与整体解码一致
    #[test]
    fn utf8_decoder_handles_split_code_points() {
        let text = "日本語 and emoji 🦊 mixed";
        let bytes = text.as_bytes();
        for split in 0..bytes.len() {
            let mut decoder = Utf8StreamDecoder::new();
            let mut out = decoder.decode(&bytes[..split]);
            out.push_str(&decoder.decode(&bytes[split..]));
            out.push_str(&decoder.flush());
            assert_eq!(out, text, "split at byte {split}");
            assert!(!out.contains('\u{FFFD}'));
        }
    }

    #[test]
    fn utf8_decoder_single_byte_chunks() {
        let text = "🦊🦊";
        let mut decoder = Utf8StreamDecoder::new();
        let mut out = String::new();
        for byte in text.as_bytes() {
            out.push_str(&decoder.decode(&[*byte]));
        }
        out.push_str(&decoder.flush());
        assert_eq!(out, text);
    }

    #[test]
    fn line_buffer_splits_lines_and_keeps_partial() {
        let mut buffer = SseLineBuffer::new();
        let lines = buffer.push(b"one\r\ntwo\nthr");
        assert_eq!(lines, vec![b"one".to_vec(), b"two".to_vec()]);
        let lines = buffer.push(b"ee\n");
        assert_eq!(lines, vec![b"three".to_vec()]);
        assert_eq!(buffer.take_partial(), None);

        let lines = buffer.push(b"tail");
        assert!(lines.is_empty());
        assert_eq!(buffer.take_partial(), Some(b"tail".to_vec()));
    }

    #[test]
    fn json_lines_decoder_skips_blanks_and_reports_garbage() {
        let mut decoder = JsonLinesDecoder::new();
        let decoded = decoder.push(b"{\"a\":1}\n\nnot json\n{\"b\":");
        assert_eq!(
            decoded,
            vec![
                JsonLine::Value(json!({"a": 1})),
                JsonLine::Undecodable("not json".to_string()),
            ]
        );
        let decoded = decoder.push(b"2}\n");
        assert_eq!(decoded, vec![JsonLine::Value(json!({"b": 2}))]);
        assert_eq!(decoder.finish(), None);
    }
}
