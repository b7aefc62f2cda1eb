//! Server-sent events decoding for chat completion streams.
//!
//! Bytes arrive in arbitrary slices; only the unfinished line is buffered,
//! and that line is capped at [`MAX_LINE_BYTES`]. Each `data:` line of an
//! OpenAI-style stream is one complete JSON event.

use serde::Deserialize;

use nosrelay_core::error::{Error, Result};

/// Longest unfinished line held before the stream is rejected.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Splits a byte stream into SSE `data` payloads.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    max_line: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_line,
        }
    }

    /// Append newly received bytes.
    ///
    /// Fails with `UpstreamProtocol` once the unfinished line outgrows the
    /// cap; a body without line breaks is not an event stream.
    pub fn push(&mut self, bytes: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(bytes);
        let unfinished = match self.buffer.iter().rposition(|b| *b == b'\n') {
            Some(last_newline) => self.buffer.len() - last_newline - 1,
            None => self.buffer.len(),
        };
        if unfinished > self.max_line {
            self.buffer.clear();
            return Err(Error::protocol(format!(
                "stream line exceeds {} bytes",
                self.max_line
            )));
        }
        Ok(())
    }

    /// Bytes held for an unfinished line.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// The next complete `data` payload, if one is buffered.
    pub fn next_data(&mut self) -> Option<String> {
        while let Some(line_end) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=line_end).collect();
            if let Some(data) = data_payload(&line) {
                return Some(data);
            }
        }
        None
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buffer);
        data_payload(&line)
    }
}

fn data_payload(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches(['\n', '\r']);

    // Skip empty lines, SSE comments and the `event:`/`id:`/`retry:` fields
    let data = line.strip_prefix("data:")?;
    Some(data.strip_prefix(' ').unwrap_or(data).to_string())
}

/// A decoded stream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Text delta (may be empty for role-only or finish events)
    Delta(Option<String>),
    /// `[DONE]` sentinel
    Done,
}

/// Interpret one `data` payload.
pub fn parse_event(data: &str) -> Result<StreamEvent> {
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(StreamEvent::Done);
    }

    let parsed: StreamResponse = serde_json::from_str(data)
        .map_err(|e| Error::protocol(format!("unparseable stream event: {e}")))?;

    if let Some(error) = parsed.error {
        return Err(Error::protocol(error.message));
    }

    Ok(StreamEvent::Delta(
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content),
    ))
}

// --- Streaming SSE types ---

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// `{"error": {"message": ...}}` as returned by OpenAI-compatible APIs.
#[derive(Debug, Deserialize)]
pub(crate) struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiErrorDetail {
    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_lines_across_pushes() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"data: {\"a\"").unwrap();
        assert_eq!(decoder.next_data(), None);
        decoder.push(b":1}\n\ndata: [DONE]\n\n").unwrap();
        assert_eq!(decoder.next_data().as_deref(), Some("{\"a\":1}"));
        assert_eq!(decoder.next_data().as_deref(), Some("[DONE]"));
        assert_eq!(decoder.next_data(), None);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn skips_comments_and_other_fields() {
        let mut decoder = SseDecoder::new();
        decoder.push(b": keep-alive\r\nevent: message\r\nid: 7\r\ndata: x\r\n").unwrap();
        assert_eq!(decoder.next_data().as_deref(), Some("x"));
    }

    #[test]
    fn multibyte_characters_split_across_pushes() {
        let text = "data: {\"choices\":[{\"delta\":{\"content\":\"é\"}}]}\n";
        let bytes = text.as_bytes();
        let split = text.find('é').unwrap() + 1;
        let mut decoder = SseDecoder::new();
        decoder.push(&bytes[..split]).unwrap();
        assert_eq!(decoder.next_data(), None);
        decoder.push(&bytes[split..]).unwrap();
        let data = decoder.next_data().unwrap();
        assert_eq!(
            parse_event(&data).unwrap(),
            StreamEvent::Delta(Some("é".into()))
        );
    }

    #[test]
    fn oversized_unterminated_line_is_protocol_error() {
        let mut decoder = SseDecoder::with_max_line(16);
        decoder.push(b"<html><body>").unwrap();
        let err = decoder.push(b"proxy error page").unwrap_err();
        assert_eq!(err.kind(), nosrelay_core::ErrorKind::UpstreamProtocol);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn long_body_of_short_lines_is_fine() {
        let mut decoder = SseDecoder::with_max_line(16);
        for _ in 0..100 {
            decoder.push(b"data: x\n\n").unwrap();
        }
        assert_eq!(decoder.next_data().as_deref(), Some("x"));
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"data: [DONE]").unwrap();
        assert_eq!(decoder.next_data(), None);
        assert_eq!(decoder.finish().as_deref(), Some("[DONE]"));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn parse_content_delta() {
        let data = r#"{"choices":[{"delta":{"content":"Hello"},"finish_reason":null}]}"#;
        assert_eq!(
            parse_event(data).unwrap(),
            StreamEvent::Delta(Some("Hello".into()))
        );
    }

    #[test]
    fn parse_finish_chunk_has_no_text() {
        let data = r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        assert_eq!(parse_event(data).unwrap(), StreamEvent::Delta(None));
    }

    #[test]
    fn parse_done_sentinel() {
        assert_eq!(parse_event(" [DONE] ").unwrap(), StreamEvent::Done);
    }

    #[test]
    fn garbage_is_protocol_error() {
        let err = parse_event("<html>oops</html>").unwrap_err();
        assert_eq!(err.kind(), nosrelay_core::ErrorKind::UpstreamProtocol);
    }

    #[test]
    fn in_band_error_is_protocol_error() {
        let err = parse_event(r#"{"error":{"message":"overloaded"}}"#).unwrap_err();
        assert!(err.to_string().contains("overloaded"));
    }
}
