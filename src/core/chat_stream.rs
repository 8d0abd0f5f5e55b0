//! Decoding of the server-sent-event stream returned by a streaming
//! completion request.
//!
//! The transport hands over raw byte chunks with arbitrary boundaries. The
//! parser buffers them, cuts complete lines on `\n`, and turns every
//! `data:` line into a [`StreamFrame`]. A `[DONE]` payload ends the stream;
//! anything after it is ignored.

use memchr::memchr;

use crate::api::ChatResponse;
use crate::core::error::{MimicError, Result};

const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// Incremental content from the first choice. Empty when the frame
    /// carried no content (role announcements, finish markers).
    Delta(String),
    /// A line that could not be decoded, carrying the display text of the
    /// [`MimicError::FrameParse`] it produced. The stream keeps going.
    Malformed(String),
    /// The `[DONE]` sentinel.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    Streaming,
    Done,
    /// The byte stream ended without a `[DONE]` sentinel.
    Errored,
}

#[derive(Debug)]
pub struct StreamFrameParser {
    buffer: Vec<u8>,
    state: ParserState,
}

impl Default for StreamFrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamFrameParser {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            state: ParserState::Streaming,
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == ParserState::Done
    }

    /// Feed one chunk of bytes and return the frames completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamFrame> {
        if self.state != ParserState::Streaming {
            return Vec::new();
        }

        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(newline_pos) = memchr(b'\n', &self.buffer) {
            let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            if self.process_line(&line[..newline_pos], &mut frames) {
                self.buffer.clear();
                break;
            }
        }

        frames
    }

    /// Signal that the transport has no more bytes.
    ///
    /// A trailing line without a newline is still decoded. If no `[DONE]`
    /// was seen the parser moves to [`ParserState::Errored`].
    pub fn finish(&mut self) -> Vec<StreamFrame> {
        let mut frames = Vec::new();
        if self.state != ParserState::Streaming {
            return frames;
        }

        let rest = std::mem::take(&mut self.buffer);
        if !rest.is_empty() {
            self.process_line(&rest, &mut frames);
        }

        if self.state == ParserState::Streaming {
            self.state = ParserState::Errored;
        }
        frames
    }

    /// Returns true once the sentinel has been seen.
    fn process_line(&mut self, raw: &[u8], frames: &mut Vec<StreamFrame>) -> bool {
        let line = match std::str::from_utf8(raw) {
            Ok(line) => line.trim(),
            Err(e) => {
                let error = MimicError::FrameParse(format!("Invalid UTF-8 in stream: {e}"));
                frames.push(StreamFrame::Malformed(error.to_string()));
                return false;
            }
        };

        if line.is_empty() || line.starts_with(':') {
            return false;
        }

        let payload = extract_data_payload(line);
        if payload == DONE_SENTINEL {
            self.state = ParserState::Done;
            frames.push(StreamFrame::Done);
            return true;
        }

        let frame = decode_payload(payload).unwrap_or_else(|e| StreamFrame::Malformed(e.to_string()));
        frames.push(frame);
        false
    }
}

fn extract_data_payload(line: &str) -> &str {
    line.strip_prefix("data:")
        .map(str::trim_start)
        .unwrap_or(line)
}

fn decode_payload(payload: &str) -> Result<StreamFrame> {
    match serde_json::from_str::<ChatResponse>(payload) {
        Ok(response) => {
            let content = response
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.delta.content)
                .unwrap_or_default();
            Ok(StreamFrame::Delta(content))
        }
        Err(parse_error) => {
            let summary = serde_json::from_str::<serde_json::Value>(payload)
                .ok()
                .and_then(|value| extract_error_summary(&value));
            Err(MimicError::FrameParse(match summary {
                Some(summary) => format!("API Error: {summary}"),
                None => format!("Could not parse response from the API: {parse_error}"),
            }))
        }
    }
}

/// Pull a one-line message out of an API error body, if it has one.
pub(crate) fn extract_error_summary(value: &serde_json::Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            value
                .get("error")
                .and_then(|v| v.as_str().map(str::to_owned))
        })
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str().map(str::to_owned))
        })?;

    let collapsed = summary.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// Describe a non-success HTTP response body for display on a message.
pub(crate) fn format_api_error(status: u16, body: &str) -> String {
    let trimmed = body.trim();
    let summary = serde_json::from_str::<serde_json::Value>(trimmed)
        .ok()
        .and_then(|value| extract_error_summary(&value));

    match summary {
        Some(summary) => format!("API Error ({status}): {summary}"),
        None if trimmed.is_empty() => format!("API Error ({status})"),
        None => format!("API Error ({status}): {trimmed}"),
    }
}
