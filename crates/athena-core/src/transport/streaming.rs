//! Server-Sent Events parsing for streaming chat completions

use futures_core::Stream;
use serde::Deserialize;

use super::types::{FinishReason, MessageRole};
use crate::error::{Error, Result};

/// A delta update in a streaming response
#[derive(Debug, Clone, Deserialize)]
pub struct StreamDelta {
    /// Only present in the first chunk
    pub role: Option<MessageRole>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub index: usize,
    pub delta: StreamDelta,
    pub finish_reason: Option<FinishReason>,
}

/// A chunk from a streaming response
///
/// Providers disagree on which envelope fields they send, so everything but
/// the choices is optional.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<StreamChoice>,
}

impl StreamChunk {
    /// Content fragment carried by this chunk
    pub fn content(&self) -> Option<&str> {
        self.choices.first()?.delta.content.as_deref()
    }

    /// Whether this is the final chunk
    pub fn is_done(&self) -> bool {
        self.choices
            .first()
            .and_then(|c| c.finish_reason.as_ref())
            .is_some()
    }

    pub fn finish_reason(&self) -> Option<&FinishReason> {
        self.choices.first()?.finish_reason.as_ref()
    }
}

/// Event from streaming response parsing
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Chunk(StreamChunk),
    Done,
    Error(String),
}

/// Parse a Server-Sent Events line into a StreamEvent
pub fn parse_sse_line(line: &str) -> Option<StreamEvent> {
    let line = line.trim();

    // Skip empty lines and comments
    if line.is_empty() || line.starts_with(':') {
        return None;
    }

    if line == "data: [DONE]" {
        return Some(StreamEvent::Done);
    }

    if let Some(data) = line.strip_prefix("data: ") {
        match serde_json::from_str::<StreamChunk>(data) {
            Ok(chunk) => Some(StreamEvent::Chunk(chunk)),
            Err(e) => Some(StreamEvent::Error(format!("Failed to parse chunk: {}", e))),
        }
    } else {
        None
    }
}

/// Splits a byte stream into SSE lines
///
/// Bytes are held until a full line arrives, so a multi-byte character
/// split across network chunks is decoded intact.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network chunk; returns the events of every completed line
    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        self.pending.extend_from_slice(bytes);

        let mut events = Vec::new();
        let mut consumed = 0;
        while let Some(offset) = self.pending[consumed..].iter().position(|b| *b == b'\n') {
            let line = &self.pending[consumed..consumed + offset];
            if let Some(event) = parse_sse_line(&String::from_utf8_lossy(line)) {
                events.push(event);
            }
            consumed += offset + 1;
        }
        self.pending.drain(..consumed);
        events
    }

    /// Parse whatever remains after the stream ends
    pub fn finish(&mut self) -> Option<StreamEvent> {
        let rest = std::mem::take(&mut self.pending);
        parse_sse_line(&String::from_utf8_lossy(&rest))
    }
}

/// Turn a streaming HTTP response into parsed SSE events
pub fn sse_events(response: reqwest::Response) -> impl Stream<Item = Result<StreamEvent>> {
    async_stream::stream! {
        let mut bytes_stream = response.bytes_stream();
        let mut lines = SseLineBuffer::new();

        use futures_util::StreamExt;

        while let Some(chunk_result) = bytes_stream.next().await {
            match chunk_result {
                Ok(bytes) => {
                    for event in lines.push(&bytes) {
                        yield Ok(event);
                    }
                }
                Err(e) => {
                    yield Err(Error::NetworkError(e));
                    break;
                }
            }
        }

        if let Some(event) = lines.finish() {
            yield Ok(event);
        }
    }
}
