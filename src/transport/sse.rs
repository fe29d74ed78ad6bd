//! Incremental parser for `text/event-stream` bodies.

use crate::codec::MAX_FRAME_SIZE;
use crate::error::{Result, TransportError};

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    /// Resumption id, sent back as `Last-Event-ID` on reconnect.
    pub id: Option<String>,
    /// Event type; `message` when the server omits it.
    pub event: String,
    pub data: String,
}

/// Line-oriented parser fed with arbitrary byte chunks.
///
/// An unterminated line, or the data of one pending event, larger than the
/// limit is a protocol error; the parser resets and the caller should
/// reconnect.
#[derive(Debug)]
pub struct SseParser {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already searched for a line break.
    scanned: usize,
    max_size: usize,
    id: Option<String>,
    event: Option<String>,
    data: Vec<String>,
    data_len: usize,
    retry_ms: Option<u64>,
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SseParser {
    pub fn new() -> Self {
        Self::with_limit(MAX_FRAME_SIZE)
    }

    pub fn with_limit(max_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_size,
            id: None,
            event: None,
            data: Vec::new(),
            data_len: 0,
            retry_ms: None,
        }
    }

    /// Last `retry:` hint seen from the server.
    pub fn retry_ms(&self) -> Option<u64> {
        self.retry_ms
    }

    /// Consume a chunk and return every event it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        let mut start = 0;

        while let Some(offset) = self.buffer[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + offset;
            let mut line = &self.buffer[start..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            let line = String::from_utf8_lossy(line).into_owned();
            start = end + 1;
            self.scanned = start;

            match self.process_line(&line) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => {
                    self.reset();
                    return Err(e);
                }
            }
        }

        self.buffer.drain(..start);
        self.scanned = self.buffer.len();
        if self.buffer.len() > self.max_size {
            let len = self.buffer.len();
            self.reset();
            return Err(TransportError::Protocol(format!(
                "event stream line of {len} bytes exceeds limit of {}",
                self.max_size
            )));
        }
        Ok(events)
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
        self.id = None;
        self.event = None;
        self.data.clear();
        self.data_len = 0;
    }

    fn process_line(&mut self, line: &str) -> Result<Option<SseEvent>> {
        if line.is_empty() {
            return Ok(self.dispatch());
        }
        if line.starts_with(':') {
            return Ok(None);
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "id" => self.id = Some(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "data" => {
                self.data_len += value.len() + 1;
                if self.data_len > self.max_size {
                    return Err(TransportError::Protocol(format!(
                        "event stream event exceeds limit of {} bytes",
                        self.max_size
                    )));
                }
                self.data.push(value.to_string());
            }
            "retry" => self.retry_ms = value.parse().ok(),
            _ => {}
        }
        Ok(None)
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        let id = self.id.take();
        if self.data.is_empty() && event.is_none() {
            return None;
        }

        self.data_len = 0;
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            id,
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}
