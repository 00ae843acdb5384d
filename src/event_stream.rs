//! Decoder for `text/event-stream` bodies.
//!
//! Bytes arrive in arbitrary chunks, so the decoder keeps the unfinished line
//! between pushes and only dispatches an event on the blank line that ends it.

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};

use crate::client::BoxedStream;

/// Name used when an event block carries no `event:` field
pub const DEFAULT_EVENT: &str = "message";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    /// Joined `data:` lines, `None` when the block had none
    pub data: Option<String>,
    pub id: Option<String>,
}

impl SseEvent {
    pub fn new(event: impl Into<String>, data: Option<String>) -> Self {
        Self {
            event: event.into(),
            data,
            id: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every event it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let mut line = &self.buffer[start..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            let line = String::from_utf8_lossy(line).into_owned();
            start = end + 1;

            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        self.buffer.drain(..start);
        events
    }

    /// Flush a trailing event that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let line = String::from_utf8_lossy(&std::mem::take(&mut self.buffer)).into_owned();
            if let Some(event) = self.process_line(line.trim_end_matches('\r')) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.event.is_none() && self.data.is_empty() {
            return None;
        }
        let data = if self.data.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.data).join("\n"))
        };
        Some(SseEvent {
            event: self
                .event
                .take()
                .unwrap_or_else(|| DEFAULT_EVENT.to_string()),
            data,
            id: self.id.take(),
        })
    }
}

/// Turn a response body into a stream of events, in arrival order.
pub fn decode<S, E>(body: S) -> BoxedStream<anyhow::Result<SseEvent>>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let events = body
        .map(Some)
        .chain(stream::iter([None]))
        .scan(SseDecoder::new(), |decoder, chunk| {
            let events: Vec<anyhow::Result<SseEvent>> = match chunk {
                Some(Ok(bytes)) => decoder.push(&bytes).into_iter().map(Ok).collect(),
                Some(Err(e)) => vec![Err(anyhow::Error::new(e))],
                None => decoder.finish().into_iter().map(Ok).collect(),
            };
            futures::future::ready(Some(events))
        })
        .flat_map(stream::iter);

    Box::pin(events)
}
