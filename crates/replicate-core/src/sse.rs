//! Incremental `text/event-stream` decoding.
//!
//! Chunks may split lines, or UTF-8 sequences, at any byte. Frames are
//! dispatched on a blank line.

use std::collections::VecDeque;
use std::fmt::Display;

use futures::stream::{self, BoxStream, Stream, StreamExt};

use crate::job::StreamEvent;

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

impl Frame {
    /// Map the frame onto a job event. Unknown event names yield `None`.
    pub fn into_event(self) -> Option<StreamEvent> {
        match self.event.as_str() {
            "output" => Some(StreamEvent::Output(self.data)),
            "logs" => Some(StreamEvent::Logs(self.data)),
            "done" => Some(StreamEvent::Done),
            "error" => Some(StreamEvent::Error(self.data)),
            _ => None,
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

    /// Consume a chunk and return every frame it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if let Some(frame) = self.line(&String::from_utf8_lossy(&line)) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush a trailing unterminated line and any pending frame at end of input.
    pub fn finish(&mut self) -> Option<Frame> {
        if !self.buffer.is_empty() {
            let mut line = std::mem::take(&mut self.buffer);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if let Some(frame) = self.line(&String::from_utf8_lossy(&line)) {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    fn line(&mut self, line: &str) -> Option<Frame> {
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

    fn dispatch(&mut self) -> Option<Frame> {
        let event = self.event.take();
        let id = self.id.take();
        if event.is_none() && self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(Frame {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
            id,
        })
    }
}

struct DecodeState<B, E> {
    inner: BoxStream<'static, Result<B, E>>,
    decoder: SseDecoder,
    pending: VecDeque<StreamEvent>,
    finished: bool,
}

/// Turn a byte stream into job events.
///
/// A transport error becomes a final [`StreamEvent::Error`]. The returned
/// stream ends when the input ends, whether or not `done` was seen.
pub fn decode_events<S, B, E>(bytes: S) -> BoxStream<'static, StreamEvent>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = DecodeState {
        inner: bytes.boxed(),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((event, state));
            }
            if state.finished {
                return None;
            }
            match state.inner.next().await {
                Some(Ok(chunk)) => {
                    let frames = state.decoder.feed(chunk.as_ref());
                    state
                        .pending
                        .extend(frames.into_iter().filter_map(Frame::into_event));
                }
                Some(Err(err)) => {
                    state.finished = true;
                    state.pending.push_back(StreamEvent::Error(err.to_string()));
                }
                None => {
                    state.finished = true;
                    state
                        .pending
                        .extend(state.decoder.finish().and_then(Frame::into_event));
                }
            }
        }
    })
    .boxed()
}
