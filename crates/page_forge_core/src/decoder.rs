//! crates/page_forge_core/src/decoder.rs
//!
//! Turns a chunked byte stream into discrete `(event, payload)` records.
//!
//! Frames are separated by a blank line. Each frame carries an `event:` line and
//! a `data:` line whose remainder is a flat JSON object. Fragment boundaries are
//! meaningless: bytes are buffered until a full delimiter-terminated frame exists,
//! so a frame (or a multi-byte character) split across reads decodes the same as
//! one delivered whole. A malformed frame is dropped on its own; it never ends the
//! stream or disturbs the buffer.

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde_json::{Map, Value};
use std::fmt::Display;
use tokio_util::codec::Decoder;
use tracing::{debug, warn};

pub const EVENT_MARKER: &str = "event:";
pub const DATA_MARKER: &str = "data:";
const LF_DELIMITER: &[u8] = b"\n\n";
const CRLF_DELIMITER: &[u8] = b"\r\n\r\n";

/// One decoded frame. The decoder knows nothing about event names.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub name: String,
    pub payload: Map<String, Value>,
}

/// Stream-level failures. Per-frame problems are not errors; they are dropped.
///
/// A non-success response never reaches the decoder; the transport reports it
/// as `PortError::Status` when the stream is opened.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Transport failed: {0}")]
    Transport(String),

    #[error("Malformed payload for '{event}' event: {source}")]
    Payload {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

//=========================================================================================
// Frame codec
//=========================================================================================

/// Frame splitter, usable directly with `tokio_util::codec::FramedRead`.
///
/// Frames end at a blank line, written either as `\n\n` or as `\r\n\r\n`.
/// The codec remembers how far it has already searched the buffer, so each new
/// fragment is scanned once.
#[derive(Debug, Default, Clone)]
pub struct FrameCodec {
    /// No delimiter starts before this offset of the buffer.
    scanned: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Splits complete frames off the front of `buf` until one decodes.
    fn next_event(&mut self, buf: &mut BytesMut) -> Option<RawEvent> {
        while let Some((end, delimiter)) = find_delimiter(buf, self.scanned) {
            let frame = buf.split_to(end + delimiter);
            self.scanned = 0;
            if let Some(event) = parse_frame(&frame[..end]) {
                return Some(event);
            }
        }
        // A delimiter may still begin in the last few bytes once more arrive.
        self.scanned = buf.len().saturating_sub(CRLF_DELIMITER.len() - 1);
        None
    }

    fn discard_tail(&mut self, buf: &mut BytesMut) {
        if !buf.is_empty() {
            debug!(bytes = buf.len(), "Discarding undelimited tail at end of stream");
            buf.clear();
        }
        self.scanned = 0;
    }
}

impl Decoder for FrameCodec {
    type Item = RawEvent;
    type Error = StreamError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RawEvent>, StreamError> {
        Ok(self.next_event(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<RawEvent>, StreamError> {
        if let Some(event) = self.next_event(buf) {
            return Ok(Some(event));
        }
        self.discard_tail(buf);
        Ok(None)
    }
}

/// Finds the first frame delimiter at or after `from`: its offset and length.
fn find_delimiter(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    (from..buf.len()).find_map(|i| {
        let rest = &buf[i..];
        if rest.starts_with(LF_DELIMITER) {
            Some((i, LF_DELIMITER.len()))
        } else if rest.starts_with(CRLF_DELIMITER) {
            Some((i, CRLF_DELIMITER.len()))
        } else {
            None
        }
    })
}

fn parse_frame(frame: &[u8]) -> Option<RawEvent> {
    let text = match std::str::from_utf8(frame) {
        Ok(text) => text.trim_start_matches(['\r', '\n']),
        Err(e) => {
            warn!(error = %e, "Dropping frame that is not valid UTF-8");
            return None;
        }
    };
    if text.trim().is_empty() {
        return None;
    }

    let mut lines = text.split('\n').map(|line| line.strip_suffix('\r').unwrap_or(line));
    let (Some(event_line), Some(data_line)) = (lines.next(), lines.next()) else {
        warn!(frame = text, "Dropping frame without an event and a data line");
        return None;
    };

    let name = match event_line.strip_prefix(EVENT_MARKER).map(str::trim) {
        Some(name) if !name.is_empty() => name,
        _ => {
            warn!(line = event_line, "Dropping frame with a malformed event line");
            return None;
        }
    };
    let Some(data) = data_line.strip_prefix(DATA_MARKER).map(str::trim) else {
        warn!(event = name, line = data_line, "Dropping frame with a malformed data line");
        return None;
    };

    match serde_json::from_str::<Value>(data) {
        Ok(Value::Object(payload)) => Some(RawEvent {
            name: name.to_string(),
            payload,
        }),
        Ok(_) => {
            warn!(event = name, "Dropping event whose payload is not a key-value record");
            None
        }
        Err(e) => {
            warn!(event = name, error = %e, "Failed to parse event payload; dropping event");
            None
        }
    }
}

//=========================================================================================
// Push-style decoder
//=========================================================================================

/// Buffers fragments of one stream and hands back every event they complete.
///
/// Create one per stream; instances share nothing.
#[derive(Debug, Default)]
pub struct EventDecoder {
    codec: FrameCodec,
    buffer: BytesMut,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a fragment and returns the events it completed, in order.
    pub fn push(&mut self, fragment: impl AsRef<[u8]>) -> Vec<RawEvent> {
        self.buffer.extend_from_slice(fragment.as_ref());
        let mut events = Vec::new();
        while let Some(event) = self.codec.next_event(&mut self.buffer) {
            events.push(event);
        }
        events
    }

    /// Number of bytes waiting for a delimiter.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Ends the stream. An undelimited tail was never a complete event and is dropped.
    pub fn finish(mut self) {
        self.codec.discard_tail(&mut self.buffer);
    }
}

//=========================================================================================
// Lazy stream adapter
//=========================================================================================

/// Decodes a transport byte stream lazily.
///
/// A transport error is yielded once as `StreamError::Transport` and ends the
/// stream. A normal end of input simply ends it.
pub fn decode_stream<S, E>(chunks: S) -> impl Stream<Item = Result<RawEvent, StreamError>>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    async_stream::stream! {
        let mut decoder = EventDecoder::new();
        futures::pin_mut!(chunks);
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(bytes) => {
                    for event in decoder.push(&bytes) {
                        yield Ok(event);
                    }
                }
                Err(e) => {
                    yield Err(StreamError::Transport(e.to_string()));
                    break;
                }
            }
        }
        decoder.finish();
    }
}
