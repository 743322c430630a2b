use std::ops::ControlFlow;

use async_stream::try_stream;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;

use super::provider::{ProviderError, ProviderResult};

pub const FRAME_DELIMITER: u8 = b'\n';
pub const DATA_PREFIX: &str = "data:";
pub const TERMINATOR_PAYLOAD: &str = "[DONE]";

const CONTENT_FIELD: &str = "chunk";
const CONVERSATION_ID_FIELD: &str = "conversation_id";

/// One decoded unit of a streamed completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Delta { text: String },
    Completed { conversation_id: Option<i64> },
    Terminator,
}

/// Incremental decoder from raw body chunks to [`StreamEvent`]s.
///
/// Bytes are buffered until a frame delimiter arrives, so a frame split across
/// network reads (including inside a multi-byte character) is only interpreted
/// once it is complete. After a terminator all further input is ignored.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: Vec<u8>,
    /// Prefix of `pending` already known to hold no delimiter.
    scanned: usize,
    terminated: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Bytes of the incomplete trailing frame carried to the next chunk.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.terminated {
            return events;
        }

        self.pending.extend_from_slice(chunk);

        let mut consumed = 0;
        let mut search_from = self.scanned;
        while let Some(offset) = self.pending[search_from..]
            .iter()
            .position(|byte| *byte == FRAME_DELIMITER)
        {
            let frame_end = search_from + offset;
            let flow = decode_frame(&self.pending[consumed..frame_end], &mut events);
            consumed = frame_end + 1;
            search_from = consumed;

            if flow.is_break() {
                self.terminated = true;
                break;
            }
        }

        if self.terminated {
            self.pending.clear();
        } else {
            self.pending.drain(..consumed);
        }
        self.scanned = self.pending.len();

        events
    }

    /// Interprets the retained remainder as a final frame once the transport has ended.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        let remainder = std::mem::take(&mut self.pending);
        self.scanned = 0;
        if self.terminated || remainder.is_empty() {
            return events;
        }

        if decode_frame(&remainder, &mut events).is_break() {
            self.terminated = true;
        }
        events
    }
}

fn decode_frame(frame: &[u8], events: &mut Vec<StreamEvent>) -> ControlFlow<()> {
    let text = String::from_utf8_lossy(frame);
    let line = text.strip_suffix('\r').unwrap_or(&text);

    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return ControlFlow::Continue(());
    };
    let payload = payload.strip_prefix(' ').unwrap_or(payload);

    if payload == TERMINATOR_PAYLOAD {
        events.push(StreamEvent::Terminator);
        return ControlFlow::Break(());
    }

    let record = match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(record)) => record,
        Ok(other) => {
            tracing::trace!(payload = %other, "dropping stream frame without a JSON object");
            return ControlFlow::Continue(());
        }
        Err(error) => {
            // A bad frame never ends the stream.
            tracing::trace!(error = %error, frame_len = frame.len(), "dropping malformed stream frame");
            return ControlFlow::Continue(());
        }
    };

    if let Some(text) = record.get(CONTENT_FIELD).and_then(Value::as_str)
        && !text.is_empty()
    {
        events.push(StreamEvent::Delta {
            text: text.to_string(),
        });
    }

    if let Some(conversation_id) = record.get(CONVERSATION_ID_FIELD) {
        events.push(StreamEvent::Completed {
            conversation_id: conversation_id.as_i64(),
        });
    }

    ControlFlow::Continue(())
}

/// Adapts a byte chunk stream into a lazy event stream.
///
/// Stops after `Terminator`. A transport error is yielded as the final item.
pub fn decode_stream<S>(chunks: S) -> impl Stream<Item = ProviderResult<StreamEvent>> + Send
where
    S: Stream<Item = Result<Bytes, ProviderError>> + Send,
{
    try_stream! {
        let mut decoder = FrameDecoder::new();
        futures::pin_mut!(chunks);

        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            for event in decoder.push(&chunk) {
                yield event;
            }
            if decoder.is_terminated() {
                break;
            }
        }

        for event in decoder.finish() {
            yield event;
        }
    }
}
