//! Outbound event framer
//!
//! The sink turns each [`OutboundEvent`] into one `data: <json>\n\n` frame and
//! hands it to the HTTP response body over a bounded channel. One event is one
//! frame is one body chunk; nothing is batched.

use std::convert::Infallible;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::events::OutboundEvent;
use crate::stage::decoder::DATA_PREFIX;

/// Default number of frames buffered between a session and its response body
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Item type of the response body stream
pub type Frame = Result<Bytes, Infallible>;

/// Errors writing to the client
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Client disconnected")]
    Disconnected,

    #[error("Stream already terminated, refusing {node} event")]
    Terminated { node: String },

    #[error("Failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Encode one event as a complete frame
pub fn encode_frame(event: &OutboundEvent<'_>) -> Result<Bytes, serde_json::Error> {
    let json = serde_json::to_string(event)?;
    Ok(Bytes::from(format!("{}{}\n\n", DATA_PREFIX, json)))
}

/// Write half of a session's event stream
pub struct EventSink {
    tx: mpsc::Sender<Frame>,
    terminated: bool,
    frames_sent: usize,
}

impl EventSink {
    /// Create a sink and the receiver feeding the response body
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        debug!(capacity, "EventSink::channel: called");
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self {
            tx,
            terminated: false,
            frames_sent: 0,
        };
        (sink, rx)
    }

    /// Frame and send one event, waiting for channel capacity
    ///
    /// After a terminal event (`error` or `done`) every further send is
    /// refused, so the terminal event is always the last one on the stream.
    pub async fn send(&mut self, event: &OutboundEvent<'_>) -> Result<(), SinkError> {
        if self.terminated {
            return Err(SinkError::Terminated { node: event.node() });
        }
        let frame = encode_frame(event)?;
        self.tx.send(Ok(frame)).await.map_err(|_| {
            debug!(node = %event.node(), "EventSink::send: receiver dropped");
            SinkError::Disconnected
        })?;
        self.frames_sent += 1;
        if event.is_terminal() {
            self.terminated = true;
        }
        Ok(())
    }

    /// Resolves once the client side of the stream is gone
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// True once a terminal event has been written
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn frames_sent(&self) -> usize {
        self.frames_sent
    }
}
