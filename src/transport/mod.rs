//! Transport abstraction for the live query client.
//!
//! A [`Transport`] owns exactly one socket connection and knows nothing about
//! the protocol spoken over it. It reports everything that happens on the
//! connection (open, inbound text frame, close, error) through the single
//! [`TransportEvents`] handle it was created with.
//!
//! # Architecture
//!
//! ```text
//!   LiveQueryClient ── TransportFactory::create(endpoint, events) ──► Transport
//!         ▲                                                              │
//!         │            TaggedEvent { generation, event }                 │
//!         └──────────────── mpsc::UnboundedReceiver ◄────────────────────┘
//! ```
//!
//! Every transport is created with its own generation number. The client
//! replaces transports wholesale on reconnect and drops events that carry a
//! generation other than the current one.

pub mod websocket;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

pub use websocket::{WebSocketTransport, WebSocketTransportFactory};

/// Lifecycle state of a single transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    /// Created, `open` not yet started.
    #[default]
    None,
    /// Handshake in flight.
    Connecting,
    /// Open and able to send.
    Connected,
    /// `close` in progress.
    Disconnecting,
    /// Closed (by either side).
    Disconnected,
    /// Failed; terminal.
    Error,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Something that happened on a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is open.
    Opened,
    /// One inbound text frame.
    Message(String),
    /// The connection closed.
    Closed {
        /// WebSocket close code (1000 = normal, 1006 = abnormal).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
    /// A transport-level failure; the connection is unusable.
    Error(String),
}

/// A [`TransportEvent`] tagged with the generation of the transport that
/// produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedEvent {
    /// Generation of the emitting transport.
    pub generation: u64,
    /// The event payload.
    pub event: TransportEvent,
}

/// Receiving end of a transport event stream.
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TaggedEvent>;

/// Handle a transport uses to report events to its single consumer.
///
/// Emitting never blocks. If the consumer is gone the event is dropped.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl TransportEvents {
    /// Create a handle for `generation` that sends into `tx`.
    #[must_use]
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<TaggedEvent>) -> Self {
        Self { generation, tx }
    }

    /// Create a handle together with a fresh receiver.
    #[must_use]
    pub fn channel(generation: u64) -> (Self, TransportEventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(generation, tx), rx)
    }

    /// Generation this handle reports for.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report that the connection opened.
    pub fn opened(&self) {
        self.emit(TransportEvent::Opened);
    }

    /// Report an inbound text frame.
    pub fn message(&self, text: String) {
        self.emit(TransportEvent::Message(text));
    }

    /// Report that the connection closed.
    pub fn closed(&self, code: u16, reason: impl Into<String>) {
        self.emit(TransportEvent::Closed {
            code,
            reason: reason.into(),
        });
    }

    /// Report a transport failure.
    pub fn error(&self, message: impl Into<String>) {
        self.emit(TransportEvent::Error(message.into()));
    }

    fn emit(&self, event: TransportEvent) {
        let tagged = TaggedEvent {
            generation: self.generation,
            event,
        };
        if self.tx.send(tagged).is_err() {
            log::trace!(
                "[Transport] Event consumer gone, dropping event (generation={})",
                self.generation
            );
        }
    }
}

/// One socket connection.
///
/// `open` completes when the connection attempt finishes; the outcome is also
/// reported through [`TransportEvents`]. `send` fails with
/// [`LiveQueryError::Transport`](crate::LiveQueryError::Transport) whenever
/// the transport is not [`TransportState::Connected`].
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Open the connection.
    async fn open(&self) -> Result<()>;

    /// Close the connection, cancelling an in-flight open or receive loop.
    async fn close(&self);

    /// Send one text frame.
    async fn send(&self, frame: &str) -> Result<()>;

    /// Current lifecycle state.
    fn state(&self) -> TransportState;
}

/// Builds a fresh [`Transport`] for every (re)connect.
pub trait TransportFactory: Send + Sync + fmt::Debug {
    /// Create an unopened transport for `endpoint` reporting into `events`.
    fn create(&self, endpoint: &str, events: TransportEvents) -> Arc<dyn Transport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_are_tagged_with_generation() {
        let (events, mut rx) = TransportEvents::channel(7);
        events.opened();
        events.message("{\"op\":\"connected\"}".to_string());
        events.closed(1000, "bye");

        let first = rx.recv().await.expect("opened event");
        assert_eq!(first.generation, 7);
        assert_eq!(first.event, TransportEvent::Opened);

        let second = rx.recv().await.expect("message event");
        assert_eq!(
            second.event,
            TransportEvent::Message("{\"op\":\"connected\"}".to_string())
        );

        let third = rx.recv().await.expect("closed event");
        assert_eq!(
            third.event,
            TransportEvent::Closed {
                code: 1000,
                reason: "bye".to_string()
            }
        );
    }

    #[test]
    fn test_emit_without_consumer_does_not_panic() {
        let (events, rx) = TransportEvents::channel(1);
        drop(rx);
        events.error("gone");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(TransportState::Connected.to_string(), "connected");
        assert_eq!(TransportState::default(), TransportState::None);
    }
}
