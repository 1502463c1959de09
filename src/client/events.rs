//! Client-wide notifications.

use serde::Serialize;

use crate::protocol::EventKind;

/// Lifecycle and routing notifications published by a
/// [`LiveQueryClient`](super::LiveQueryClient).
///
/// Delivered on a hot broadcast channel: receivers only see events published
/// after they subscribed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    /// The server acknowledged `connect`; the session is established.
    Connected,
    /// The session ended.
    Disconnected {
        /// `true` when caused by [`LiveQueryClient::disconnect`](super::LiveQueryClient::disconnect).
        user_initiated: bool,
    },
    /// The server confirmed a subscription.
    Subscribed {
        /// Subscription id.
        request_id: u64,
    },
    /// The server confirmed a removal.
    Unsubscribed {
        /// Subscription id.
        request_id: u64,
    },
    /// An object event was routed to a subscription.
    ObjectEvent {
        /// Subscription id.
        request_id: u64,
        /// Kind of event.
        kind: EventKind,
    },
}
