//! Inbound side of the engine: transport events and server frames.
//!
//! One task consumes every [`TaggedEvent`] in arrival order, so frames from
//! one connection are handled strictly one after another. Events from a
//! transport that is no longer current are dropped.

use std::sync::atomic::Ordering;
use std::sync::Weak;

use super::{BoundTransport, ClientEvent, ClientInner};
use crate::error::{LiveQueryError, Result};
use crate::object::ObjectState;
use crate::protocol::{decode_frame, EventKind, JsonObject, ServerMessage};
use crate::transport::{TaggedEvent, TransportEvent, TransportEventReceiver};

/// Consume transport events until the client is dropped.
pub(super) async fn run(client: Weak<ClientInner>, mut rx: TransportEventReceiver) {
    while let Some(tagged) = rx.recv().await {
        let Some(inner) = client.upgrade() else {
            break;
        };
        inner.handle_transport_event(tagged);
    }
    log::debug!("[LiveQuery] Dispatcher stopped");
}

impl ClientInner {
    fn handle_transport_event(&self, tagged: TaggedEvent) {
        let TaggedEvent { generation, event } = tagged;
        let Some(transport) = self.transport_for(generation) else {
            log::trace!("[LiveQuery] Ignoring event from stale transport (generation={generation})");
            return;
        };

        match event {
            TransportEvent::Opened => {
                log::info!("[LiveQuery] Transport open, sending connect");
                self.session_established.store(false, Ordering::SeqCst);
                self.send_connect(transport);
            }
            TransportEvent::Message(text) => self.handle_frame(&transport, &text),
            TransportEvent::Closed { code, reason } => {
                log::info!("[LiveQuery] Transport closed (code={code}, reason={reason})");
                self.mark_session_lost();
                let _ = self.events.send(ClientEvent::Disconnected {
                    user_initiated: self.user_disconnected.load(Ordering::SeqCst),
                });
            }
            TransportEvent::Error(message) => {
                log::warn!("[LiveQuery] Transport error: {message}");
                self.mark_session_lost();
                let _ = self.errors.send(LiveQueryError::Transport(message));
                let _ = self.events.send(ClientEvent::Disconnected {
                    user_initiated: false,
                });
            }
        }
    }

    fn handle_frame(&self, transport: &BoundTransport, text: &str) {
        log::trace!("[LiveQuery] <- {text}");
        let message = match decode_frame(text).and_then(|frame| {
            // Events for removed subscriptions are dropped before their
            // payload is looked at.
            if frame.is_object_event() {
                if let Some(request_id) = frame.request_id() {
                    if self.lookup(request_id).is_none() {
                        return Ok(None);
                    }
                }
            }
            ServerMessage::from_frame(frame).map(Some)
        }) {
            Ok(Some(message)) => message,
            Ok(None) => {
                log::trace!("[LiveQuery] Ignoring event for unknown subscription");
                return;
            }
            Err(error) => {
                log::warn!("[LiveQuery] Dropping frame: {error}");
                let _ = self.errors.send(error);
                return;
            }
        };

        match message {
            ServerMessage::Connected => self.handle_connected(transport),
            ServerMessage::Redirect { url } => {
                log::debug!("[LiveQuery] Ignoring redirect to {url:?}");
            }
            ServerMessage::Subscribed { request_id } => {
                if let Some(handle) = self.lookup(request_id) {
                    handle.did_subscribe();
                    let _ = self.events.send(ClientEvent::Subscribed { request_id });
                }
            }
            ServerMessage::Unsubscribed { request_id } => {
                let removed = self.subscriptions.write().remove(&request_id);
                if let Some(handle) = removed {
                    handle.did_unsubscribe();
                    let _ = self.events.send(ClientEvent::Unsubscribed { request_id });
                }
            }
            ServerMessage::Event {
                kind,
                request_id,
                object,
                original,
            } => self.handle_object_event(kind, request_id, &object, original.as_ref()),
            ServerMessage::Error {
                request_id,
                code,
                error,
                reconnect,
            } => {
                let error = LiveQueryError::ServerReported {
                    code,
                    message: error,
                    reconnect,
                };
                log::warn!("[LiveQuery] {error} (request_id={request_id:?})");
                if let Some(handle) = request_id.and_then(|id| self.lookup(id)) {
                    handle.did_encounter(error.clone());
                }
                let _ = self.errors.send(error);
            }
        }
    }

    /// Session established: replay every registered subscription.
    fn handle_connected(&self, transport: &BoundTransport) {
        self.session_established.store(true, Ordering::SeqCst);
        log::info!("[LiveQuery] Session established");
        let _ = self.events.send(ClientEvent::Connected);

        let mut snapshot: Vec<_> = self.subscriptions.read().values().cloned().collect();
        snapshot.sort_unstable_by_key(|handle| handle.request_id());
        for handle in snapshot {
            self.send_subscribe(handle, transport.clone());
        }
    }

    fn handle_object_event(
        &self,
        kind: EventKind,
        request_id: u64,
        object: &JsonObject,
        original: Option<&JsonObject>,
    ) {
        let Some(handle) = self.lookup(request_id) else {
            return;
        };

        let delivered = self
            .decode_objects(object, original)
            .and_then(|(object, original)| handle.did_receive(kind, object, original));
        match delivered {
            Ok(()) => {
                let _ = self
                    .events
                    .send(ClientEvent::ObjectEvent { request_id, kind });
            }
            Err(error) => {
                log::warn!("[LiveQuery] Failed to deliver {kind} for {request_id}: {error}");
                handle.did_encounter(error.clone());
                let _ = self.errors.send(error);
            }
        }
    }

    fn decode_objects(
        &self,
        object: &JsonObject,
        original: Option<&JsonObject>,
    ) -> Result<(ObjectState, Option<ObjectState>)> {
        let object = self.decoder.decode(object)?;
        let original = original.map(|raw| self.decoder.decode(raw)).transpose()?;
        Ok((object, original))
    }
}
