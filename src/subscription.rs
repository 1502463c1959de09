//! Subscriptions and their notification streams.
//!
//! A [`Subscription`] is the caller's handle to one registered query. It
//! exposes four independent hot streams:
//!
//! - [`Subscription::events`]: object events (kind + converted object)
//! - [`Subscription::errors`]: errors scoped to this subscription
//! - [`Subscription::subscribed`]: server confirmed the subscription
//! - [`Subscription::unsubscribed`]: server confirmed the removal
//!
//! Streams are `tokio::sync::broadcast` channels: every receiver sees each
//! event at most once, in order, and receivers created late miss earlier
//! events.
//!
//! The client itself never sees the typed handle. It keeps an
//! `Arc<dyn SubscriptionHandle>` per request id, which lets it route frames
//! without knowing the query or object type.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::error::{LiveQueryError, Result};
use crate::object::{LiveObject, ObjectState};
use crate::protocol::{EventKind, QueryPayload};
use crate::query::LiveQuery;

/// Buffer per stream before slow receivers start lagging.
const STREAM_CAPACITY: usize = 256;

/// One object event delivered to a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionEvent<T> {
    /// What happened.
    pub kind: EventKind,
    /// The object after the change.
    pub object: T,
    /// The object before the change, when the server sent it.
    pub original: Option<T>,
}

/// Untyped view of a subscription used by the client for routing.
pub(crate) trait SubscriptionHandle: Send + Sync {
    fn request_id(&self) -> u64;
    fn query_payload(&self) -> QueryPayload;
    fn query_any(&self) -> &dyn Any;
    fn did_subscribe(&self);
    fn did_unsubscribe(&self);
    fn did_lose_session(&self);
    /// Convert and publish an event; fails if the object conversion fails.
    fn did_receive(
        &self,
        kind: EventKind,
        object: ObjectState,
        original: Option<ObjectState>,
    ) -> Result<()>;
    fn did_encounter(&self, error: LiveQueryError);
}

struct SubscriptionInner<Q: LiveQuery> {
    request_id: u64,
    query: Q,
    confirmed: AtomicBool,
    events: broadcast::Sender<SubscriptionEvent<Q::Object>>,
    errors: broadcast::Sender<LiveQueryError>,
    subscribes: broadcast::Sender<u64>,
    unsubscribes: broadcast::Sender<u64>,
}

impl<Q: LiveQuery> SubscriptionHandle for SubscriptionInner<Q> {
    fn request_id(&self) -> u64 {
        self.request_id
    }

    fn query_payload(&self) -> QueryPayload {
        self.query.to_payload()
    }

    fn query_any(&self) -> &dyn Any {
        &self.query
    }

    fn did_subscribe(&self) {
        self.confirmed.store(true, Ordering::SeqCst);
        let _ = self.subscribes.send(self.request_id);
    }

    fn did_unsubscribe(&self) {
        self.confirmed.store(false, Ordering::SeqCst);
        let _ = self.unsubscribes.send(self.request_id);
    }

    fn did_lose_session(&self) {
        self.confirmed.store(false, Ordering::SeqCst);
    }

    fn did_receive(
        &self,
        kind: EventKind,
        object: ObjectState,
        original: Option<ObjectState>,
    ) -> Result<()> {
        let object = Q::Object::from_state(object)?;
        let original = original.map(Q::Object::from_state).transpose()?;
        let _ = self.events.send(SubscriptionEvent {
            kind,
            object,
            original,
        });
        Ok(())
    }

    fn did_encounter(&self, error: LiveQueryError) {
        let _ = self.errors.send(error);
    }
}

/// Caller handle to one registered query.
///
/// Cheap to clone. Keeping a handle after unsubscribing is fine; it simply
/// stops receiving events.
pub struct Subscription<Q: LiveQuery> {
    inner: Arc<SubscriptionInner<Q>>,
}

impl<Q: LiveQuery> Subscription<Q> {
    /// Build a subscription. Only the client allocates request ids.
    pub(crate) fn create(request_id: u64, query: Q) -> Self {
        let (events, _) = broadcast::channel(STREAM_CAPACITY);
        let (errors, _) = broadcast::channel(STREAM_CAPACITY);
        let (subscribes, _) = broadcast::channel(STREAM_CAPACITY);
        let (unsubscribes, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            inner: Arc::new(SubscriptionInner {
                request_id,
                query,
                confirmed: AtomicBool::new(false),
                events,
                errors,
                subscribes,
                unsubscribes,
            }),
        }
    }

    /// Untyped handle stored in the client's subscription table.
    pub(crate) fn handle(&self) -> Arc<dyn SubscriptionHandle> {
        Arc::clone(&self.inner) as Arc<dyn SubscriptionHandle>
    }

    /// Whether `handle` refers to this very subscription.
    pub(crate) fn is_handle(&self, handle: &Arc<dyn SubscriptionHandle>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(handle), Arc::as_ptr(&self.inner))
    }

    /// Request id assigned by the client.
    #[must_use]
    pub fn request_id(&self) -> u64 {
        self.inner.request_id
    }

    /// The query this subscription watches.
    #[must_use]
    pub fn query(&self) -> &Q {
        &self.inner.query
    }

    /// Whether the server confirmed this subscription on the current session.
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.inner.confirmed.load(Ordering::SeqCst)
    }

    /// Stream of object events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<SubscriptionEvent<Q::Object>> {
        self.inner.events.subscribe()
    }

    /// Stream of errors scoped to this subscription.
    #[must_use]
    pub fn errors(&self) -> broadcast::Receiver<LiveQueryError> {
        self.inner.errors.subscribe()
    }

    /// Stream of subscribe confirmations (carries the request id).
    #[must_use]
    pub fn subscribed(&self) -> broadcast::Receiver<u64> {
        self.inner.subscribes.subscribe()
    }

    /// Stream of unsubscribe confirmations (carries the request id).
    #[must_use]
    pub fn unsubscribed(&self) -> broadcast::Receiver<u64> {
        self.inner.unsubscribes.subscribe()
    }
}

impl<Q: LiveQuery> Clone for Subscription<Q> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Q: LiveQuery> PartialEq for Subscription<Q> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<Q: LiveQuery> fmt::Debug for Subscription<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("request_id", &self.inner.request_id)
            .field("query", &self.inner.query)
            .field("confirmed", &self.is_confirmed())
            .finish_non_exhaustive()
    }
}
