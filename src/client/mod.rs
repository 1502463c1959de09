//! The live query engine.
//!
//! [`LiveQueryClient`] owns the current transport, the operation sequencer
//! and the subscription table. Callers subscribe and unsubscribe; a
//! background dispatcher consumes transport events, decodes frames and routes
//! them to subscriptions.
//!
//! # Architecture
//!
//! ```text
//!   caller ── subscribe(query) ──► subscription table (request id → handle)
//!     │                                   ▲
//!     │ connect_if_needed / reconnect     │ replay on "connected"
//!     ▼                                   │
//!   TransportFactory::create ──► Transport ── TaggedEvent ──► dispatcher task
//!                                    ▲                            │
//!                                    └──── OperationSequencer ◄───┘
//!                                          (connect, subscribe, unsubscribe)
//! ```
//!
//! # Session
//!
//! A socket being open is not enough to send subscriptions. The session is
//! established only once the server answers `connect` with `connected`; at
//! that point every registered subscription is (re)sent. Any close, error or
//! new connection attempt clears the session.
//!
//! The client never reconnects on its own. After an unexpected close callers
//! observe [`ClientEvent::Disconnected`] and decide when to call
//! [`LiveQueryClient::reconnect`].

mod builder;
mod dispatch;
mod events;

pub use builder::LiveQueryClientBuilder;
pub use events::ClientEvent;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};

use crate::error::{LiveQueryError, Result};
use crate::object::ObjectDecoder;
use crate::protocol::ClientOperation;
use crate::query::LiveQuery;
use crate::sequencer::OperationSequencer;
use crate::session::SessionTokenProvider;
use crate::subscription::{Subscription, SubscriptionHandle};
use crate::transport::{TaggedEvent, Transport, TransportEvents, TransportFactory, TransportState};

/// Buffer for the client-wide broadcast channels.
const CHANNEL_CAPACITY: usize = 256;

/// Client for a live query server.
///
/// Cheap to clone; clones share one connection and one subscription table.
/// Must be built inside a tokio runtime (see [`LiveQueryClient::builder`]).
#[derive(Clone)]
pub struct LiveQueryClient {
    inner: Arc<ClientInner>,
}

/// Shared engine state.
struct ClientInner {
    endpoint: String,
    application_id: String,
    client_key: Option<String>,
    transport_factory: Arc<dyn TransportFactory>,
    session_provider: Arc<dyn SessionTokenProvider>,
    decoder: Arc<dyn ObjectDecoder>,
    sequencer: OperationSequencer,
    subscriptions: RwLock<HashMap<u64, Arc<dyn SubscriptionHandle>>>,
    next_request_id: AtomicU64,
    connection: Mutex<Connection>,
    current_generation: Arc<AtomicU64>,
    user_disconnected: AtomicBool,
    session_established: AtomicBool,
    events: broadcast::Sender<ClientEvent>,
    errors: broadcast::Sender<LiveQueryError>,
    transport_tx: mpsc::UnboundedSender<TaggedEvent>,
}

/// The current transport and the generation it reports under.
#[derive(Default)]
struct Connection {
    transport: Option<Arc<dyn Transport>>,
    generation: u64,
}

/// A transport pinned to the generation it was current in.
///
/// Sends check the generation first: work queued before a reconnect or
/// disconnect fails with [`LiveQueryError::Transport`] instead of reaching the
/// replaced socket.
#[derive(Clone, Debug)]
struct BoundTransport {
    transport: Arc<dyn Transport>,
    generation: u64,
    current: Arc<AtomicU64>,
}

impl BoundTransport {
    fn state(&self) -> TransportState {
        self.transport.state()
    }

    async fn send(&self, frame: &str) -> Result<()> {
        if self.current.load(Ordering::SeqCst) != self.generation {
            return Err(LiveQueryError::Transport(format!(
                "transport replaced (generation={})",
                self.generation
            )));
        }
        self.transport.send(frame).await
    }
}

/// Everything the builder resolved.
struct ClientParts {
    endpoint: String,
    application_id: String,
    client_key: Option<String>,
    transport_factory: Arc<dyn TransportFactory>,
    session_provider: Arc<dyn SessionTokenProvider>,
    decoder: Arc<dyn ObjectDecoder>,
}

impl LiveQueryClient {
    /// Start configuring a client.
    #[must_use]
    pub fn builder() -> LiveQueryClientBuilder {
        LiveQueryClientBuilder::default()
    }

    fn start(parts: ClientParts) -> Self {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (errors, _) = broadcast::channel(CHANNEL_CAPACITY);

        let inner = Arc::new(ClientInner {
            endpoint: parts.endpoint,
            application_id: parts.application_id,
            client_key: parts.client_key,
            transport_factory: parts.transport_factory,
            session_provider: parts.session_provider,
            decoder: parts.decoder,
            sequencer: OperationSequencer::new(),
            subscriptions: RwLock::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            connection: Mutex::new(Connection::default()),
            current_generation: Arc::new(AtomicU64::new(0)),
            user_disconnected: AtomicBool::new(false),
            session_established: AtomicBool::new(false),
            events,
            errors,
            transport_tx,
        });

        tokio::spawn(dispatch::run(Arc::downgrade(&inner), transport_rx));

        Self { inner }
    }

    /// Endpoint this client connects to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Register `query` and return its subscription.
    ///
    /// The subscription is in the table before this returns. If the session
    /// is established the `subscribe` frame is queued immediately; otherwise
    /// a connection attempt is started and the subscription is sent once the
    /// server acknowledges `connect`.
    ///
    /// # Errors
    ///
    /// [`LiveQueryError::IllegalState`] after [`disconnect`](Self::disconnect)
    /// until [`reconnect`](Self::reconnect) is called. The subscription is not
    /// kept in that case.
    pub fn subscribe<Q: LiveQuery>(&self, query: Q) -> Result<Subscription<Q>> {
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::SeqCst);
        let subscription = Subscription::create(request_id, query);
        let handle = subscription.handle();
        self.inner
            .subscriptions
            .write()
            .insert(request_id, Arc::clone(&handle));

        if let Some(transport) = self.inner.connected_transport() {
            self.inner.send_subscribe(handle, transport);
        } else if self.inner.user_disconnected.load(Ordering::SeqCst) {
            self.inner.subscriptions.write().remove(&request_id);
            return Err(LiveQueryError::IllegalState(
                "client was disconnected; call reconnect() before subscribing".to_string(),
            ));
        } else {
            self.connect_if_needed();
        }

        log::debug!("[LiveQuery] Registered subscription {request_id}");
        Ok(subscription)
    }

    /// Remove every subscription whose query equals `query`.
    ///
    /// Returns how many entries were removed. Matching nothing is a no-op.
    pub fn unsubscribe<Q: LiveQuery>(&self, query: &Q) -> usize {
        self.inner
            .remove_matching(|handle| handle.query_any().downcast_ref::<Q>() == Some(query))
    }

    /// Remove `subscription` if its query equals `query`.
    pub fn unsubscribe_subscription<Q: LiveQuery>(
        &self,
        query: &Q,
        subscription: &Subscription<Q>,
    ) -> usize {
        self.inner.remove_matching(|handle| {
            subscription.is_handle(handle)
                && handle.query_any().downcast_ref::<Q>() == Some(query)
        })
    }

    /// Start a connection unless one is already connecting or connected.
    pub fn connect_if_needed(&self) {
        let mut connection = self.inner.connection.lock();
        match connection_state(&connection) {
            TransportState::Connecting | TransportState::Connected => {}
            TransportState::None
            | TransportState::Disconnecting
            | TransportState::Disconnected
            | TransportState::Error => self.inner.reconnect_locked(&mut connection),
        }
    }

    /// Replace the transport with a fresh one and open it.
    ///
    /// Clears a previous [`disconnect`](Self::disconnect).
    pub fn reconnect(&self) {
        let mut connection = self.inner.connection.lock();
        self.inner.reconnect_locked(&mut connection);
    }

    /// Close the transport and stop implicit reconnection.
    ///
    /// Subscriptions stay registered and are replayed after the next
    /// [`reconnect`](Self::reconnect). The close itself runs in the
    /// background; use [`shutdown`](Self::shutdown) to wait for it.
    pub fn disconnect(&self) {
        if let Some(transport) = self.inner.detach_transport() {
            spawn_close(transport);
        }
    }

    /// Like [`disconnect`](Self::disconnect), but returns only once the
    /// transport has finished closing.
    pub async fn shutdown(&self) {
        if let Some(transport) = self.inner.detach_transport() {
            transport.close().await;
        }
    }

    /// Connection state as seen by the engine.
    ///
    /// A transport whose `open` is still queued reports
    /// [`TransportState::Connecting`].
    #[must_use]
    pub fn connection_state(&self) -> TransportState {
        connection_state(&self.inner.connection.lock())
    }

    /// Whether the transport is connected and the server acknowledged
    /// `connect`.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected_transport().is_some()
    }

    /// Number of registered subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.read().len()
    }

    /// Client-wide lifecycle notifications.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Client-wide errors: decode failures, server errors, transport failures.
    #[must_use]
    pub fn errors(&self) -> broadcast::Receiver<LiveQueryError> {
        self.inner.errors.subscribe()
    }
}

impl fmt::Debug for LiveQueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveQueryClient")
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.connection_state())
            .field("subscriptions", &self.subscription_count())
            .finish_non_exhaustive()
    }
}

fn connection_state(connection: &Connection) -> TransportState {
    match &connection.transport {
        None => TransportState::None,
        Some(transport) => match transport.state() {
            TransportState::None => TransportState::Connecting,
            state => state,
        },
    }
}

fn spawn_close(transport: Arc<dyn Transport>) {
    tokio::spawn(async move {
        transport.close().await;
    });
}

impl ClientInner {
    /// Tear down the current transport and open a new one.
    ///
    /// Callers hold the connection lock, so at most one transport is created
    /// per state check.
    fn reconnect_locked(&self, connection: &mut Connection) {
        self.user_disconnected.store(false, Ordering::SeqCst);
        self.mark_session_lost();

        if let Some(previous) = connection.transport.take() {
            spawn_close(previous);
        }

        let generation = self.advance_generation(connection);
        let events = TransportEvents::new(generation, self.transport_tx.clone());
        let transport = self.transport_factory.create(&self.endpoint, events);
        connection.transport = Some(Arc::clone(&transport));

        log::info!(
            "[LiveQuery] Connecting to {} (generation={generation})",
            self.endpoint
        );
        self.sequencer.enqueue_on_error(
            async move { transport.open().await },
            move |error| {
                log::debug!("[LiveQuery] Open failed (generation={generation}): {error}");
            },
        );
    }

    /// Drop the current transport for good and hand it back for closing.
    fn detach_transport(&self) -> Option<Arc<dyn Transport>> {
        let previous = {
            let mut connection = self.connection.lock();
            self.advance_generation(&mut connection);
            connection.transport.take()
        };
        self.user_disconnected.store(true, Ordering::SeqCst);
        self.mark_session_lost();

        if previous.is_some() {
            log::info!("[LiveQuery] Disconnecting from {}", self.endpoint);
            let _ = self.events.send(ClientEvent::Disconnected {
                user_initiated: true,
            });
        }
        previous
    }

    /// Retire the current generation. Caller holds the connection lock.
    fn advance_generation(&self, connection: &mut Connection) -> u64 {
        connection.generation += 1;
        self.current_generation
            .store(connection.generation, Ordering::SeqCst);
        connection.generation
    }

    fn bind(&self, transport: &Arc<dyn Transport>, generation: u64) -> BoundTransport {
        BoundTransport {
            transport: Arc::clone(transport),
            generation,
            current: Arc::clone(&self.current_generation),
        }
    }

    fn mark_session_lost(&self) {
        self.session_established.store(false, Ordering::SeqCst);
        for handle in self.subscriptions.read().values() {
            handle.did_lose_session();
        }
    }

    /// The current transport if it belongs to `generation`.
    fn transport_for(&self, generation: u64) -> Option<BoundTransport> {
        let connection = self.connection.lock();
        if connection.generation != generation {
            return None;
        }
        let transport = connection.transport.as_ref()?;
        Some(self.bind(transport, generation))
    }

    /// The current transport, whatever its state.
    fn current_transport(&self) -> Option<BoundTransport> {
        let connection = self.connection.lock();
        let transport = connection.transport.as_ref()?;
        Some(self.bind(transport, connection.generation))
    }

    fn connected_transport(&self) -> Option<BoundTransport> {
        let transport = self.current_transport()?;
        let ready = transport.state() == TransportState::Connected
            && self.session_established.load(Ordering::SeqCst);
        ready.then_some(transport)
    }

    fn lookup(&self, request_id: u64) -> Option<Arc<dyn SubscriptionHandle>> {
        self.subscriptions.read().get(&request_id).cloned()
    }

    fn remove_matching(&self, matches: impl Fn(&Arc<dyn SubscriptionHandle>) -> bool) -> usize {
        let mut removed = Vec::new();
        self.subscriptions.write().retain(|request_id, handle| {
            let hit = matches(handle);
            if hit {
                removed.push(*request_id);
            }
            !hit
        });
        if removed.is_empty() {
            return 0;
        }
        removed.sort_unstable();

        match self.current_transport() {
            Some(transport) => {
                for request_id in &removed {
                    self.send_unsubscribe(*request_id, transport.clone());
                }
            }
            None => {
                log::warn!("[LiveQuery] Unsubscribed {removed:?} without a transport");
                let _ = self.errors.send(LiveQueryError::transport(
                    "cannot send unsubscribe: not connected",
                ));
            }
        }
        log::debug!("[LiveQuery] Unsubscribed {removed:?}");
        removed.len()
    }

    /// Queue `connect` on the freshly opened transport.
    fn send_connect(&self, transport: BoundTransport) {
        let application_id = self.application_id.clone();
        let client_key = self.client_key.clone();
        let errors = self.errors.clone();
        self.send_with_session(
            transport,
            move |session_token| ClientOperation::Connect {
                application_id,
                client_key,
                session_token,
            },
            move |error| {
                log::warn!("[LiveQuery] Failed to send connect: {error}");
                let _ = errors.send(error);
            },
        );
    }

    fn send_subscribe(&self, handle: Arc<dyn SubscriptionHandle>, transport: BoundTransport) {
        let request_id = handle.request_id();
        let query = handle.query_payload();
        let errors = self.errors.clone();
        self.send_with_session(
            transport,
            move |session_token| ClientOperation::Subscribe {
                request_id,
                query,
                session_token,
            },
            move |error| {
                log::warn!("[LiveQuery] Failed to subscribe {request_id}: {error}");
                handle.did_encounter(error.clone());
                let _ = errors.send(error);
            },
        );
    }

    fn send_unsubscribe(&self, request_id: u64, transport: BoundTransport) {
        let errors = self.errors.clone();
        self.sequencer.enqueue_on_error(
            async move {
                let frame = ClientOperation::Unsubscribe { request_id }.encode()?;
                log::trace!("[LiveQuery] -> {frame}");
                transport.send(&frame).await
            },
            move |error| {
                log::warn!("[LiveQuery] Failed to unsubscribe {request_id}: {error}");
                let _ = errors.send(error);
            },
        );
    }

    /// Fetch the session token and send the operation built from it.
    ///
    /// The fetch starts right away; the send is one sequencer unit and keeps
    /// its place in the queue however long the fetch takes. The target
    /// transport is fixed now, so a send after replacement fails instead of
    /// reaching either connection.
    fn send_with_session<B, H>(&self, transport: BoundTransport, build: B, on_error: H)
    where
        B: FnOnce(Option<String>) -> ClientOperation + Send + 'static,
        H: FnOnce(LiveQueryError) + Send + 'static,
    {
        let provider = Arc::clone(&self.session_provider);
        let completion = self.sequencer.enqueue_on_success(
            async move { provider.current_session_token().await },
            move |session_token| async move {
                let frame = build(session_token).encode()?;
                log::trace!("[LiveQuery] -> {frame}");
                transport.send(&frame).await
            },
        );
        tokio::spawn(async move {
            if let Err(error) = completion.await.and_then(std::convert::identity) {
                on_error(error);
            }
        });
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(transport) = self.connection.get_mut().transport.take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    transport.close().await;
                });
            }
        }
    }
}
