//! Shared helpers for client integration tests.
//!
//! [`MockTransportFactory`] hands out in-memory transports that record every
//! frame the client sends and let the test inject inbound frames.

#![allow(dead_code, reason = "not every test binary uses every helper")]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use livequery::{
    LiveQueryClient, LiveQueryError, Result, Transport, TransportEvents, TransportFactory,
    TransportState,
};

/// In-memory transport.
#[derive(Debug)]
pub struct MockTransport {
    events: TransportEvents,
    state: Mutex<TransportState>,
    sent: Mutex<Vec<String>>,
    fail_open: bool,
}

impl MockTransport {
    /// Frames sent so far, in order.
    pub fn sent_frames(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Sent frames parsed as JSON.
    pub fn sent_json(&self) -> Vec<Value> {
        self.sent_frames()
            .iter()
            .map(|frame| serde_json::from_str(frame).unwrap())
            .collect()
    }

    /// `op` of every sent frame.
    pub fn sent_ops(&self) -> Vec<String> {
        self.sent_json()
            .iter()
            .map(|frame| frame["op"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    /// Deliver an inbound text frame.
    pub fn deliver(&self, frame: &str) {
        self.events.message(frame.to_string());
    }

    /// Simulate the server dropping the connection.
    pub fn drop_connection(&self) {
        *self.state.lock() = TransportState::Disconnected;
        self.events.closed(1006, "connection reset");
    }

    /// Simulate a socket failure.
    pub fn fail(&self, message: &str) {
        *self.state.lock() = TransportState::Error;
        self.events.error(message);
    }

    /// Generation this transport reports under.
    pub fn generation(&self) -> u64 {
        self.events.generation()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != TransportState::None {
                return Err(LiveQueryError::IllegalState(format!(
                    "cannot open transport in state {}",
                    *state
                )));
            }
            if self.fail_open {
                *state = TransportState::Error;
            } else {
                *state = TransportState::Connected;
            }
        }
        if self.fail_open {
            self.events.error("connection refused");
            return Err(LiveQueryError::transport("connection refused"));
        }
        self.events.opened();
        Ok(())
    }

    async fn close(&self) {
        let was_open = {
            let mut state = self.state.lock();
            let was_open = *state == TransportState::Connected;
            *state = TransportState::Disconnected;
            was_open
        };
        if was_open {
            self.events.closed(1000, "closed by client");
        }
    }

    async fn send(&self, frame: &str) -> Result<()> {
        let state = *self.state.lock();
        if state != TransportState::Connected {
            return Err(LiveQueryError::Transport(format!(
                "cannot send while transport is {state}"
            )));
        }
        self.sent.lock().push(frame.to_string());
        Ok(())
    }

    fn state(&self) -> TransportState {
        *self.state.lock()
    }
}

/// Factory recording every transport it creates.
#[derive(Debug, Default)]
pub struct MockTransportFactory {
    created: Mutex<Vec<Arc<MockTransport>>>,
    fail_open: Mutex<bool>,
}

impl MockTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make transports created from now on fail to open.
    pub fn set_fail_open(&self, fail: bool) {
        *self.fail_open.lock() = fail;
    }

    /// Number of transports created (one per connection attempt).
    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    /// Most recently created transport.
    pub fn latest(&self) -> Arc<MockTransport> {
        self.created
            .lock()
            .last()
            .cloned()
            .expect("no transport created yet")
    }

    /// Transport created by attempt `index` (0-based).
    pub fn nth(&self, index: usize) -> Arc<MockTransport> {
        Arc::clone(&self.created.lock()[index])
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self, _endpoint: &str, events: TransportEvents) -> Arc<dyn Transport> {
        let transport = Arc::new(MockTransport {
            events,
            state: Mutex::new(TransportState::None),
            sent: Mutex::new(Vec::new()),
            fail_open: *self.fail_open.lock(),
        });
        self.created.lock().push(Arc::clone(&transport));
        transport
    }
}

/// Client wired to `factory`.
pub fn client_with(factory: &Arc<MockTransportFactory>) -> LiveQueryClient {
    LiveQueryClient::builder()
        .endpoint("ws://localhost:1337/parse")
        .application_id("test-app")
        .transport_factory(Arc::clone(factory) as Arc<dyn TransportFactory>)
        .build()
        .unwrap()
}

/// Poll `condition` until it holds or fail after two seconds.
pub async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until `transport` has sent `count` frames.
pub async fn wait_for_frames(transport: &MockTransport, count: usize) {
    wait_for(&format!("{count} sent frames"), || {
        transport.sent_frames().len() >= count
    })
    .await;
}

/// Let queued work settle; used before asserting that nothing happened.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Open a session: wait for `connect`, then acknowledge it.
pub async fn establish_session(client: &LiveQueryClient, transport: &MockTransport) {
    wait_for("connect frame", || {
        transport.sent_ops().first().map(String::as_str) == Some("connect")
    })
    .await;
    transport.deliver(r#"{"op":"connected"}"#);
    wait_for("session established", || client.is_connected()).await;
}
