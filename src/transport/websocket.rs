//! WebSocket implementation of [`Transport`].
//!
//! `open` performs the handshake through [`crate::ws::connect`] and then
//! spawns one I/O task that owns both socket halves. The task reads inbound
//! frames one at a time and forwards each to [`TransportEvents`] before
//! reading the next, and writes outbound frames queued by `send`.
//!
//! # Cancellation
//!
//! `close` trips a [`CancellationToken`] shared with the in-flight handshake
//! and the I/O task. A handshake that is cancelled resolves to an error; the
//! I/O task sends a close frame (best effort) and exits.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Transport, TransportEvents, TransportFactory, TransportState};
use crate::error::{LiveQueryError, Result};
use crate::ws::{self, Inbound, WsReader, WsWriter};

/// How long the I/O task waits for the close frame to be written.
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// Outbound frame plus the channel that reports the write result.
#[derive(Debug)]
struct OutgoingFrame {
    text: String,
    ack: oneshot::Sender<Result<()>>,
}

/// [`Transport`] over a single WebSocket connection.
#[derive(Debug)]
pub struct WebSocketTransport {
    url: String,
    headers: Vec<(String, String)>,
    events: TransportEvents,
    state: Arc<Mutex<TransportState>>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<OutgoingFrame>>>,
    io_task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl WebSocketTransport {
    /// Create an unopened transport for `url`.
    #[must_use]
    pub fn new(url: &str, headers: Vec<(String, String)>, events: TransportEvents) -> Self {
        Self {
            url: url.to_string(),
            headers,
            events,
            state: Arc::new(Mutex::new(TransportState::None)),
            outgoing: Mutex::new(None),
            io_task: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Endpoint this transport connects to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    fn set_state(&self, state: TransportState) {
        *self.state.lock() = state;
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if self.cancel.is_cancelled() {
                return Err(LiveQueryError::transport("transport closed before open"));
            }
            if *state != TransportState::None {
                return Err(LiveQueryError::IllegalState(format!(
                    "transport already opened (state={})",
                    *state
                )));
            }
            *state = TransportState::Connecting;
        }

        log::info!("[Transport] Connecting to {}", self.url);

        let connected = tokio::select! {
            () = self.cancel.cancelled() => None,
            result = ws::connect(&self.url, &self.headers) => Some(result),
        };

        let (writer, reader) = match connected {
            None => {
                self.set_state(TransportState::Disconnected);
                log::info!("[Transport] Connect to {} cancelled", self.url);
                return Err(LiveQueryError::transport("connect cancelled by close"));
            }
            Some(Err(e)) => {
                let message = format!("{e:#}");
                self.set_state(TransportState::Error);
                log::warn!("[Transport] Connection failed: {}", message);
                self.events.error(message.clone());
                return Err(LiveQueryError::Transport(message));
            }
            Some(Ok(pair)) => pair,
        };

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock();
            if self.cancel.is_cancelled() {
                *state = TransportState::Disconnected;
                return Err(LiveQueryError::transport("connect cancelled by close"));
            }
            *self.outgoing.lock() = Some(outgoing_tx);
            *state = TransportState::Connected;
        }

        log::info!("[Transport] WebSocket connected");
        self.events.opened();

        let handle = tokio::spawn(run_io_loop(
            writer,
            reader,
            outgoing_rx,
            Arc::clone(&self.state),
            self.events.clone(),
            self.cancel.clone(),
        ));
        *self.io_task.lock() = Some(handle);

        Ok(())
    }

    async fn close(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                TransportState::None => *state = TransportState::Disconnected,
                TransportState::Connecting | TransportState::Connected => {
                    *state = TransportState::Disconnecting;
                }
                TransportState::Disconnecting
                | TransportState::Disconnected
                | TransportState::Error => {}
            }
        }

        self.cancel.cancel();

        let handle = self.io_task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::warn!("[Transport] I/O task ended abnormally: {}", e);
            }
        }
        self.outgoing.lock().take();

        let mut state = self.state.lock();
        if *state == TransportState::Disconnecting {
            *state = TransportState::Disconnected;
        }
        log::debug!("[Transport] Closed (state={})", *state);
    }

    async fn send(&self, frame: &str) -> Result<()> {
        let state = self.state();
        if state != TransportState::Connected {
            return Err(LiveQueryError::Transport(format!(
                "cannot send while transport is {state}"
            )));
        }

        let outgoing = self
            .outgoing
            .lock()
            .clone()
            .ok_or_else(|| LiveQueryError::transport("cannot send: no open connection"))?;

        let (ack_tx, ack_rx) = oneshot::channel();
        outgoing
            .send(OutgoingFrame {
                text: frame.to_string(),
                ack: ack_tx,
            })
            .map_err(|e| LiveQueryError::Transport(format!("connection task gone: {e}")))?;

        ack_rx
            .await
            .map_err(|e| LiveQueryError::Transport(format!("send not acknowledged: {e}")))?
    }

    fn state(&self) -> TransportState {
        *self.state.lock()
    }
}

/// Own both socket halves until the connection ends or `cancel` fires.
async fn run_io_loop(
    mut writer: WsWriter,
    mut reader: WsReader,
    mut outgoing_rx: mpsc::UnboundedReceiver<OutgoingFrame>,
    state: Arc<Mutex<TransportState>>,
    events: TransportEvents,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                match tokio::time::timeout(CLOSE_FRAME_TIMEOUT, writer.close()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => log::debug!("[Transport] Close frame not sent: {:#}", e),
                    Err(_elapsed) => log::debug!("[Transport] Close frame timed out"),
                }
                *state.lock() = TransportState::Disconnected;
                events.closed(1000, "client requested close");
                return;
            }

            frame = reader.next_frame() => {
                match frame {
                    Some(Ok(Inbound::Text(text))) => {
                        log::trace!("[Transport] <- {}", text);
                        events.message(text);
                    }
                    Some(Ok(Inbound::Ping(payload))) => {
                        if let Err(e) = writer.pong(payload).await {
                            log::debug!("[Transport] Failed to answer ping: {:#}", e);
                        }
                    }
                    Some(Ok(Inbound::Close { code, reason })) => {
                        log::info!("[Transport] Connection closed by server ({})", code);
                        *state.lock() = TransportState::Disconnected;
                        events.closed(code, reason);
                        return;
                    }
                    Some(Err(e)) => {
                        log::warn!("[Transport] WebSocket error: {:#}", e);
                        *state.lock() = TransportState::Error;
                        events.error(format!("{e:#}"));
                        return;
                    }
                    None => {
                        log::info!("[Transport] WebSocket stream ended");
                        *state.lock() = TransportState::Disconnected;
                        events.closed(1006, "stream ended");
                        return;
                    }
                }
            }

            outgoing = outgoing_rx.recv() => {
                let Some(frame) = outgoing else {
                    *state.lock() = TransportState::Disconnected;
                    return;
                };
                log::trace!("[Transport] -> {}", frame.text);
                let result = tokio::select! {
                    () = cancel.cancelled() => Err(LiveQueryError::transport("send cancelled by close")),
                    sent = writer.text(&frame.text) => {
                        sent.map_err(|e| LiveQueryError::Transport(format!("{e:#}")))
                    }
                };
                let failure = result.as_ref().err().map(ToString::to_string);
                let _ = frame.ack.send(result);
                if let Some(message) = failure {
                    if cancel.is_cancelled() {
                        continue;
                    }
                    log::warn!("[Transport] Send failed: {}", message);
                    *state.lock() = TransportState::Error;
                    events.error(message);
                    return;
                }
            }
        }
    }
}

/// Creates a [`WebSocketTransport`] per connection attempt.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransportFactory {
    headers: Vec<(String, String)>,
}

impl WebSocketTransportFactory {
    /// Factory with no extra handshake headers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header sent with every handshake request.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

impl TransportFactory for WebSocketTransportFactory {
    fn create(&self, endpoint: &str, events: TransportEvents) -> Arc<dyn Transport> {
        Arc::new(WebSocketTransport::new(endpoint, self.headers.clone(), events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportEvent;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    /// Accept one WebSocket client and echo every text frame back.
    async fn spawn_echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Text(text) => {
                        if ws.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let (events, _rx) = TransportEvents::channel(1);
        let transport = WebSocketTransport::new("ws://127.0.0.1:1", Vec::new(), events);
        let err = transport.send("{}").await.unwrap_err();
        assert!(matches!(err, LiveQueryError::Transport(_)));
    }

    #[tokio::test]
    async fn test_open_unreachable_reports_error_event() {
        let (events, mut rx) = TransportEvents::channel(3);
        let transport = WebSocketTransport::new("ws://127.0.0.1:1", Vec::new(), events);

        assert!(transport.open().await.is_err());
        assert_eq!(transport.state(), TransportState::Error);

        let tagged = rx.recv().await.expect("error event");
        assert_eq!(tagged.generation, 3);
        assert!(matches!(tagged.event, TransportEvent::Error(_)));
    }

    #[tokio::test]
    async fn test_close_before_open_prevents_open() {
        let (events, _rx) = TransportEvents::channel(1);
        let transport = WebSocketTransport::new("ws://127.0.0.1:1", Vec::new(), events);

        transport.close().await;
        assert_eq!(transport.state(), TransportState::Disconnected);
        assert!(transport.open().await.is_err());
    }

    #[tokio::test]
    async fn test_open_send_receive_close() {
        let url = spawn_echo_server().await;
        let (events, mut rx) = TransportEvents::channel(1);
        let transport = WebSocketTransport::new(&url, Vec::new(), events);

        transport.open().await.unwrap();
        assert_eq!(transport.state(), TransportState::Connected);
        assert_eq!(rx.recv().await.unwrap().event, TransportEvent::Opened);

        transport.send("{\"op\":\"ping\"}").await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap().event,
            TransportEvent::Message("{\"op\":\"ping\"}".to_string())
        );

        transport.close().await;
        assert_eq!(transport.state(), TransportState::Disconnected);
        assert!(matches!(
            rx.recv().await.unwrap().event,
            TransportEvent::Closed { code: 1000, .. }
        ));

        let err = transport.send("{}").await.unwrap_err();
        assert!(matches!(err, LiveQueryError::Transport(_)));
    }

    #[tokio::test]
    async fn test_second_open_is_rejected() {
        let url = spawn_echo_server().await;
        let (events, _rx) = TransportEvents::channel(1);
        let transport = WebSocketTransport::new(&url, Vec::new(), events);

        transport.open().await.unwrap();
        let err = transport.open().await.unwrap_err();
        assert!(matches!(err, LiveQueryError::IllegalState(_)));
        transport.close().await;
    }
}
