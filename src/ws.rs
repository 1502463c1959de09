//! Socket plumbing for [`crate::transport::websocket`].
//!
//! Nothing else in the crate touches `tokio-tungstenite`. [`connect`] yields
//! a [`WsWriter`] / [`WsReader`] pair so the transport's I/O task can poll
//! reads and writes from one `select!`.

use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Close code used when the peer sent a close frame without one.
const NO_STATUS_RECEIVED: u16 = 1005;

/// Inbound frame as the transport sees it.
///
/// Binary frames arrive as [`Inbound::Text`] (lossy UTF-8); pongs are
/// swallowed by [`WsReader::next_frame`].
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    /// Protocol payload.
    Text(String),
    /// Ping that must be answered with the same payload.
    Ping(Vec<u8>),
    /// Peer closed the connection.
    Close {
        /// Close code (1005 when the peer sent none).
        code: u16,
        /// Close reason, possibly empty.
        reason: String,
    },
}

/// Outbound half.
#[derive(Debug)]
pub struct WsWriter {
    sink: SplitSink<Socket, Message>,
}

impl WsWriter {
    /// Write one text frame.
    pub async fn text(&mut self, frame: &str) -> Result<()> {
        self.sink
            .send(Message::Text(frame.to_owned()))
            .await
            .context("failed to write text frame")
    }

    /// Answer a ping with its payload.
    pub async fn pong(&mut self, payload: Vec<u8>) -> Result<()> {
        self.sink
            .send(Message::Pong(payload))
            .await
            .context("failed to answer ping")
    }

    /// Send a close frame and flush it.
    pub async fn close(&mut self) -> Result<()> {
        self.sink
            .send(Message::Close(None))
            .await
            .context("failed to write close frame")
    }
}

/// Inbound half.
#[derive(Debug)]
pub struct WsReader {
    stream: SplitStream<Socket>,
}

impl WsReader {
    /// Next frame the transport cares about, or `None` once the socket ends.
    pub async fn next_frame(&mut self) -> Option<Result<Inbound>> {
        while let Some(message) = self.stream.next().await {
            let inbound = match message {
                Ok(Message::Text(text)) => Inbound::Text(text),
                Ok(Message::Binary(data)) => {
                    Inbound::Text(String::from_utf8_lossy(&data).into_owned())
                }
                Ok(Message::Ping(payload)) => Inbound::Ping(payload),
                Ok(Message::Close(frame)) => match frame {
                    Some(frame) => Inbound::Close {
                        code: frame.code.into(),
                        reason: frame.reason.into_owned(),
                    },
                    None => Inbound::Close {
                        code: NO_STATUS_RECEIVED,
                        reason: String::new(),
                    },
                },
                Ok(Message::Pong(_) | Message::Frame(_)) => continue,
                Err(e) => return Some(Err(anyhow::Error::new(e).context("socket read failed"))),
            };
            return Some(Ok(inbound));
        }
        None
    }
}

/// Perform the handshake against `url`, adding `headers` to the upgrade
/// request.
pub async fn connect(url: &str, headers: &[(String, String)]) -> Result<(WsWriter, WsReader)> {
    let mut request = url
        .into_client_request()
        .with_context(|| format!("not a usable WebSocket URL: {url}"))?;

    let request_headers = request.headers_mut();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("bad handshake header name {name:?}"))?;
        let value = HeaderValue::from_str(value)
            .with_context(|| format!("bad value for handshake header {name}"))?;
        request_headers.insert(name, value);
    }

    let (socket, response) = tokio_tungstenite::connect_async(request)
        .await
        .with_context(|| format!("handshake with {url} failed"))?;
    log::debug!("[Transport] Handshake response: {}", response.status());

    let (sink, stream) = socket.split();
    Ok((WsWriter { sink }, WsReader { stream }))
}

/// WebSocket form of a server URL.
///
/// `https` becomes `wss` and `http` becomes `ws`; host, port and path are
/// kept. `ws`/`wss` URLs pass through. Anything else is `None`.
#[must_use]
pub fn to_websocket_url(url: &str) -> Option<String> {
    const SCHEMES: [(&str, &str); 4] = [
        ("wss://", "wss://"),
        ("ws://", "ws://"),
        ("https://", "wss://"),
        ("http://", "ws://"),
    ];
    SCHEMES.iter().find_map(|(from, to)| {
        url.strip_prefix(from).map(|rest| format!("{to}{rest}"))
    })
}
