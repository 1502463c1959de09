//! Live query client.
//!
//! Keeps one WebSocket connection to a live query server, registers queries
//! on it and delivers create/enter/update/leave/delete events for matching
//! objects as they happen.
//!
//! # Architecture
//!
//! - **Client** ([`LiveQueryClient`]) - owns the transport, the sequencer and
//!   the subscription table; runs the connect/dispatch state machine
//! - **Transport** ([`transport`]) - one socket connection, no protocol
//!   knowledge
//! - **Sequencer** ([`OperationSequencer`]) - serializes every outbound frame
//! - **Protocol** ([`protocol`]) - stateless frame encoding and decoding
//! - **Subscription** ([`Subscription`]) - per-query event, error and
//!   lifecycle streams
//!
//! # Example
//!
//! ```no_run
//! use livequery::{LiveQueryClient, Query};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let client = LiveQueryClient::builder()
//!     .server_url("https://api.example.com/parse")
//!     .application_id("my-app")
//!     .build()?;
//!
//! let games: Query = Query::new("Game").equal_to("status", "live");
//! let subscription = client.subscribe(games)?;
//! let mut events = subscription.events();
//! while let Ok(event) = events.recv().await {
//!     println!("{} {:?}", event.kind, event.object.object_id);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod object;
pub mod protocol;
pub mod query;
pub mod sequencer;
pub mod session;
pub mod subscription;
pub mod transport;
pub mod ws;

pub use client::{ClientEvent, LiveQueryClient, LiveQueryClientBuilder};
pub use config::ClientConfig;
pub use error::{LiveQueryError, Result};
pub use object::{DefaultObjectDecoder, LiveObject, ObjectDecoder, ObjectState};
pub use protocol::EventKind;
pub use query::{LiveQuery, Query};
pub use sequencer::OperationSequencer;
pub use session::{SessionTokenProvider, StaticSessionToken};
pub use subscription::{Subscription, SubscriptionEvent};
pub use transport::{Transport, TransportEvents, TransportFactory, TransportState};
