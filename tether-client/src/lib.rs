//! Durable JSON-RPC 2.0 sessions over WebSocket
//!
//! This crate keeps a JSON-RPC session with a remote agent alive across
//! socket drops, network loss and process backgrounding. The peer may be a
//! stdio-bridged CLI behind a relay, so inbound frames can carry several
//! JSON documents or only part of one; `tether_core::FrameExtractor`
//! takes care of that.
//!
//! # Core Features
//!
//! - **WebSocket Transport**: one [`Connection`] per attempt, with optional heartbeat
//! - **Request-Response**: integer ids, replies matched in any order
//! - **Server Traffic**: notifications and server requests as [`ClientEvent`]s
//! - **Auto-Reconnection**: exponential backoff, gated on network availability
//! - **Handshake**: optional `initialize` after every connection
//! - **Identity**: a persistent client id sent as `X-Client-Id`
//! - **Observability**: OpenTelemetry metrics and tracing spans
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use tether_client::{ClientBuilder, ClientEvent, ConnectionConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ClientBuilder::new().build().await?;
//!     let mut events = client.subscribe().await;
//!
//!     client.connect(ConnectionConfig::new("ws://localhost:4500")).await?;
//!
//!     let threads = client.send_request("thread/list", Some(json!({"limit": 20}))).await?;
//!     println!("threads: {}", threads);
//!
//!     while let Some(event) = events.recv().await {
//!         if let ClientEvent::Message(message) = event {
//!             println!("server says: {:?}", message);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

mod client;
mod client_builder;
mod config;
mod connection;
mod connection_state;
mod metrics;
mod notification;
mod reconnect;
mod request;
mod session;
mod store;

pub use client::{
    ClientEvent, InitializeOptions, InitializeParamsFn, TetherClient, CLIENT_ID_HEADER,
    DEFAULT_HEALTH_CHECK_TIMEOUT,
};
pub use client_builder::ClientBuilder;
pub use config::{ConnectionConfig, StaticToken, TokenError, TokenFn, TokenProvider};
pub use connection::{Connection, ConnectionEvent};
pub use connection_state::ConnectionState;
pub use metrics::ClientMetrics;
pub use notification::{NotificationFn, NotificationHandler};
pub use reconnect::{ExponentialBackoff, FixedDelay, NoReconnect, ReconnectionStrategy};
pub use request::RequestManager;
pub use session::SessionTracker;
pub use store::{
    last_connected, load_or_create_client_id, record_last_connected, ClientStore, JsonFileStore,
    MemoryStore, CLIENT_ID_KEY, LAST_CONNECTED_KEY,
};
