//! Tether - durable JSON-RPC 2.0 sessions over WebSocket
//!
//! This is the convenience crate that re-exports the tether sub-crates.
//! Use it when you want a single dependency for the whole session engine.
//!
//! # Architecture
//!
//! - **tether-core**: message types, wire codec, frame extraction, errors, observability
//! - **tether-client**: connection state machine, request correlation, reconnection
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use tether::{ClientBuilder, ClientEvent, ConnectionConfig, ConnectionState};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ClientBuilder::new().build().await?;
//!     let mut events = client.subscribe().await;
//!
//!     client
//!         .connect(ConnectionConfig::new("ws://localhost:4500").with_bearer_token("token"))
//!         .await?;
//!
//!     let result: serde_json::Value = client
//!         .request("thread/start", serde_json::json!({"cwd": "/tmp"}))
//!         .await?;
//!     println!("Result: {}", result);
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             ClientEvent::StateChanged(ConnectionState::Failed(err)) => {
//!                 eprintln!("connection lost: {}", err);
//!             }
//!             ClientEvent::Message(message) => println!("{:?}", message),
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub use tether_client as client;
pub use tether_core as core;

// Convenience re-exports of the most commonly used types
pub use tether_client::{
    ClientBuilder, ClientEvent, ConnectionConfig, ConnectionState, InitializeOptions, TetherClient,
};
pub use tether_core::{Error, JsonRpcMessage, Result};
