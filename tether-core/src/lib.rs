//! Wire-level building blocks for tether
//!
//! This crate has no I/O. It contains:
//!
//! - **Types**: the JSON-RPC message model ([`JsonRpcMessage`] and friends)
//! - **Codec**: envelope encoding and decoding with a fixed precedence list
//! - **Framing**: [`FrameExtractor`], which turns arbitrary WebSocket payload
//!   chunks into whole messages
//! - **Errors**: the [`Error`] taxonomy shared by every tether crate
//! - **Observability**: subscriber and OpenTelemetry bootstrap
//!
//! The transport, request correlation and reconnect logic live in
//! `tether-client`.
//!
//! # Example
//!
//! ```rust
//! use tether_core::{codec, FrameExtractor, Id, JsonRpcMessage, JsonRpcRequest};
//!
//! let request = JsonRpcRequest::new(Id::Number(1), "thread/list", None);
//! let text = codec::encode(&request.into()).unwrap();
//! assert_eq!(text, r#"{"jsonrpc":"2.0","id":1,"method":"thread/list"}"#);
//!
//! let mut extractor = FrameExtractor::new();
//! let chunk = format!("{}\n{}\n", r#"{"id":1,"result":[]}"#, r#"{"method":"turn/started"}"#);
//! let messages: Vec<JsonRpcMessage> = extractor
//!     .push(chunk.as_bytes())
//!     .collect::<Result<_, _>>()
//!     .unwrap();
//! assert_eq!(messages.len(), 2);
//! ```

pub mod codec;
pub mod error;
pub mod framing;
pub mod observability;
pub mod types;

pub use codec::EncodeOptions;
pub use error::{Error, ErrorCode, JsonRpcErrorData, Result};
pub use framing::{FrameExtractor, Frames};
pub use observability::{init_observability, shutdown_observability, ObservabilityConfig};
pub use types::{
    Id, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};
