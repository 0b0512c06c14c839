//! Error types for tether
//!
//! Two layers of errors live here:
//!
//! - **Error**: the engine-level taxonomy every operation returns
//! - **JsonRpcErrorData**: the wire-format error object a peer sends back
//!
//! # Error Taxonomy
//!
//! | Variant | Raised when | Fatal to |
//! |---|---|---|
//! | `Disconnected` | no live socket, or the connection dropped while waiting | the call |
//! | `EncodingFailed` | an outbound message cannot be serialized | the call |
//! | `DecodingFailed` | an inbound frame is not a JSON-RPC envelope | nothing (frame skipped) |
//! | `Rpc` | the peer answered a request with an error object | the request |
//! | `NetworkOffline` | reachability reports the network as unavailable | the connection |
//! | `Timeout` | a bounded wait (health check, connect-and-wait) expired | the call |
//!
//! Transport failures carry their detail in `WebSocket` or `Closed`.
//! `InvalidConfig` and `Storage` cover setup problems outside the session.
//!
//! # Wire Error Codes
//!
//! JSON-RPC 2.0 reserves these codes, mapped onto [`ErrorCode`]:
//! - `-32700`: Parse error
//! - `-32600`: Invalid request
//! - `-32601`: Method not found
//! - `-32602`: Invalid params
//! - `-32603`: Internal error
//!
//! Every other code decodes as `ErrorCode::ServerError(code)` so the raw
//! value survives a round trip.
//!
//! # Examples
//!
//! ```rust
//! use tether_core::{ErrorCode, JsonRpcErrorData};
//!
//! let error = JsonRpcErrorData::method_not_found("thread/list");
//! assert_eq!(error.code, ErrorCode::MethodNotFound);
//! assert_eq!(error.code.as_i64(), -32601);
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for tether operations
pub type Result<T> = std::result::Result<T, Error>;

/// Engine-level error type
///
/// `Clone` so a single transport failure can be handed to every pending
/// request and every listener.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// No live connection, or the connection went away mid-request
    #[error("Not connected")]
    Disconnected,

    /// Outbound message could not be serialized
    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    /// Inbound frame is not a usable JSON-RPC message
    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    /// The peer's own JSON-RPC error for a specific request
    #[error("JSON-RPC error: {0}")]
    Rpc(#[from] JsonRpcErrorData),

    /// Network reachability reported offline
    #[error("Network offline")]
    NetworkOffline,

    /// A bounded wait expired
    #[error("Operation timed out")]
    Timeout,

    /// WebSocket handshake or I/O failure
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The socket was closed without a local `disconnect()`
    #[error("Connection closed ({code}): {reason}")]
    Closed {
        /// Close code from the close frame, 1006 when none was received
        code: u16,
        /// Close reason text
        reason: String,
    },

    /// Endpoint or header values that cannot be used for a handshake
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The client store could not be read or written
    #[error("Storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Whether this error describes a lost or missing transport
    ///
    /// These are the errors that feed the reconnect policy.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Disconnected
                | Error::NetworkOffline
                | Error::WebSocket(_)
                | Error::Closed { .. }
        )
    }

    /// Short label used for metric attributes and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Disconnected => "disconnected",
            Error::EncodingFailed(_) => "encoding_failed",
            Error::DecodingFailed(_) => "decoding_failed",
            Error::Rpc(_) => "rpc",
            Error::NetworkOffline => "network_offline",
            Error::Timeout => "timeout",
            Error::WebSocket(_) => "websocket",
            Error::Closed { .. } => "closed",
            Error::InvalidConfig(_) => "invalid_config",
            Error::Storage(_) => "storage",
        }
    }
}

/// JSON-RPC error code taxonomy
///
/// Serialized as the bare integer. Codes outside the five reserved values
/// land in `ServerError` unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum ErrorCode {
    /// -32700
    ParseError,
    /// -32600
    InvalidRequest,
    /// -32601
    MethodNotFound,
    /// -32602
    InvalidParams,
    /// -32603
    InternalError,
    /// Any other code, carried verbatim
    ServerError(i64),
}

impl ErrorCode {
    /// The integer that goes on the wire
    pub fn as_i64(self) -> i64 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::ServerError(code) => code,
        }
    }
}

impl From<i64> for ErrorCode {
    fn from(code: i64) -> Self {
        match code {
            -32700 => ErrorCode::ParseError,
            -32600 => ErrorCode::InvalidRequest,
            -32601 => ErrorCode::MethodNotFound,
            -32602 => ErrorCode::InvalidParams,
            -32603 => ErrorCode::InternalError,
            other => ErrorCode::ServerError(other),
        }
    }
}

impl From<i32> for ErrorCode {
    fn from(code: i32) -> Self {
        ErrorCode::from(code as i64)
    }
}

impl From<ErrorCode> for i64 {
    fn from(code: ErrorCode) -> Self {
        code.as_i64()
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_i64())
    }
}

/// JSON-RPC 2.0 error object as it appears under `"error"`
///
/// # Examples
///
/// ```rust
/// use tether_core::JsonRpcErrorData;
/// use serde_json::json;
///
/// let custom = JsonRpcErrorData::with_data(
///     -32001,
///     "Thread not found",
///     json!({"threadId": "t-1"})
/// );
/// assert_eq!(custom.code.as_i64(), -32001);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorData {
    /// Error code
    pub code: ErrorCode,

    /// Human-readable description
    #[serde(default)]
    pub message: String,

    /// Optional structured detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcErrorData {
    /// Create an error with code and message
    pub fn new(code: impl Into<ErrorCode>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    /// Create an error carrying additional data
    pub fn with_data(
        code: impl Into<ErrorCode>,
        message: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: Some(data),
        }
    }

    /// Parse error (-32700)
    pub fn parse_error() -> Self {
        Self::new(ErrorCode::ParseError, "Parse error")
    }

    /// Invalid request (-32600)
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, msg)
    }

    /// Method not found (-32601)
    ///
    /// ```rust
    /// use tether_core::JsonRpcErrorData;
    ///
    /// let error = JsonRpcErrorData::method_not_found("turn/start");
    /// assert_eq!(error.message, "Method not found: turn/start");
    /// ```
    pub fn method_not_found(method: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::MethodNotFound,
            format!("Method not found: {}", method.into()),
        )
    }

    /// Invalid params (-32602)
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParams, msg)
    }

    /// Internal error (-32603)
    pub fn internal_error(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, msg)
    }
}

impl std::fmt::Display for JsonRpcErrorData {
    /// Formats as "[code] message", e.g. "[-32601] Method not found: x"
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for JsonRpcErrorData {}
