//! Encoding and decoding of JSON-RPC envelopes
//!
//! # Decoding
//!
//! Peers are not always strict about the envelope. Some omit the
//! `"jsonrpc":"2.0"` tag, some send both `method` and `error`. [`decode`]
//! classifies an object with a fixed priority list so every reader agrees
//! on ambiguous input:
//!
//! 1. `method` and `id` present → [`JsonRpcMessage::Request`]
//! 2. `method` present → [`JsonRpcMessage::Notification`]
//! 3. `error` present → [`JsonRpcMessage::Error`]
//! 4. `id` present → [`JsonRpcMessage::Response`]
//! 5. anything else → [`Error::DecodingFailed`]
//!
//! The `jsonrpc` field is ignored when decoding.
//!
//! # Encoding
//!
//! Field order is fixed (`jsonrpc`, `id`, then `method`/`params`, `result`
//! or `error`) so output is stable. [`EncodeOptions`] controls the two
//! peer-compatibility knobs: whether the version tag is written, and
//! whether `/` is escaped as `\/`.
//!
//! # Examples
//!
//! ```rust
//! use tether_core::{codec, Id, JsonRpcRequest};
//! use serde_json::json;
//!
//! let request = JsonRpcRequest::new(Id::Number(1), "initialize", Some(json!({})));
//! let text = codec::encode(&request.into()).unwrap();
//! assert_eq!(text, r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#);
//!
//! let decoded = codec::decode(text.as_bytes()).unwrap();
//! assert!(decoded.is_request());
//! ```

use crate::error::{Error, JsonRpcErrorData, Result};
use crate::types::{
    Id, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};
use serde::Serialize;
use serde_json::Value;

/// The version tag written when `include_jsonrpc_header` is set
pub const JSONRPC_VERSION: &str = "2.0";

/// Output options for [`encode_with`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    /// Write `"jsonrpc":"2.0"` into every envelope
    pub include_jsonrpc_header: bool,
    /// Escape `/` as `\/` inside strings
    pub escape_forward_slashes: bool,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            include_jsonrpc_header: true,
            escape_forward_slashes: false,
        }
    }
}

impl EncodeOptions {
    /// Omit the version tag (for peers that reject it)
    pub fn without_jsonrpc_header(mut self) -> Self {
        self.include_jsonrpc_header = false;
        self
    }

    /// Escape forward slashes in the output
    pub fn with_escaped_slashes(mut self) -> Self {
        self.escape_forward_slashes = true;
        self
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    jsonrpc: Option<&'static str>,
    id: &'a Id,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
}

#[derive(Serialize)]
struct WireNotification<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    jsonrpc: Option<&'static str>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
}

#[derive(Serialize)]
struct WireResponse<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    jsonrpc: Option<&'static str>,
    id: &'a Id,
    result: &'a Value,
}

#[derive(Serialize)]
struct WireError<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    jsonrpc: Option<&'static str>,
    // Always written; `null` when unknown.
    id: Option<&'a Id>,
    error: &'a JsonRpcErrorData,
}

/// Encode a message with default options (version tag, unescaped slashes)
pub fn encode(message: &JsonRpcMessage) -> Result<String> {
    encode_with(message, &EncodeOptions::default())
}

/// Encode a message to a JSON string
///
/// # Errors
///
/// `Error::EncodingFailed` if serde cannot serialize a payload.
pub fn encode_with(message: &JsonRpcMessage, options: &EncodeOptions) -> Result<String> {
    let jsonrpc = options.include_jsonrpc_header.then_some(JSONRPC_VERSION);

    let encoded = match message {
        JsonRpcMessage::Request(r) => serde_json::to_string(&WireRequest {
            jsonrpc,
            id: &r.id,
            method: &r.method,
            params: r.params.as_ref(),
        }),
        JsonRpcMessage::Notification(n) => serde_json::to_string(&WireNotification {
            jsonrpc,
            method: &n.method,
            params: n.params.as_ref(),
        }),
        JsonRpcMessage::Response(r) => serde_json::to_string(&WireResponse {
            jsonrpc,
            id: &r.id,
            result: &r.result,
        }),
        JsonRpcMessage::Error(e) => serde_json::to_string(&WireError {
            jsonrpc,
            id: e.id.as_ref(),
            error: &e.error,
        }),
    }
    .map_err(|e| Error::EncodingFailed(e.to_string()))?;

    if options.escape_forward_slashes {
        // `/` is not a structural JSON character, so every occurrence is
        // inside a string literal.
        Ok(encoded.replace('/', "\\/"))
    } else {
        Ok(encoded)
    }
}

/// Decode raw bytes into a message
///
/// Leading and trailing whitespace is tolerated; anything else around the
/// document is a decoding failure.
pub fn decode(data: &[u8]) -> Result<JsonRpcMessage> {
    let value: Value =
        serde_json::from_slice(data).map_err(|e| Error::DecodingFailed(e.to_string()))?;
    decode_value(value)
}

/// Decode a string into a message
pub fn decode_str(data: &str) -> Result<JsonRpcMessage> {
    decode(data.as_bytes())
}

/// Classify an already parsed JSON value
///
/// See the module docs for the precedence list.
pub fn decode_value(value: Value) -> Result<JsonRpcMessage> {
    let Value::Object(mut object) = value else {
        return Err(Error::DecodingFailed(
            "JSON-RPC message must be an object".to_string(),
        ));
    };

    let id = match object.remove("id") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(Id::from_value(&raw).ok_or_else(|| {
            Error::DecodingFailed(format!("id must be a string or integer, got {}", raw))
        })?),
    };

    if let Some(method) = object.remove("method") {
        let Value::String(method) = method else {
            return Err(Error::DecodingFailed("method must be a string".to_string()));
        };
        let params = object.remove("params");

        return Ok(match id {
            Some(id) => JsonRpcMessage::Request(JsonRpcRequest { id, method, params }),
            None => JsonRpcMessage::Notification(JsonRpcNotification { method, params }),
        });
    }

    if let Some(error) = object.remove("error") {
        let error: JsonRpcErrorData = serde_json::from_value(error)
            .map_err(|e| Error::DecodingFailed(format!("malformed error object: {}", e)))?;
        return Ok(JsonRpcMessage::Error(JsonRpcError { id, error }));
    }

    match id {
        Some(id) => {
            let result = object.remove("result").unwrap_or(Value::Null);
            Ok(JsonRpcMessage::Response(JsonRpcResponse { id, result }))
        }
        None => Err(Error::DecodingFailed(
            "object has none of method, error or id".to_string(),
        )),
    }
}
