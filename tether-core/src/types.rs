//! JSON-RPC message model
//!
//! Four envelope shapes travel over a session:
//!
//! 1. **Request**: `method` + `id`, expects an answer
//! 2. **Notification**: `method` without `id`, fire-and-forget
//! 3. **Response**: `id` + `result`
//! 4. **Error**: `error` object, `id` when the peer could determine one
//!
//! Both sides may send requests. A remote agent asks the client for
//! approvals with the same envelope the client uses to start a turn, so
//! none of these types is tied to a direction.
//!
//! Params and results are plain `serde_json::Value`s; this crate does not
//! model what methods exist.
//!
//! The `jsonrpc` version tag is not stored on the messages. Whether it is
//! written out is an encoding choice (see [`crate::codec::EncodeOptions`]).

use crate::error::JsonRpcErrorData;
use serde::{Deserialize, Serialize};
use std::fmt;

/// JSON-RPC message identifier
///
/// Strings and integers are distinct keys: `Id::String("1")` and
/// `Id::Number(1)` are never equal and hash differently, so a response is
/// only correlated with a request whose id has the same shape.
///
/// # Examples
///
/// ```rust
/// use tether_core::Id;
///
/// let text: Id = "req-7".into();
/// let number: Id = 7i64.into();
///
/// assert_ne!(Id::from("7"), number);
/// assert_eq!(text.to_string(), "\"req-7\"");
/// assert_eq!(number.to_string(), "7");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    /// String identifier
    String(String),
    /// Integer identifier
    Number(i64),
}

impl Id {
    /// Convert a JSON value into an id, if it has an id shape
    ///
    /// Floats, booleans, `null` and containers are rejected.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) => Some(Id::String(s.clone())),
            serde_json::Value::Number(n) => n.as_i64().map(Id::Number),
            _ => None,
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::String(s) => write!(f, "\"{}\"", s),
            Id::Number(n) => write!(f, "{}", n),
        }
    }
}

impl From<String> for Id {
    fn from(s: String) -> Self {
        Id::String(s)
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Id::String(s.to_string())
    }
}

impl From<i64> for Id {
    fn from(n: i64) -> Self {
        Id::Number(n)
    }
}

/// Request: a call that expects a response with the same `id`
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcRequest {
    /// Correlation id
    pub id: Id,
    /// Remote method name
    pub method: String,
    /// Parameters, omitted from the wire when `None`
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a request
    ///
    /// ```rust
    /// use tether_core::{Id, JsonRpcRequest};
    /// use serde_json::json;
    ///
    /// let request = JsonRpcRequest::new(Id::Number(1), "thread/list", Some(json!({})));
    /// assert_eq!(request.method, "thread/list");
    /// ```
    pub fn new(id: Id, method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }
}

/// Notification: a one-way call with no `id`
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcNotification {
    /// Method or event name
    pub method: String,
    /// Event payload, omitted from the wire when `None`
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    /// Create a notification
    pub fn new(method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// Successful response to a request
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcResponse {
    /// Id of the request being answered
    pub id: Id,
    /// Result payload (`null` when the peer omitted it)
    pub result: serde_json::Value,
}

impl JsonRpcResponse {
    /// Create a response
    pub fn new(id: Id, result: serde_json::Value) -> Self {
        Self { id, result }
    }
}

/// Error response
///
/// `id` is `None` when the peer could not tell which request failed
/// (typically a parse error) and wrote `"id": null` or left it out.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcError {
    /// Id of the failed request, if known
    pub id: Option<Id>,
    /// Error object
    pub error: JsonRpcErrorData,
}

impl JsonRpcError {
    /// Create an error response
    pub fn new(id: Option<Id>, error: JsonRpcErrorData) -> Self {
        Self { id, error }
    }
}

/// Any decoded JSON-RPC envelope
///
/// Produced by [`crate::codec::decode`] according to its precedence list.
///
/// ```rust
/// use tether_core::{codec, JsonRpcMessage};
///
/// let message = codec::decode_str(r#"{"jsonrpc":"2.0","method":"turn/started","params":{}}"#).unwrap();
/// match message {
///     JsonRpcMessage::Notification(n) => assert_eq!(n.method, "turn/started"),
///     other => panic!("unexpected {:?}", other),
/// }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    /// Call expecting an answer
    Request(JsonRpcRequest),
    /// One-way call
    Notification(JsonRpcNotification),
    /// Successful answer
    Response(JsonRpcResponse),
    /// Failed answer
    Error(JsonRpcError),
}

impl JsonRpcMessage {
    /// The message id, if the envelope carries one
    pub fn id(&self) -> Option<&Id> {
        match self {
            JsonRpcMessage::Request(r) => Some(&r.id),
            JsonRpcMessage::Notification(_) => None,
            JsonRpcMessage::Response(r) => Some(&r.id),
            JsonRpcMessage::Error(e) => e.id.as_ref(),
        }
    }

    /// The method name for requests and notifications
    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request(r) => Some(&r.method),
            JsonRpcMessage::Notification(n) => Some(&n.method),
            _ => None,
        }
    }

    /// Check if this message is a request
    pub fn is_request(&self) -> bool {
        matches!(self, JsonRpcMessage::Request(_))
    }

    /// Check if this message is a notification
    pub fn is_notification(&self) -> bool {
        matches!(self, JsonRpcMessage::Notification(_))
    }

    /// Check if this message answers a request (success or error)
    pub fn is_reply(&self) -> bool {
        matches!(self, JsonRpcMessage::Response(_) | JsonRpcMessage::Error(_))
    }
}

impl From<JsonRpcRequest> for JsonRpcMessage {
    fn from(r: JsonRpcRequest) -> Self {
        JsonRpcMessage::Request(r)
    }
}

impl From<JsonRpcNotification> for JsonRpcMessage {
    fn from(n: JsonRpcNotification) -> Self {
        JsonRpcMessage::Notification(n)
    }
}

impl From<JsonRpcResponse> for JsonRpcMessage {
    fn from(r: JsonRpcResponse) -> Self {
        JsonRpcMessage::Response(r)
    }
}

impl From<JsonRpcError> for JsonRpcMessage {
    fn from(e: JsonRpcError) -> Self {
        JsonRpcMessage::Error(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn test_id_display() {
        assert_eq!(Id::String("test".to_string()).to_string(), "\"test\"");
        assert_eq!(Id::Number(42).to_string(), "42");
    }

    #[test]
    fn test_string_and_number_ids_are_disjoint() {
        let mut ids = HashSet::new();
        ids.insert(Id::from("1"));
        ids.insert(Id::from(1i64));

        assert_eq!(ids.len(), 2);
        assert_ne!(Id::from("1"), Id::from(1i64));
    }

    #[test]
    fn test_id_from_value() {
        assert_eq!(Id::from_value(&json!(5)), Some(Id::Number(5)));
        assert_eq!(Id::from_value(&json!("abc")), Some(Id::String("abc".into())));
        assert_eq!(Id::from_value(&json!(1.5)), None);
        assert_eq!(Id::from_value(&json!(null)), None);
        assert_eq!(Id::from_value(&json!([1])), None);
    }

    #[test]
    fn test_id_serde_is_untagged() {
        assert_eq!(serde_json::to_string(&Id::Number(3)).unwrap(), "3");
        assert_eq!(serde_json::to_string(&Id::from("x")).unwrap(), "\"x\"");
        assert_eq!(serde_json::from_str::<Id>("\"9\"").unwrap(), Id::from("9"));
    }

    #[test]
    fn test_message_accessors() {
        let request: JsonRpcMessage = JsonRpcRequest::new(Id::Number(1), "initialize", None).into();
        assert!(request.is_request());
        assert_eq!(request.id(), Some(&Id::Number(1)));
        assert_eq!(request.method(), Some("initialize"));

        let notification: JsonRpcMessage = JsonRpcNotification::new("turn/completed", None).into();
        assert!(notification.is_notification());
        assert_eq!(notification.id(), None);

        let error: JsonRpcMessage =
            JsonRpcError::new(None, JsonRpcErrorData::parse_error()).into();
        assert!(error.is_reply());
        assert_eq!(error.id(), None);
        assert_eq!(error.method(), None);
    }
}
