//! Common test utilities for tether-client integration tests
//!
//! [`MockWsServer`] stands in for an agent relay. It records the handshake
//! headers of every connection and every text frame it receives, answers
//! through a scripted handler, and can push, stall or kill its live
//! connections on demand.

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_client::{ClientEvent, ConnectionState, TetherClient};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

pub const WAIT: Duration = Duration::from_secs(5);

/// Produces the frames sent back for one inbound message
pub type Handler = Arc<dyn Fn(&Value) -> Vec<String> + Send + Sync>;

enum Command {
    Send(String),
    Stall,
    Kill,
}

struct Shared {
    handler: Handler,
    received: mpsc::UnboundedSender<String>,
    handshakes: Mutex<Vec<HashMap<String, String>>>,
    connections: Mutex<Vec<mpsc::UnboundedSender<Command>>>,
}

/// Mock WebSocket server for client testing
pub struct MockWsServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    received: mpsc::UnboundedReceiver<String>,
    accept_task: JoinHandle<()>,
}

impl MockWsServer {
    /// Start a server that answers every request with
    /// `{"method": <method>, "params": <params>}`
    pub async fn new() -> Self {
        Self::with_handler(echo_request).await
    }

    /// Start a server with a custom handler
    ///
    /// The handler sees every inbound text frame parsed as JSON and returns
    /// the frames to send back, in order.
    pub async fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&Value) -> Vec<String> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (received_tx, received) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            handler: Arc::new(handler),
            received: received_tx,
            handshakes: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
        });

        let accept_shared = shared.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, accept_shared.clone()));
            }
        });

        Self {
            addr,
            shared,
            received,
            accept_task,
        }
    }

    /// Get the WebSocket URL for connecting to this server
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Handshakes completed so far
    pub fn connection_count(&self) -> usize {
        self.shared.handshakes.lock().unwrap().len()
    }

    /// Handshake headers of the `index`th connection, names lowercased
    pub fn handshake_headers(&self, index: usize) -> HashMap<String, String> {
        self.shared.handshakes.lock().unwrap()[index].clone()
    }

    /// Wait for the next text frame the server received
    ///
    /// Returns None if the timeout expires.
    pub async fn wait_for_message(&mut self) -> Option<String> {
        tokio::time::timeout(WAIT, self.received.recv())
            .await
            .ok()
            .flatten()
    }

    /// Wait for the next received frame and parse it
    pub async fn wait_for_json(&mut self) -> Value {
        let text = self
            .wait_for_message()
            .await
            .expect("no message received");
        serde_json::from_str(&text).unwrap()
    }

    /// Send a raw text frame on every live connection
    pub fn push(&self, text: impl Into<String>) {
        let text = text.into();
        self.broadcast(|| Command::Send(text.clone()));
    }

    /// Stop reading on every live connection, so pings go unanswered
    pub fn stall_connections(&self) {
        self.broadcast(|| Command::Stall);
    }

    /// Drop every live connection without a close frame
    pub fn kill_connections(&self) {
        self.broadcast(|| Command::Kill);
        self.shared.connections.lock().unwrap().clear();
    }

    fn broadcast(&self, command: impl Fn() -> Command) {
        self.shared
            .connections
            .lock()
            .unwrap()
            .retain(|tx| tx.send(command()).is_ok());
    }

    /// Stop accepting and drop every live connection
    pub async fn shutdown(self) {
        self.accept_task.abort();
        self.kill_connections();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn serve(stream: TcpStream, shared: Arc<Shared>) {
    // Registered before the handshake so commands sent right after the
    // client sees Connected are not lost.
    let (commands_tx, mut commands) = mpsc::unbounded_channel();
    shared.connections.lock().unwrap().push(commands_tx);

    let capture = shared.clone();
    let callback = move |request: &Request, response: Response| {
        let headers = request
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        capture.handshakes.lock().unwrap().push(headers);
        Ok::<_, ErrorResponse>(response)
    };

    let Ok(ws_stream) = accept_hdr_async(stream, callback).await else {
        return;
    };

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let _ = shared.received.send(text.clone());
                    let parsed: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
                    for reply in (shared.handler)(&parsed) {
                        if write.send(Message::Text(reply)).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
            command = commands.recv() => match command {
                Some(Command::Send(text)) => {
                    if write.send(Message::Text(text)).await.is_err() {
                        return;
                    }
                }
                Some(Command::Stall) => {
                    // Keep the socket open but never read again.
                    while let Some(command) = commands.recv().await {
                        if matches!(command, Command::Kill) {
                            return;
                        }
                    }
                    return;
                }
                Some(Command::Kill) | None => return,
            },
        }
    }
}

/// Reply to every request with its own method and params
pub fn echo_request(message: &Value) -> Vec<String> {
    match (message.get("id"), message.get("method")) {
        (Some(id), Some(method)) => vec![json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {"method": method, "params": message.get("params").cloned().unwrap_or(Value::Null)}
        })
        .to_string()],
        _ => Vec::new(),
    }
}

/// Id of a request, if the message is one
pub fn request_id(message: &Value) -> Option<i64> {
    message.get("method")?;
    message.get("id")?.as_i64()
}

pub fn method_of(message: &Value) -> Option<&str> {
    message.get("method")?.as_str()
}

/// Helper to create a mock JSON-RPC response
pub fn mock_response(id: i64, result: Value) -> String {
    json!({
        "jsonrpc": "2.0",
        "result": result,
        "id": id
    })
    .to_string()
}

/// Helper to create a mock JSON-RPC error response
pub fn mock_error_response(id: i64, code: i32, message: &str) -> String {
    json!({
        "jsonrpc": "2.0",
        "error": {
            "code": code,
            "message": message
        },
        "id": id
    })
    .to_string()
}

/// Helper to create a mock JSON-RPC notification
pub fn mock_notification(method: &str, params: Value) -> String {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params
    })
    .to_string()
}

/// Helper to create a server-initiated request
pub fn mock_server_request(id: i64, method: &str, params: Value) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params
    })
    .to_string()
}

/// Wait for the first event matching `predicate`, skipping others
pub async fn next_event<F>(
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    mut predicate: F,
) -> Option<ClientEvent>
where
    F: FnMut(&ClientEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if predicate(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

/// Wait for a `StateChanged` event with this state
pub async fn next_state(
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    state: ConnectionState,
) -> Option<ConnectionState> {
    match next_event(events, |e| matches!(e, ClientEvent::StateChanged(s) if *s == state)).await {
        Some(ClientEvent::StateChanged(state)) => Some(state),
        _ => None,
    }
}

/// State changes already queued on `events`
pub fn drain_states(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> Vec<ConnectionState> {
    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ClientEvent::StateChanged(state) = event {
            states.push(state);
        }
    }
    states
}

/// Poll `check` until it returns true or the wait runs out
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Wait until `client` has `count` requests in flight
pub async fn wait_for_pending(client: &TetherClient, count: usize) -> bool {
    eventually(|| async move { client.pending_requests().await == count }).await
}

/// Wait until the initialize handshake has completed
pub async fn wait_for_initialized(client: &TetherClient) -> bool {
    eventually(|| async move { client.is_initialized().await }).await
}

/// Wait until `client` is (or is not) connected
pub async fn wait_for_connected(client: &TetherClient, connected: bool) -> bool {
    eventually(|| async move { client.is_connected().await == connected }).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_request_ignores_notifications() {
        let request = json!({"jsonrpc": "2.0", "id": 3, "method": "thread/list"});
        let replies = echo_request(&request);
        assert_eq!(replies.len(), 1);
        let reply: Value = serde_json::from_str(&replies[0]).unwrap();
        assert_eq!(reply["id"], 3);
        assert_eq!(reply["result"]["method"], "thread/list");

        assert!(echo_request(&json!({"method": "initialized"})).is_empty());
    }

    #[test]
    fn test_mock_error_response_format() {
        let response = mock_error_response(1, -32601, "Method not found");
        assert!(response.contains("\"error\""));
        assert!(response.contains("-32601"));
        assert!(response.contains("Method not found"));
    }

    #[test]
    fn test_mock_notification_format() {
        let notification = mock_notification("turn/started", json!({"turnId": "t1"}));
        assert!(notification.contains("\"method\":\"turn/started\""));
        assert!(!notification.contains("\"id\""));
    }
}
