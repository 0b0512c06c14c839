//! A single WebSocket connection
//!
//! [`Connection`] owns one socket for its whole life and is never reused:
//! the manager builds a fresh one for every attempt. It runs up to two
//! background tasks while connected:
//!
//! - **receive**: frames → [`FrameExtractor`] → [`ConnectionEvent::Message`]
//! - **heartbeat**: a transport ping every `ping_interval`, if configured
//!
//! Both tasks are aborted by [`Connection::disconnect`] (which waits for
//! them to finish) and by `Drop`.
//!
//! Everything observable about the connection goes out on one unbounded
//! channel, in order: state changes, decoded messages and per-frame
//! decoding errors. A transport failure shows up exactly once, as
//! `StateChanged(Failed(error))`.

use crate::config::ConnectionConfig;
use crate::connection_state::ConnectionState;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_core::{codec, Error, FrameExtractor, JsonRpcMessage, Result};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Close code reported when the stream ends without a close frame
const ABNORMAL_CLOSURE: u16 = 1006;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Something that happened on a connection
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The connection moved to a new state
    StateChanged(ConnectionState),
    /// A complete inbound message
    Message(JsonRpcMessage),
    /// A non-fatal problem, such as a frame that did not decode
    Error(Error),
}

struct Inner {
    config: ConnectionConfig,
    extra_headers: Vec<(String, String)>,
    state: Mutex<ConnectionState>,
    sink: Mutex<Option<WsSink>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    pong_waiters: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    next_ping: AtomicU64,
}

/// One WebSocket connection and its background tasks
pub struct Connection {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Create a disconnected connection
    ///
    /// `extra_headers` are added to the handshake after the configured
    /// ones. Events arrive on the returned receiver.
    pub fn new(
        config: ConnectionConfig,
        extra_headers: Vec<(String, String)>,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();

        let connection = Self {
            inner: Arc::new(Inner {
                config,
                extra_headers,
                state: Mutex::new(ConnectionState::Disconnected),
                sink: Mutex::new(None),
                events,
                pong_waiters: Mutex::new(HashMap::new()),
                next_ping: AtomicU64::new(1),
            }),
            tasks: Mutex::new(Vec::new()),
        };

        (connection, rx)
    }

    /// Current state
    pub async fn state(&self) -> ConnectionState {
        self.inner.state.lock().await.clone()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Open the socket
    ///
    /// Does nothing unless the connection is `Disconnected`. Resolves once
    /// the handshake has completed or failed; a failure also leaves the
    /// connection in `Failed`.
    #[tracing::instrument(skip(self), fields(endpoint = %self.inner.config.endpoint()))]
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().await;
            if !matches!(*state, ConnectionState::Disconnected) {
                tracing::debug!(state = %*state, "Connect ignored");
                return Ok(());
            }
            *state = ConnectionState::Connecting;
            let _ = self
                .inner
                .events
                .send(ConnectionEvent::StateChanged(ConnectionState::Connecting));
        }

        let request = match self.inner.handshake_request().await {
            Ok(request) => request,
            Err(e) => {
                self.inner.fail(e.clone()).await;
                return Err(e);
            }
        };

        tracing::debug!("Opening WebSocket");
        let ws_stream = match connect_async(request).await {
            Ok((ws_stream, _response)) => ws_stream,
            Err(e) => {
                let error = Error::WebSocket(e.to_string());
                tracing::warn!(error = %error, "WebSocket handshake failed");
                self.inner.fail(error.clone()).await;
                return Err(error);
            }
        };

        let (sink, source) = ws_stream.split();

        // Held until the tasks are registered so a concurrent disconnect()
        // either sees them or sees this connection as no longer Connecting.
        let mut tasks = self.tasks.lock().await;
        {
            let mut state = self.inner.state.lock().await;
            if !matches!(*state, ConnectionState::Connecting) {
                // disconnect() won the race; discard the socket.
                drop(state);
                let mut sink = sink;
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
                return Err(Error::Disconnected);
            }

            *self.inner.sink.lock().await = Some(sink);
            *state = ConnectionState::Connected;
            let _ = self
                .inner
                .events
                .send(ConnectionEvent::StateChanged(ConnectionState::Connected));
        }

        tasks.push(tokio::spawn(receive_loop(self.inner.clone(), source)));
        if let Some(period) = self.inner.config.ping_interval() {
            tasks.push(tokio::spawn(heartbeat_loop(self.inner.clone(), period)));
        }

        drop(tasks);

        tracing::info!("Connected");
        Ok(())
    }

    /// Stop the background tasks, close the socket and become `Disconnected`
    ///
    /// Safe to call in any state, including more than once.
    #[tracing::instrument(skip(self), fields(endpoint = %self.inner.config.endpoint()))]
    pub async fn disconnect(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().await);
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }

        let sink = self.inner.sink.lock().await.take();
        if let Some(mut sink) = sink {
            if tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await.is_err() {
                tracing::debug!("Close frame not flushed in time");
            }
        }

        self.inner.pong_waiters.lock().await.clear();
        self.inner.set_state(ConnectionState::Disconnected).await;
    }

    /// Encode and send a message
    ///
    /// Fails with `Disconnected` when there is no open socket and with
    /// `EncodingFailed` when the message cannot be serialized.
    pub async fn send(&self, message: &JsonRpcMessage) -> Result<()> {
        let mut sink = self.inner.sink.lock().await;
        if sink.is_none() {
            return Err(Error::Disconnected);
        }

        let mut text = codec::encode_with(message, self.inner.config.encode_options())?;
        if self.inner.config.append_newline() {
            text.push('\n');
        }

        tracing::debug!(bytes = text.len(), method = ?message.method(), id = ?message.id(), "Sending");

        let result = match sink.as_mut() {
            Some(sink) => sink.send(Message::Text(text)).await,
            None => return Err(Error::Disconnected),
        };
        drop(sink);

        if let Err(e) = result {
            let error = Error::WebSocket(e.to_string());
            self.inner.fail(error.clone()).await;
            return Err(error);
        }
        Ok(())
    }

    /// Send a transport ping and wait for its pong
    ///
    /// Has no timeout of its own. Fails with `Disconnected` if the
    /// connection goes away first.
    pub async fn ping(&self) -> Result<()> {
        let payload = self.inner.next_ping.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pong_waiters.lock().await.insert(payload, tx);

        if let Err(e) = self
            .inner
            .send_frame(Message::Ping(payload.to_be_bytes().to_vec()))
            .await
        {
            self.inner.pong_waiters.lock().await.remove(&payload);
            return Err(e);
        }

        rx.await.map_err(|_| Error::Disconnected)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}

impl Inner {
    async fn set_state(&self, new_state: ConnectionState) {
        let mut state = self.state.lock().await;
        if *state == new_state {
            return;
        }
        *state = new_state.clone();
        let _ = self.events.send(ConnectionEvent::StateChanged(new_state));
    }

    /// Move to `Failed` unless the connection is already down
    async fn fail(&self, error: Error) {
        {
            let mut state = self.state.lock().await;
            if matches!(
                *state,
                ConnectionState::Disconnected | ConnectionState::Failed(_)
            ) {
                return;
            }
            tracing::warn!(error = %error, "Connection failed");
            *state = ConnectionState::Failed(error.clone());
            let _ = self
                .events
                .send(ConnectionEvent::StateChanged(ConnectionState::Failed(error)));
        }

        self.sink.lock().await.take();
        self.pong_waiters.lock().await.clear();
    }

    async fn send_frame(&self, frame: Message) -> Result<()> {
        let result = {
            let mut sink = self.sink.lock().await;
            match sink.as_mut() {
                Some(sink) => sink.send(frame).await,
                None => return Err(Error::Disconnected),
            }
        };

        if let Err(e) = result {
            let error = Error::WebSocket(e.to_string());
            self.fail(error.clone()).await;
            return Err(error);
        }
        Ok(())
    }

    async fn handshake_request(&self) -> Result<Request> {
        let mut request = self
            .config
            .endpoint()
            .into_client_request()
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", self.config.endpoint(), e)))?;

        let headers = request.headers_mut();

        if let Some(provider) = self.config.token_provider() {
            match provider.token().await {
                Ok(token) => insert_header(headers, "Authorization", &format!("Bearer {}", token))?,
                Err(e) => {
                    tracing::warn!(error = %e, "Token provider failed, connecting without credentials")
                }
            }
        }

        for (name, value) in self.config.headers().iter().chain(&self.extra_headers) {
            insert_header(headers, name, value)?;
        }

        Ok(request)
    }

    async fn resolve_pong(&self, payload: &[u8]) {
        let Ok(bytes) = <[u8; 8]>::try_from(payload) else {
            return;
        };
        if let Some(tx) = self.pong_waiters.lock().await.remove(&u64::from_be_bytes(bytes)) {
            let _ = tx.send(());
        }
    }

    fn dispatch(&self, extractor: &mut FrameExtractor, chunk: &[u8]) {
        for item in extractor.push(chunk) {
            let event = match item {
                Ok(message) => ConnectionEvent::Message(message),
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping undecodable frame");
                    ConnectionEvent::Error(e)
                }
            };
            let _ = self.events.send(event);
        }
    }
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) -> Result<()> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| Error::InvalidConfig(format!("header name {:?}: {}", name, e)))?;
    let value = HeaderValue::from_str(value)
        .map_err(|e| Error::InvalidConfig(format!("header {}: {}", name, e)))?;
    headers.insert(name, value);
    Ok(())
}

fn closed_error(frame: Option<CloseFrame<'_>>) -> Error {
    match frame {
        Some(frame) => Error::Closed {
            code: u16::from(frame.code),
            reason: frame.reason.into_owned(),
        },
        None => Error::Closed {
            code: ABNORMAL_CLOSURE,
            reason: String::new(),
        },
    }
}

async fn receive_loop(inner: Arc<Inner>, mut source: WsSource) {
    let mut extractor = FrameExtractor::with_max_buffer_size(inner.config.max_frame_buffer());

    let error = loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => inner.dispatch(&mut extractor, text.as_bytes()),
            Some(Ok(Message::Binary(data))) => inner.dispatch(&mut extractor, &data),
            Some(Ok(Message::Pong(payload))) => inner.resolve_pong(&payload).await,
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => {}
            Some(Ok(Message::Close(frame))) => {
                tracing::info!(frame = ?frame, "Connection closed by peer");
                break closed_error(frame);
            }
            Some(Err(e)) => break Error::WebSocket(e.to_string()),
            None => {
                break Error::Closed {
                    code: ABNORMAL_CLOSURE,
                    reason: "stream ended".to_string(),
                }
            }
        }
    };

    inner.fail(error).await;
}

async fn heartbeat_loop(inner: Arc<Inner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if let Err(e) = inner.send_frame(Message::Ping(Vec::new())).await {
            tracing::warn!(error = %e, "Heartbeat ping failed");
            break;
        }
        tracing::trace!("Heartbeat ping sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_without_socket_is_disconnected() {
        let (connection, _rx) = Connection::new(ConnectionConfig::new("ws://127.0.0.1:1"), vec![]);
        let message: JsonRpcMessage = tether_core::JsonRpcNotification::new("x", None).into();

        assert!(matches!(connection.send(&message).await, Err(Error::Disconnected)));
        assert!(matches!(connection.ping().await, Err(Error::Disconnected)));
    }

    #[tokio::test]
    async fn test_disconnect_without_socket() {
        let (connection, mut rx) = Connection::new(ConnectionConfig::new("ws://127.0.0.1:1"), vec![]);

        connection.disconnect().await;
        assert_eq!(connection.state().await, ConnectionState::Disconnected);
        // Already disconnected, so nothing is reported.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_endpoint_fails() {
        let (connection, mut rx) = Connection::new(ConnectionConfig::new("not a url"), vec![]);

        let result = connection.connect().await;
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
        assert!(matches!(connection.state().await, ConnectionState::Failed(_)));

        assert!(matches!(
            rx.recv().await,
            Some(ConnectionEvent::StateChanged(ConnectionState::Connecting))
        ));
        assert!(matches!(
            rx.recv().await,
            Some(ConnectionEvent::StateChanged(ConnectionState::Failed(Error::InvalidConfig(_))))
        ));
    }

    #[tokio::test]
    async fn test_invalid_header_fails() {
        let config = ConnectionConfig::new("ws://127.0.0.1:1").with_header("Bad Header", "x");
        let (connection, _rx) = Connection::new(config, vec![]);

        assert!(matches!(connection.connect().await, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_connect_is_noop_unless_disconnected() {
        let (connection, _rx) = Connection::new(ConnectionConfig::new("not a url"), vec![]);
        let _ = connection.connect().await;

        // Failed now; a second connect must not try again.
        assert!(connection.connect().await.is_ok());
        assert!(matches!(connection.state().await, ConnectionState::Failed(_)));
    }

    #[test]
    fn test_closed_error_mapping() {
        use std::borrow::Cow;
        use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

        let error = closed_error(Some(CloseFrame {
            code: CloseCode::Away,
            reason: Cow::Borrowed("bye"),
        }));
        assert!(matches!(error, Error::Closed { code: 1001, ref reason } if reason == "bye"));

        assert!(matches!(closed_error(None), Error::Closed { code: 1006, .. }));
    }
}
