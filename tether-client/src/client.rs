//! The session manager
//!
//! `TetherClient` keeps one logical JSON-RPC session alive on top of a
//! sequence of short-lived [`Connection`]s. It owns:
//!
//! - the request correlation map, shared across reconnects
//! - the reconnect schedule and the network-availability gate
//! - the optional `initialize` handshake
//! - per-connection session bookkeeping ([`SessionTracker`])
//! - the persistent client id sent as `X-Client-Id`
//!
//! # Client Lifecycle
//!
//! 1. **Build**: [`ClientBuilder`](crate::ClientBuilder) loads or creates the client id
//! 2. **Connect**: `connect(config)` stores the config and opens a connection
//! 3. **Use**: requests, notifications, replies to server requests
//! 4. **Recover**: transport failures schedule a reconnect with backoff
//! 5. **Disconnect**: `disconnect()` stops everything until the next `connect`
//!
//! # Generations
//!
//! Every installed connection gets a new generation number. Events carry
//! the generation of the connection they came from and are ignored once
//! that connection has been replaced, so a `disconnect()` followed by an
//! immediate `connect()` never sees late transitions from the old socket.
//!
//! # Cloning
//!
//! `TetherClient` is cheap to clone; all clones share the same session.

use crate::config::ConnectionConfig;
use crate::connection::{Connection, ConnectionEvent};
use crate::connection_state::{ConnectionState, ReconnectSchedule};
use crate::metrics::ClientMetrics;
use crate::notification::NotificationHandler;
use crate::reconnect::ReconnectionStrategy;
use crate::request::RequestManager;
use crate::session::SessionTracker;
use crate::store::{self, ClientStore};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tether_core::{
    Error, Id, JsonRpcError, JsonRpcErrorData, JsonRpcMessage, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, Result,
};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

/// Handshake header carrying the persistent client id
pub const CLIENT_ID_HEADER: &str = "X-Client-Id";

/// How long `verify_connection_health` waits for a pong
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Something a subscriber is told about
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The session moved to a new state
    StateChanged(ConnectionState),
    /// An inbound notification or server-initiated request
    Message(JsonRpcMessage),
    /// A request is about to be written to the socket
    RequestSending { id: Id, method: String },
    /// A transport failure, an undecodable frame, or a failed handshake
    Error(Error),
}

/// Produces the params of the `initialize` request for each connection
pub type InitializeParamsFn = Arc<dyn Fn() -> Option<Value> + Send + Sync>;

/// The handshake sent after every successful connection
#[derive(Clone)]
pub struct InitializeOptions {
    method: String,
    params: InitializeParamsFn,
    initialized_notification: Option<String>,
}

impl InitializeOptions {
    /// Send `initialize` with params from `params`
    pub fn new<F>(params: F) -> Self
    where
        F: Fn() -> Option<Value> + Send + Sync + 'static,
    {
        Self {
            method: "initialize".to_string(),
            params: Arc::new(params),
            initialized_notification: None,
        }
    }

    /// Use a different request method
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Send this notification once the request succeeds
    pub fn with_initialized_notification(mut self, method: impl Into<String>) -> Self {
        self.initialized_notification = Some(method.into());
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn initialized_notification(&self) -> Option<&str> {
        self.initialized_notification.as_deref()
    }

    fn params(&self) -> Option<Value> {
        (self.params)()
    }
}

impl fmt::Debug for InitializeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitializeOptions")
            .field("method", &self.method)
            .field("initialized_notification", &self.initialized_notification)
            .finish_non_exhaustive()
    }
}

/// Everything the builder hands over
pub(crate) struct ClientParts {
    pub(crate) strategy: Box<dyn ReconnectionStrategy>,
    pub(crate) store: Arc<dyn ClientStore>,
    pub(crate) client_id: String,
    pub(crate) metrics: Option<Arc<ClientMetrics>>,
    pub(crate) initialize: Option<InitializeOptions>,
    pub(crate) health_check_timeout: Duration,
    pub(crate) network: Option<watch::Receiver<bool>>,
    pub(crate) auto_reconnect: bool,
}

struct ManagerState {
    state: ConnectionState,
    connection: Option<Arc<Connection>>,
    generation: u64,
    config: Option<ConnectionConfig>,
    /// The caller wants a session: set by connect, cleared by disconnect
    should_reconnect: bool,
    /// Recover without being asked (backoff and network restore)
    auto_reconnect: bool,
    schedule: ReconnectSchedule,
    reconnect_epoch: u64,
    reconnect_task: Option<JoinHandle<()>>,
    network_available: bool,
    is_connecting: bool,
    is_initialized: bool,
    is_initializing: bool,
    sessions: SessionTracker,
    connect_waiters: Vec<oneshot::Sender<Result<()>>>,
}

impl ManagerState {
    /// Drop any scheduled reconnect, including one whose timer already fired
    fn cancel_reconnect(&mut self) {
        self.reconnect_epoch += 1;
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
    }

    /// Forget everything tied to the current connection
    fn reset_connection_scope(&mut self) {
        self.is_connecting = false;
        self.is_initialized = false;
        self.is_initializing = false;
        self.sessions.clear();
    }

    fn resolve_waiters(&mut self, outcome: Result<()>) {
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }
}

struct ClientInner {
    state: Mutex<ManagerState>,
    requests: RequestManager,
    notifications: NotificationHandler,
    listeners: Mutex<Vec<mpsc::UnboundedSender<ClientEvent>>>,
    store: Arc<dyn ClientStore>,
    client_id: String,
    metrics: Option<Arc<ClientMetrics>>,
    initialize: Option<InitializeOptions>,
    health_check_timeout: Duration,
    network_monitor: Mutex<Option<JoinHandle<()>>>,
}

/// A durable JSON-RPC session over WebSocket
#[derive(Clone)]
pub struct TetherClient {
    inner: Arc<ClientInner>,
}

impl TetherClient {
    pub(crate) async fn from_parts(parts: ClientParts) -> Self {
        let network_available = parts
            .network
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or(true);

        let inner = Arc::new(ClientInner {
            state: Mutex::new(ManagerState {
                state: ConnectionState::Disconnected,
                connection: None,
                generation: 0,
                config: None,
                should_reconnect: false,
                auto_reconnect: parts.auto_reconnect,
                schedule: ReconnectSchedule::new(parts.strategy),
                reconnect_epoch: 0,
                reconnect_task: None,
                network_available,
                is_connecting: false,
                is_initialized: false,
                is_initializing: false,
                sessions: SessionTracker::new(),
                connect_waiters: Vec::new(),
            }),
            requests: RequestManager::new(),
            notifications: NotificationHandler::new(),
            listeners: Mutex::new(Vec::new()),
            store: parts.store,
            client_id: parts.client_id,
            metrics: parts.metrics,
            initialize: parts.initialize,
            health_check_timeout: parts.health_check_timeout,
            network_monitor: Mutex::new(None),
        });

        if let Some(m) = &inner.metrics {
            m.update_connection_state(&ConnectionState::Disconnected);
        }

        if let Some(rx) = parts.network {
            let monitor = watch_network(&inner, rx);
            *inner.network_monitor.lock().await = Some(monitor);
        }

        Self { inner }
    }

    /// Connect with `config`
    ///
    /// Tears down any live connection first. Resolves once this attempt
    /// has succeeded or failed; with automatic reconnects enabled a
    /// failure also schedules a reconnect.
    #[tracing::instrument(skip(self, config), fields(endpoint = %config.endpoint()))]
    pub async fn connect(&self, config: ConnectionConfig) -> Result<()> {
        {
            let mut st = self.inner.state.lock().await;
            st.reset_connection_scope();
            st.schedule.reset();
            st.config = Some(config.clone());
            st.should_reconnect = true;
            st.cancel_reconnect();
        }

        self.inner.establish(config).await
    }

    /// `connect`, giving up with `Timeout` after `timeout`
    ///
    /// A timed-out attempt is torn down and treated like any other failed
    /// attempt, including the automatic reconnect if enabled.
    pub async fn connect_and_wait(&self, config: ConnectionConfig, timeout: Duration) -> Result<()> {
        let client = self.clone();
        let attempt = tokio::spawn(async move { client.connect(config).await });

        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Connect task failed");
                Err(Error::Disconnected)
            }
            Err(_) => {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "Connect timed out");
                self.inner.abandon_attempt(Error::Timeout).await;
                Err(Error::Timeout)
            }
        }
    }

    /// Reconnect now with the stored config
    ///
    /// Undoes a `disconnect` and restarts the backoff.
    pub async fn reconnect(&self) -> Result<()> {
        let config = {
            let mut st = self.inner.state.lock().await;
            let Some(config) = st.config.clone() else {
                return Err(Error::Disconnected);
            };
            st.should_reconnect = true;
            st.cancel_reconnect();
            st.schedule.reset();
            config
        };

        tracing::info!("Manual reconnect");
        self.inner.establish(config).await
    }

    /// Close the session and stop reconnecting
    ///
    /// Pending requests fail with `Disconnected` before the socket is
    /// closed. The connection's tasks have stopped when this returns.
    #[tracing::instrument(skip(self))]
    pub async fn disconnect(&self) {
        let connection = {
            let mut st = self.inner.state.lock().await;
            st.should_reconnect = false;
            st.cancel_reconnect();
            st.generation += 1;
            st.reset_connection_scope();
            self.inner
                .set_state(&mut st, ConnectionState::Disconnected)
                .await;
            st.resolve_waiters(Err(Error::Disconnected));
            st.connection.take()
        };

        let failed = self.inner.requests.fail_all(Error::Disconnected).await;
        if failed > 0 {
            tracing::debug!(failed, "Failed pending requests");
        }

        if let Some(connection) = connection {
            connection.disconnect().await;
        }
        tracing::info!("Disconnected");
    }

    /// Check the connection and repair it if needed
    ///
    /// Without a connection this reconnects with the stored config, unless
    /// the caller has disconnected. This is an explicit request, so it runs
    /// even when automatic reconnects are off. With
    /// one, a transport ping must be answered within the health-check
    /// timeout, otherwise the connection is replaced. Returns `Ok(())` when
    /// the session is connected afterwards.
    #[tracing::instrument(skip(self))]
    pub async fn verify_connection_health(&self) -> Result<()> {
        let (connection, config, should_reconnect, connected) = {
            let st = self.inner.state.lock().await;
            (
                st.connection.clone(),
                st.config.clone(),
                st.should_reconnect,
                st.state.is_connected(),
            )
        };

        let Some(connection) = connection else {
            let Some(config) = config.filter(|_| should_reconnect) else {
                return Err(Error::Disconnected);
            };
            tracing::info!("No connection, reconnecting");
            self.inner.state.lock().await.cancel_reconnect();
            return self.inner.establish(config).await;
        };

        if !connected {
            return self
                .wait_until_connected(self.inner.health_check_timeout)
                .await;
        }

        let error = match tokio::time::timeout(self.inner.health_check_timeout, connection.ping()).await
        {
            Ok(Ok(())) => {
                tracing::debug!("Connection healthy");
                return Ok(());
            }
            Ok(Err(e)) => e,
            Err(_) => Error::Timeout,
        };

        tracing::warn!(error = %error, "Health check failed, reconnecting");

        let config = {
            let mut st = self.inner.state.lock().await;
            let current = st
                .connection
                .as_ref()
                .is_some_and(|c| Arc::ptr_eq(c, &connection));
            if !current {
                None
            } else {
                st.cancel_reconnect();
                st.schedule.reset();
                st.config.clone()
            }
        };

        let Some(config) = config else {
            // Someone else already replaced the connection.
            return self
                .wait_until_connected(self.inner.health_check_timeout)
                .await;
        };

        self.inner.emit(ClientEvent::Error(error)).await;
        self.inner.establish(config).await
    }

    /// Wait until the session is connected
    ///
    /// Returns at once when connected. Fails straight away when no attempt
    /// is running or scheduled, with the error of the next failed attempt,
    /// or with `Timeout`.
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<()> {
        let rx = {
            let mut st = self.inner.state.lock().await;
            if st.state.is_connected() {
                return Ok(());
            }
            if !st.is_connecting && st.reconnect_task.is_none() {
                return Err(match &st.state {
                    ConnectionState::Failed(e) => e.clone(),
                    _ => Error::Disconnected,
                });
            }
            let (tx, rx) = oneshot::channel();
            st.connect_waiters.push(tx);
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::Disconnected),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Report a change in network availability
    ///
    /// Losing the network tears the session down as `Failed(NetworkOffline)`
    /// and holds off reconnects. Regaining it reconnects in the background
    /// if a session was wanted and automatic reconnects are enabled.
    pub async fn set_network_available(&self, available: bool) {
        self.inner.network_changed(available).await;
    }

    /// Send a request and wait for its result
    pub async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.inner.send_request(method, params).await
    }

    /// Send a request with typed params and result
    ///
    /// Params that serialize to `null` are omitted from the envelope.
    pub async fn request<P, R>(&self, method: &str, params: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params =
            serde_json::to_value(params).map_err(|e| Error::EncodingFailed(e.to_string()))?;
        let params = (!params.is_null()).then_some(params);

        let result = self.inner.send_request(method, params).await?;
        serde_json::from_value(result).map_err(|e| Error::DecodingFailed(e.to_string()))
    }

    /// Send a notification
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.inner.notify(method, params).await
    }

    /// Answer a server-initiated request
    pub async fn respond(&self, id: Id, result: Value) -> Result<()> {
        self.inner
            .send(JsonRpcResponse::new(id, result).into())
            .await
    }

    /// Answer a server-initiated request with an error
    pub async fn respond_error(&self, id: Id, error: JsonRpcErrorData) -> Result<()> {
        self.inner
            .send(JsonRpcError::new(Some(id), error).into())
            .await
    }

    /// Run the configured `initialize` handshake on the current connection
    ///
    /// Returns `Ok(())` without sending anything if it already ran or is
    /// running. Normally called automatically after every connect.
    pub async fn initialize(&self) -> Result<()> {
        self.inner.initialize().await
    }

    /// Receive every future event on a new channel
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.listeners.lock().await.push(tx);
        rx
    }

    /// Call `handler` for each notification with this method
    pub async fn on_notification<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(JsonRpcNotification) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.notifications.register(method, handler).await;
    }

    pub fn notifications(&self) -> &NotificationHandler {
        &self.inner.notifications
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.state.lock().await.state.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.state.lock().await.state.is_connected()
    }

    pub async fn is_initialized(&self) -> bool {
        self.inner.state.lock().await.is_initialized
    }

    pub async fn is_network_available(&self) -> bool {
        self.inner.state.lock().await.network_available
    }

    /// Persistent id sent as `X-Client-Id`
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Requests still waiting for a reply
    pub async fn pending_requests(&self) -> usize {
        self.inner.requests.pending_count().await
    }

    /// Reconnects scheduled since the last successful connection
    pub async fn reconnect_attempt(&self) -> u32 {
        self.inner.state.lock().await.schedule.attempt()
    }

    /// When a connection last succeeded, as recorded in the store
    pub async fn last_connected_at(&self) -> Result<Option<DateTime<Utc>>> {
        store::last_connected(self.inner.store.as_ref()).await
    }

    pub async fn mark_session_materialized(&self, session_id: &str) {
        self.inner
            .state
            .lock()
            .await
            .sessions
            .mark_materialized(session_id);
    }

    pub async fn is_session_materialized(&self, session_id: &str) -> bool {
        self.inner
            .state
            .lock()
            .await
            .sessions
            .is_materialized(session_id)
    }

    /// Claim the resume of a session on this connection
    ///
    /// `false` means it is already live or being resumed.
    pub async fn begin_session_resume(&self, session_id: &str) -> bool {
        self.inner.state.lock().await.sessions.begin_resume(session_id)
    }

    pub async fn abandon_session_resume(&self, session_id: &str) {
        self.inner
            .state
            .lock()
            .await
            .sessions
            .abandon_resume(session_id);
    }
}

impl ClientInner {
    async fn emit(&self, event: ClientEvent) {
        if let Some(m) = &self.metrics {
            match &event {
                ClientEvent::StateChanged(state) => m.update_connection_state(state),
                ClientEvent::Error(error) => m.record_error(error),
                _ => {}
            }
        }

        self.listeners
            .lock()
            .await
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Change state and tell subscribers
    ///
    /// Repeated states are not reported again, except `Failed`, which is
    /// reported with every new error.
    async fn set_state(&self, st: &mut ManagerState, state: ConnectionState) {
        if st.state == state && !matches!(state, ConnectionState::Failed(_)) {
            return;
        }
        tracing::debug!(from = %st.state, to = %state, "State changed");
        st.state = state.clone();
        self.emit(ClientEvent::StateChanged(state)).await;
    }

    async fn is_current(&self, generation: u64) -> bool {
        self.state.lock().await.generation == generation
    }

    /// Replace any live connection with a new one built from `config`
    async fn establish(self: &Arc<Self>, config: ConnectionConfig) -> Result<()> {
        let (generation, old) = {
            let mut st = self.state.lock().await;
            st.generation += 1;
            st.reset_connection_scope();
            (st.generation, st.connection.take())
        };

        if let Some(old) = old {
            old.disconnect().await;
            self.requests.fail_all(Error::Disconnected).await;
        }

        let (connection, events) = {
            let mut st = self.state.lock().await;
            if st.generation != generation {
                return Err(Error::Disconnected);
            }

            if !st.network_available {
                tracing::warn!("Network offline, not connecting");
                self.set_state(&mut st, ConnectionState::Failed(Error::NetworkOffline))
                    .await;
                self.emit(ClientEvent::Error(Error::NetworkOffline)).await;
                st.resolve_waiters(Err(Error::NetworkOffline));
                return Err(Error::NetworkOffline);
            }

            let (connection, events) = Connection::new(
                config,
                vec![(CLIENT_ID_HEADER.to_string(), self.client_id.clone())],
            );
            let connection = Arc::new(connection);
            st.connection = Some(connection.clone());
            st.is_connecting = true;
            self.set_state(&mut st, ConnectionState::Connecting).await;
            (connection, events)
        };

        match connection.connect().await {
            Ok(()) => self.on_connected(generation, events).await,
            Err(e) => {
                self.on_connection_failed(generation, e.clone()).await;
                Err(e)
            }
        }
    }

    async fn on_connected(
        self: &Arc<Self>,
        generation: u64,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> Result<()> {
        let (reconnected, initialize) = {
            let mut st = self.state.lock().await;
            if st.generation != generation {
                return Err(Error::Disconnected);
            }

            st.is_connecting = false;
            let reconnected = st.schedule.attempt() > 0;
            st.schedule.reset();
            self.set_state(&mut st, ConnectionState::Connected).await;
            st.resolve_waiters(Ok(()));

            // Started only now so buffered messages follow the Connected event.
            tokio::spawn(pump(Arc::downgrade(self), generation, events));

            let initialize =
                self.initialize.is_some() && !st.is_initialized && !st.is_initializing;
            (reconnected, initialize)
        };

        tracing::info!(client_id = %self.client_id, reconnected, "Session connected");

        if reconnected {
            if let Some(m) = &self.metrics {
                m.record_reconnect_success();
            }
        }

        if let Err(e) = store::record_last_connected(self.store.as_ref(), Utc::now()).await {
            tracing::warn!(error = %e, "Failed to record connection time");
        }

        if initialize {
            let inner = self.clone();
            tokio::spawn(async move {
                if let Err(e) = inner.initialize().await {
                    tracing::warn!(error = %e, "Initialize handshake failed");
                    inner.emit(ClientEvent::Error(e)).await;
                }
            });
        }

        Ok(())
    }

    /// Tear down the connection of `generation` after a transport failure
    ///
    /// Ignored if that connection is no longer installed.
    async fn on_connection_failed(self: &Arc<Self>, generation: u64, error: Error) {
        let connection = {
            let mut st = self.state.lock().await;
            if st.generation != generation {
                tracing::trace!(generation, "Ignoring failure of a replaced connection");
                return;
            }

            st.generation += 1;
            st.reset_connection_scope();
            self.set_state(&mut st, ConnectionState::Failed(error.clone()))
                .await;
            self.emit(ClientEvent::Error(error.clone())).await;
            st.resolve_waiters(Err(error.clone()));
            st.connection.take()
        };

        tracing::warn!(error = %error, "Connection lost");

        if let Some(connection) = connection {
            connection.disconnect().await;
        }

        let failed = self.requests.fail_all(Error::Disconnected).await;
        if failed > 0 {
            tracing::debug!(failed, "Failed pending requests");
        }

        self.schedule_reconnect().await;
    }

    /// Tear down the attempt in progress, if there is one
    async fn abandon_attempt(self: &Arc<Self>, error: Error) {
        let generation = {
            let st = self.state.lock().await;
            if !st.is_connecting {
                return;
            }
            st.generation
        };
        self.on_connection_failed(generation, error).await;
    }

    async fn schedule_reconnect(self: &Arc<Self>) {
        let mut st = self.state.lock().await;
        if !st.auto_reconnect
            || !st.should_reconnect
            || st.config.is_none()
            || !st.network_available
        {
            return;
        }

        st.cancel_reconnect();

        let Some((attempt, delay)) = st.schedule.next() else {
            tracing::warn!(
                attempts = st.schedule.attempt(),
                "Giving up reconnecting until the next connect"
            );
            return;
        };

        if let Some(m) = &self.metrics {
            m.record_reconnect_attempt(attempt);
        }
        tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");

        let epoch = st.reconnect_epoch;
        let inner = Arc::downgrade(self);
        st.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                inner.fire_reconnect(epoch).await;
            }
        }));
    }

    fn fire_reconnect(self: Arc<Self>, epoch: u64) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let config = {
                let mut st = self.state.lock().await;
                if st.reconnect_epoch != epoch {
                    return;
                }
                // This task is the one running; nothing left to abort.
                st.reconnect_task = None;

                if !st.auto_reconnect
                    || !st.should_reconnect
                    || !st.network_available
                    || st.is_connecting
                    || st.state.is_connected()
                {
                    return;
                }
                match st.config.clone() {
                    Some(config) => config,
                    None => return,
                }
            };

            if let Err(e) = self.establish(config).await {
                tracing::debug!(error = %e, "Reconnect attempt failed");
            }
        })
    }

    async fn network_changed(self: &Arc<Self>, available: bool) {
        if available {
            self.network_restored().await;
        } else {
            self.network_lost().await;
        }
    }

    async fn network_lost(&self) {
        let connection = {
            let mut st = self.state.lock().await;
            if !st.network_available {
                return;
            }
            st.network_available = false;
            st.cancel_reconnect();

            let idle = st.connection.is_none()
                && matches!(st.state, ConnectionState::Disconnected);

            st.generation += 1;
            st.reset_connection_scope();
            if !idle {
                self.set_state(&mut st, ConnectionState::Failed(Error::NetworkOffline))
                    .await;
                self.emit(ClientEvent::Error(Error::NetworkOffline)).await;
            }
            st.resolve_waiters(Err(Error::NetworkOffline));
            st.connection.take()
        };

        tracing::warn!("Network unavailable");

        if let Some(connection) = connection {
            connection.disconnect().await;
        }
        self.requests.fail_all(Error::Disconnected).await;
    }

    async fn network_restored(self: &Arc<Self>) {
        let config = {
            let mut st = self.state.lock().await;
            if st.network_available {
                return;
            }
            st.network_available = true;
            tracing::info!("Network available");

            if !st.auto_reconnect
                || !st.should_reconnect
                || st.is_connecting
                || st.state.is_connected()
            {
                return;
            }
            let Some(config) = st.config.clone() else {
                return;
            };
            st.cancel_reconnect();
            st.schedule.reset();
            config
        };

        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.establish(config).await {
                tracing::debug!(error = %e, "Reconnect after network change failed");
            }
        });
    }

    async fn live_connection(&self) -> Result<(Arc<Connection>, u64)> {
        let st = self.state.lock().await;
        match &st.connection {
            Some(connection) if st.state.is_connected() => Ok((connection.clone(), st.generation)),
            _ => Err(Error::Disconnected),
        }
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<()> {
        let (connection, _) = self.live_connection().await?;
        connection.send(&message).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.send(JsonRpcNotification::new(method, params).into())
            .await
    }

    #[tracing::instrument(skip(self, params), fields(method = %method))]
    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let start = Instant::now();
        let (connection, generation) = self.live_connection().await?;

        let id = self.requests.next_id();
        let rx = self.requests.register(id.clone()).await;

        // The connection may have failed before the waiter was registered,
        // in which case fail_all has already run.
        if !self.is_current(generation).await {
            self.requests.cancel(&id).await;
            return Err(Error::Disconnected);
        }

        self.emit(ClientEvent::RequestSending {
            id: id.clone(),
            method: method.to_string(),
        })
        .await;

        let request = JsonRpcRequest::new(id.clone(), method, params);
        if let Err(e) = connection.send(&request.into()).await {
            self.requests.cancel(&id).await;
            self.record_request(method, &Err(e.clone()), start);
            return Err(e);
        }

        tracing::debug!(id = %id, "Request sent, waiting for reply");

        let outcome = rx.await.unwrap_or(Err(Error::Disconnected));
        self.record_request(method, &outcome, start);

        if let Err(e) = &outcome {
            tracing::debug!(id = %id, error = %e, "Request failed");
        }
        outcome
    }

    fn record_request(&self, method: &str, outcome: &Result<Value>, start: Instant) {
        if let Some(m) = &self.metrics {
            let status = if outcome.is_ok() { "success" } else { "error" };
            m.record_request(method, status, start.elapsed().as_secs_f64());
        }
    }

    async fn initialize(&self) -> Result<()> {
        let Some(options) = self.initialize.clone() else {
            return Err(Error::InvalidConfig(
                "no initialize handshake configured".to_string(),
            ));
        };

        let generation = {
            let mut st = self.state.lock().await;
            if st.is_initialized || st.is_initializing {
                return Ok(());
            }
            if !st.state.is_connected() {
                return Err(Error::Disconnected);
            }
            st.is_initializing = true;
            st.generation
        };

        let mut outcome = match self.send_request(options.method(), options.params()).await {
            Ok(_) => Ok(()),
            Err(Error::Rpc(error)) if is_already_initialized(&error) => {
                tracing::debug!("Peer reports already initialized");
                Ok(())
            }
            Err(e) => Err(e),
        };

        if outcome.is_ok() {
            if let Some(method) = options.initialized_notification() {
                outcome = self.notify(method, None).await;
            }
        }

        let mut st = self.state.lock().await;
        if st.generation == generation {
            st.is_initializing = false;
            st.is_initialized = outcome.is_ok();
        }
        if outcome.is_ok() {
            tracing::info!("Initialized");
        }
        outcome
    }

    async fn on_message(&self, generation: u64, message: JsonRpcMessage) {
        if !self.is_current(generation).await {
            tracing::trace!(generation, "Dropping message from a replaced connection");
            return;
        }

        if let Some(m) = &self.metrics {
            m.record_message(&message);
        }

        match message {
            JsonRpcMessage::Response(_) | JsonRpcMessage::Error(_) => {
                if !self.requests.resolve(&message).await {
                    tracing::warn!(id = ?message.id(), "Received response for unknown request");
                }
            }
            JsonRpcMessage::Notification(notification) => {
                tracing::debug!(method = %notification.method, "Notification");
                self.emit(ClientEvent::Message(notification.clone().into()))
                    .await;
                self.notifications.dispatch(notification).await;
            }
            JsonRpcMessage::Request(request) => {
                tracing::debug!(id = %request.id, method = %request.method, "Server request");
                self.emit(ClientEvent::Message(request.into())).await;
            }
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.state.get_mut().cancel_reconnect();
        if let Some(monitor) = self.network_monitor.get_mut().take() {
            monitor.abort();
        }
    }
}

fn is_already_initialized(error: &JsonRpcErrorData) -> bool {
    error.message.to_lowercase().contains("already initialized")
}

/// Forward one connection's events into the manager
async fn pump(
    inner: Weak<ClientInner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };

        match event {
            ConnectionEvent::StateChanged(ConnectionState::Failed(error)) => {
                inner.on_connection_failed(generation, error).await;
            }
            // The manager reports its own transitions.
            ConnectionEvent::StateChanged(_) => {}
            ConnectionEvent::Message(message) => inner.on_message(generation, message).await,
            ConnectionEvent::Error(error) => {
                if inner.is_current(generation).await {
                    inner.emit(ClientEvent::Error(error)).await;
                }
            }
        }
    }
}

fn watch_network(inner: &Arc<ClientInner>, mut rx: watch::Receiver<bool>) -> JoinHandle<()> {
    let inner = Arc::downgrade(inner);
    tokio::spawn(async move {
        loop {
            let available = *rx.borrow_and_update();
            match inner.upgrade() {
                Some(inner) => inner.network_changed(available).await,
                None => break,
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    })
}
