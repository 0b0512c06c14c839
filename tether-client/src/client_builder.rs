//! Client builder
//!
//! The `ClientBuilder` provides a fluent API for everything that stays
//! fixed for the life of a client. Per-connection settings (endpoint,
//! credentials, headers, heartbeat) live in
//! [`ConnectionConfig`](crate::ConnectionConfig) and are passed to
//! `connect`.
//!
//! It allows you to:
//! - Choose a reconnection strategy (exponential backoff by default)
//! - Persist the client id with a [`ClientStore`]
//! - Gate connections on a network-availability channel
//! - Configure the `initialize` handshake
//! - Configure observability (OpenTelemetry)
//!
//! # Examples
//!
//! ```rust,no_run
//! use tether_client::{ClientBuilder, ConnectionConfig, ExponentialBackoff, InitializeOptions, JsonFileStore};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn example() -> tether_core::Result<()> {
//! let client = ClientBuilder::new()
//!     .with_reconnect(Box::new(ExponentialBackoff::new(Duration::from_secs(1)).with_max_attempts(8)))
//!     .with_store(JsonFileStore::new("/tmp/tether/client.json"))
//!     .with_initialize(
//!         InitializeOptions::new(|| Some(json!({"clientInfo": {"name": "tether", "version": "0.1.0"}})))
//!             .with_initialized_notification("initialized"),
//!     )
//!     .build()
//!     .await?;
//!
//! client
//!     .connect(ConnectionConfig::new("ws://localhost:4500").with_bearer_token("secret"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::client::{ClientParts, InitializeOptions, TetherClient, DEFAULT_HEALTH_CHECK_TIMEOUT};
use crate::metrics::ClientMetrics;
use crate::reconnect::{ExponentialBackoff, NoReconnect, ReconnectionStrategy};
use crate::store::{self, ClientStore, MemoryStore};
use std::sync::Arc;
use std::time::Duration;
use tether_core::{Error, ObservabilityConfig, Result};
use tokio::sync::watch;

/// Builder for configuring and creating a [`TetherClient`]
pub struct ClientBuilder {
    reconnect_strategy: Box<dyn ReconnectionStrategy>,
    enable_reconnect: bool,
    store: Option<Arc<dyn ClientStore>>,
    network: Option<watch::Receiver<bool>>,
    initialize: Option<InitializeOptions>,
    health_check_timeout: Duration,
    observability_config: Option<ObservabilityConfig>,
    service_name: Option<String>,
}

impl ClientBuilder {
    /// Create a new client builder
    pub fn new() -> Self {
        Self {
            reconnect_strategy: Box::new(ExponentialBackoff::default()),
            enable_reconnect: true,
            store: None,
            network: None,
            initialize: None,
            health_check_timeout: DEFAULT_HEALTH_CHECK_TIMEOUT,
            observability_config: None,
            service_name: None,
        }
    }

    /// Reconnect automatically with the given strategy
    pub fn with_reconnect(mut self, strategy: Box<dyn ReconnectionStrategy>) -> Self {
        self.reconnect_strategy = strategy;
        self.enable_reconnect = true;
        self
    }

    /// Reconnect automatically with default exponential backoff (default)
    pub fn with_default_reconnect(mut self) -> Self {
        self.reconnect_strategy = Box::new(ExponentialBackoff::default());
        self.enable_reconnect = true;
        self
    }

    /// Never reconnect on its own
    ///
    /// Neither a lost connection nor a restored network brings the session
    /// back; `connect`, `reconnect` and `verify_connection_health` still do.
    pub fn without_reconnect(mut self) -> Self {
        self.reconnect_strategy = Box::new(NoReconnect);
        self.enable_reconnect = false;
        self
    }

    /// Keep the client id and last connection time in `store`
    ///
    /// Defaults to a [`MemoryStore`], which forgets them on exit.
    pub fn with_store(mut self, store: impl ClientStore + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Share an existing store
    pub fn with_shared_store(mut self, store: Arc<dyn ClientStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Follow network availability from this channel
    ///
    /// The current value applies from the start. Without a monitor the
    /// network is assumed to be available.
    pub fn with_network_monitor(mut self, network: watch::Receiver<bool>) -> Self {
        self.network = Some(network);
        self
    }

    /// Run this handshake after every successful connection
    pub fn with_initialize(mut self, options: InitializeOptions) -> Self {
        self.initialize = Some(options);
        self
    }

    /// How long a health-check ping may take
    pub fn with_health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout = timeout;
        self
    }

    /// Enable OpenTelemetry observability with custom configuration
    pub fn with_observability(mut self, config: ObservabilityConfig) -> Self {
        self.observability_config = Some(config);
        self
    }

    /// Enable OpenTelemetry observability with default configuration
    pub fn with_default_observability(mut self) -> Self {
        self.observability_config = Some(ObservabilityConfig::default());
        self
    }

    /// Set service name for observability (used if observability is enabled)
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    /// Build the client
    ///
    /// Loads the client id from the store, creating one on first use. No
    /// connection is opened until `connect`.
    pub async fn build(self) -> Result<TetherClient> {
        let metrics = match self.observability_config {
            Some(mut config) => {
                if let Some(name) = self.service_name {
                    config.service_name = name;
                }

                tether_core::init_observability(config.clone()).map_err(|e| {
                    Error::InvalidConfig(format!("Failed to initialize observability: {}", e))
                })?;

                Some(Arc::new(ClientMetrics::new(config.service_name)))
            }
            None => None,
        };

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let client_id = store::load_or_create_client_id(store.as_ref()).await?;

        tracing::debug!(
            client_id = %client_id,
            reconnect = self.enable_reconnect,
            initialize = ?self.initialize.as_ref().map(|i| i.method()),
            "Building client"
        );

        Ok(TetherClient::from_parts(ClientParts {
            strategy: self.reconnect_strategy,
            store,
            client_id,
            metrics,
            initialize: self.initialize,
            health_check_timeout: self.health_check_timeout,
            network: self.network,
            auto_reconnect: self.enable_reconnect,
        })
        .await)
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
