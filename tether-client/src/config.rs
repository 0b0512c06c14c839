//! Connection configuration
//!
//! A [`ConnectionConfig`] is built once by the caller and handed to
//! `TetherClient::connect`. The manager keeps it for automatic reconnects,
//! so anything that may change between attempts (an expiring auth token)
//! goes through a [`TokenProvider`] that is asked again on every connect.

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tether_core::framing::DEFAULT_MAX_BUFFER_SIZE;
use tether_core::EncodeOptions;

/// Error type returned by token providers
pub type TokenError = Box<dyn std::error::Error + Send + Sync>;

/// Source of the bearer token sent with each handshake
///
/// A failure does not stop the connection; it goes ahead without an
/// `Authorization` header.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Fetch the current token
    async fn token(&self) -> Result<String, TokenError>;
}

/// A token that never changes
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<String, TokenError> {
        Ok(self.0.clone())
    }
}

/// Adapter turning an async closure into a [`TokenProvider`]
///
/// ```rust
/// use tether_client::{ConnectionConfig, TokenError, TokenFn};
///
/// let config = ConnectionConfig::new("ws://127.0.0.1:4500")
///     .with_token_provider(TokenFn::new(|| async { Ok::<_, TokenError>("rotating-token".to_string()) }));
/// assert!(config.token_provider().is_some());
/// ```
pub struct TokenFn<F>(F);

impl<F> TokenFn<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> TokenProvider for TokenFn<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, TokenError>> + Send,
{
    async fn token(&self) -> Result<String, TokenError> {
        (self.0)().await
    }
}

/// Everything needed to open one connection
///
/// ```rust
/// use tether_client::ConnectionConfig;
/// use std::time::Duration;
///
/// let config = ConnectionConfig::new("ws://127.0.0.1:4500")
///     .with_bearer_token("secret")
///     .with_header("X-Bridge-Version", "3")
///     .with_ping_interval(Duration::from_secs(20))
///     .with_newline(true);
///
/// assert_eq!(config.endpoint(), "ws://127.0.0.1:4500");
/// assert!(config.append_newline());
/// ```
#[derive(Clone)]
pub struct ConnectionConfig {
    endpoint: String,
    token_provider: Option<Arc<dyn TokenProvider>>,
    headers: Vec<(String, String)>,
    ping_interval: Option<Duration>,
    append_newline: bool,
    encode_options: EncodeOptions,
    max_frame_buffer: usize,
}

impl ConnectionConfig {
    /// Config for `endpoint` (a `ws://` or `wss://` URL) with no extras
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token_provider: None,
            headers: Vec::new(),
            ping_interval: None,
            append_newline: false,
            encode_options: EncodeOptions::default(),
            max_frame_buffer: DEFAULT_MAX_BUFFER_SIZE,
        }
    }

    /// Fetch a bearer token from `provider` on every connect
    pub fn with_token_provider(mut self, provider: impl TokenProvider + 'static) -> Self {
        self.token_provider = Some(Arc::new(provider));
        self
    }

    /// Send a fixed bearer token
    pub fn with_bearer_token(self, token: impl Into<String>) -> Self {
        self.with_token_provider(StaticToken::new(token))
    }

    /// Add a static handshake header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Send a WebSocket ping every `interval` while connected
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = Some(interval);
        self
    }

    /// Terminate every outbound message with `\n`
    pub fn with_newline(mut self, append: bool) -> Self {
        self.append_newline = append;
        self
    }

    /// Set the outbound encoding options
    pub fn with_encode_options(mut self, options: EncodeOptions) -> Self {
        self.encode_options = options;
        self
    }

    /// Cap on buffered bytes for a document split across frames
    pub fn with_max_frame_buffer(mut self, bytes: usize) -> Self {
        self.max_frame_buffer = bytes;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn token_provider(&self) -> Option<&Arc<dyn TokenProvider>> {
        self.token_provider.as_ref()
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        self.ping_interval
    }

    pub fn append_newline(&self) -> bool {
        self.append_newline
    }

    pub fn encode_options(&self) -> &EncodeOptions {
        &self.encode_options
    }

    pub fn max_frame_buffer(&self) -> usize {
        self.max_frame_buffer
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header_names: Vec<&str> = self.headers.iter().map(|(n, _)| n.as_str()).collect();
        f.debug_struct("ConnectionConfig")
            .field("endpoint", &self.endpoint)
            .field("token_provider", &self.token_provider.is_some())
            .field("headers", &header_names)
            .field("ping_interval", &self.ping_interval)
            .field("append_newline", &self.append_newline)
            .field("encode_options", &self.encode_options)
            .finish()
    }
}
