//! Connection state and reconnect bookkeeping
//!
//! # Connection States
//!
//! - **Disconnected**: no socket; initial state and the result of `disconnect()`
//! - **Connecting**: handshake in progress
//! - **Connected**: socket open, receive loop running
//! - **Failed**: the socket errored, closed unexpectedly, or the network went away
//!
//! # State Transitions
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──open──► Connected
//!       ▲                         │                    │
//!       │                         ▼                    ▼
//!       └──────disconnect()──── Failed(e) ◄────────────┘
//! ```
//!
//! `Failed` is not terminal for the manager: its reconnect schedule decides
//! whether another `Connecting` follows.

use crate::reconnect::ReconnectionStrategy;
use std::fmt;
use std::time::Duration;
use tether_core::Error;

/// Observable state of a connection
///
/// Two `Failed` states compare equal regardless of the error they carry.
#[derive(Debug, Clone)]
pub enum ConnectionState {
    /// No socket
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Socket open
    Connected,
    /// Lost or never established
    Failed(Error),
}

impl ConnectionState {
    /// Whether messages can be sent
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Label used for logs and metric attributes
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed(_) => "failed",
        }
    }

    /// Numeric value reported on the connection state gauge
    pub(crate) fn gauge_value(&self) -> i64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Failed(_) => -1,
        }
    }
}

impl PartialEq for ConnectionState {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl Eq for ConnectionState {}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Failed(e) => write!(f, "failed: {}", e),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Attempt counter paired with the strategy that turns it into delays
pub(crate) struct ReconnectSchedule {
    strategy: Box<dyn ReconnectionStrategy>,
    attempt: u32,
}

impl ReconnectSchedule {
    pub(crate) fn new(strategy: Box<dyn ReconnectionStrategy>) -> Self {
        Self {
            strategy,
            attempt: 0,
        }
    }

    /// Count one more attempt and return its number and delay
    ///
    /// `None` once the strategy gives up; the counter stays where it was.
    pub(crate) fn next(&mut self) -> Option<(u32, Duration)> {
        let attempt = self.attempt.saturating_add(1);
        let delay = self.strategy.next_delay(attempt)?;
        self.attempt = attempt;
        Some((attempt, delay))
    }

    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
        self.strategy.reset();
    }
}
