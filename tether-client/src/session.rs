//! Which remote sessions this connection knows about
//!
//! A remote agent keeps sessions (threads) alive across client reconnects,
//! but its per-connection view of them does not survive. The tracker
//! records, for the current connection only:
//!
//! - **materialized**: sessions already loaded or started on this connection
//! - **resuming**: sessions with a resume request in flight
//!
//! The manager clears both sets on every disconnect, connection loss and
//! fresh connect, so callers resume a session again after a reconnect.

use std::collections::HashSet;

/// Session bookkeeping for one connection
#[derive(Debug, Default, Clone)]
pub struct SessionTracker {
    materialized: HashSet<String>,
    resuming: HashSet<String>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `session_id` is live on this connection
    ///
    /// Also ends any resume in progress for it.
    pub fn mark_materialized(&mut self, session_id: &str) {
        self.resuming.remove(session_id);
        self.materialized.insert(session_id.to_string());
    }

    pub fn is_materialized(&self, session_id: &str) -> bool {
        self.materialized.contains(session_id)
    }

    /// Claim the resume of `session_id`
    ///
    /// Returns `false` if it is already materialized or being resumed, in
    /// which case the caller should not send another resume request.
    pub fn begin_resume(&mut self, session_id: &str) -> bool {
        if self.materialized.contains(session_id) {
            return false;
        }
        self.resuming.insert(session_id.to_string())
    }

    /// Give up a resume claim without materializing (the request failed)
    pub fn abandon_resume(&mut self, session_id: &str) {
        self.resuming.remove(session_id);
    }

    pub fn is_resuming(&self, session_id: &str) -> bool {
        self.resuming.contains(session_id)
    }

    pub fn materialized_count(&self) -> usize {
        self.materialized.len()
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.materialized.clear();
        self.resuming.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.materialized.is_empty() && self.resuming.is_empty()
    }
}
