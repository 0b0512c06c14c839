//! Request correlation
//!
//! Every outbound request gets a fresh integer id and a oneshot channel.
//! Replies are matched back by id as they arrive, in any order, between
//! notifications and server-initiated requests.
//!
//! # Request Lifecycle
//!
//! 1. **Generate ID**: `next_id()`, monotonic from 1, never reused
//! 2. **Register**: a oneshot sender is stored under the id
//! 3. **Send**: the request is written to the socket
//! 4. **Wait**: the caller awaits the receiver
//! 5. **Resolve**: the matching `Response`/`Error` completes the sender
//!
//! A sender is removed from the map before it is completed, so each
//! request resolves at most once. When the transport goes away
//! `fail_all` drains the map in one step and every waiter sees the error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tether_core::{Error, Id, JsonRpcMessage, Result};
use tokio::sync::{oneshot, Mutex};

type Completion = oneshot::Sender<Result<serde_json::Value>>;

/// Tracks requests waiting for a reply
///
/// Cloning shares the same map and counter.
#[derive(Clone)]
pub struct RequestManager {
    pending: Arc<Mutex<HashMap<Id, Completion>>>,
    counter: Arc<AtomicI64>,
}

impl RequestManager {
    /// Create an empty manager whose first id is 1
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            counter: Arc::new(AtomicI64::new(1)),
        }
    }

    /// Next request id
    pub fn next_id(&self) -> Id {
        Id::Number(self.counter.fetch_add(1, Ordering::Relaxed))
    }

    /// Start waiting for the reply to `id`
    pub async fn register(&self, id: Id) -> oneshot::Receiver<Result<serde_json::Value>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        rx
    }

    /// Hand a reply to its waiter
    ///
    /// Returns `false` for anything that is not a reply, for replies without
    /// an id, and for ids nobody is waiting on.
    pub async fn resolve(&self, message: &JsonRpcMessage) -> bool {
        let (id, outcome) = match message {
            JsonRpcMessage::Response(r) => (&r.id, Ok(r.result.clone())),
            JsonRpcMessage::Error(e) => match &e.id {
                Some(id) => (id, Err(Error::Rpc(e.error.clone()))),
                None => return false,
            },
            _ => return false,
        };

        let Some(tx) = self.pending.lock().await.remove(id) else {
            return false;
        };

        // The waiter may have given up; the reply was still ours.
        let _ = tx.send(outcome);
        true
    }

    /// Stop waiting for `id`; returns whether it was pending
    pub async fn cancel(&self, id: &Id) -> bool {
        self.pending.lock().await.remove(id).is_some()
    }

    /// Fail every pending request with `error`
    pub async fn fail_all(&self, error: Error) -> usize {
        let drained: Vec<Completion> = {
            let mut pending = self.pending.lock().await;
            pending.drain().map(|(_, tx)| tx).collect()
        };

        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(error.clone()));
        }
        count
    }

    /// Number of requests still waiting
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

impl Default for RequestManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_core::{JsonRpcError, JsonRpcErrorData, JsonRpcNotification, JsonRpcResponse};

    #[test]
    fn test_ids_are_monotonic_from_one() {
        let manager = RequestManager::new();

        assert_eq!(manager.next_id(), Id::Number(1));
        assert_eq!(manager.next_id(), Id::Number(2));
        assert_eq!(manager.clone().next_id(), Id::Number(3));
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let manager = RequestManager::new();
        let id = manager.next_id();

        let rx = manager.register(id.clone()).await;
        assert_eq!(manager.pending_count().await, 1);

        let reply: JsonRpcMessage = JsonRpcResponse::new(id, json!(42)).into();
        assert!(manager.resolve(&reply).await);
        assert_eq!(manager.pending_count().await, 0);

        assert_eq!(rx.await.unwrap().unwrap(), json!(42));
    }

    #[tokio::test]
    async fn test_resolves_exactly_once() {
        let manager = RequestManager::new();
        let _rx = manager.register(Id::Number(1)).await;

        let reply: JsonRpcMessage = JsonRpcResponse::new(Id::Number(1), json!(null)).into();
        assert!(manager.resolve(&reply).await);
        assert!(!manager.resolve(&reply).await);
    }

    #[tokio::test]
    async fn test_error_reply_carries_rpc_error() {
        let manager = RequestManager::new();
        let rx = manager.register(Id::Number(7)).await;

        let reply: JsonRpcMessage =
            JsonRpcError::new(Some(Id::Number(7)), JsonRpcErrorData::invalid_params("cwd")).into();
        assert!(manager.resolve(&reply).await);

        match rx.await.unwrap() {
            Err(Error::Rpc(data)) => assert_eq!(data.message, "cwd"),
            other => panic!("Expected Rpc error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unmatched_messages_are_not_consumed() {
        let manager = RequestManager::new();
        let _rx = manager.register(Id::Number(1)).await;

        let string_id: JsonRpcMessage = JsonRpcResponse::new(Id::from("1"), json!(1)).into();
        let no_id: JsonRpcMessage = JsonRpcError::new(None, JsonRpcErrorData::parse_error()).into();
        let notification: JsonRpcMessage = JsonRpcNotification::new("turn/started", None).into();

        assert!(!manager.resolve(&string_id).await);
        assert!(!manager.resolve(&no_id).await);
        assert!(!manager.resolve(&notification).await);
        assert_eq!(manager.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_fail_all() {
        let manager = RequestManager::new();
        let rx1 = manager.register(Id::Number(1)).await;
        let rx2 = manager.register(Id::Number(2)).await;

        assert_eq!(manager.fail_all(Error::Disconnected).await, 2);
        assert_eq!(manager.pending_count().await, 0);

        assert!(matches!(rx1.await.unwrap(), Err(Error::Disconnected)));
        assert!(matches!(rx2.await.unwrap(), Err(Error::Disconnected)));
    }

    #[tokio::test]
    async fn test_cancel() {
        let manager = RequestManager::new();
        let rx = manager.register(Id::Number(3)).await;

        assert!(manager.cancel(&Id::Number(3)).await);
        assert!(!manager.cancel(&Id::Number(3)).await);
        assert!(rx.await.is_err());
    }
}
