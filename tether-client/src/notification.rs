//! Per-method notification callbacks
//!
//! Agents stream most of their output as notifications (`turn/started`,
//! `item/agentMessage/delta`, ...). Callers that only care about a few
//! methods register callbacks here instead of filtering the full event
//! stream from `TetherClient::subscribe`. Both see every notification.
//!
//! Callbacks run one at a time, in the order the notifications arrived, on
//! a delivery task owned by the registry. A slow callback delays later
//! callbacks but never the receive path, so a callback may itself issue
//! requests on the client.
//!
//! ```rust,no_run
//! use tether_client::TetherClient;
//!
//! # async fn example(client: &TetherClient) {
//! client.on_notification("turn/completed", |notification| async move {
//!     println!("turn done: {:?}", notification.params);
//! }).await;
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tether_core::JsonRpcNotification;
use tokio::sync::{mpsc, Mutex};

/// Boxed notification callback
pub type NotificationFn =
    Arc<dyn Fn(JsonRpcNotification) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

type Delivery = (NotificationFn, JsonRpcNotification);

/// Registry of notification callbacks keyed by method
#[derive(Clone, Default)]
pub struct NotificationHandler {
    handlers: Arc<Mutex<HashMap<String, NotificationFn>>>,
    delivery: Arc<Mutex<Option<mpsc::UnboundedSender<Delivery>>>>,
}

impl NotificationHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `method`, replacing any previous one
    pub async fn register<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(JsonRpcNotification) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: NotificationFn = Arc::new(move |notif| Box::pin(handler(notif)));
        self.handlers.lock().await.insert(method.into(), handler);
    }

    /// Queue the callback for this notification, if there is one
    ///
    /// Returns without waiting for the callback to run.
    pub async fn dispatch(&self, notification: JsonRpcNotification) -> bool {
        let handler = self.handlers.lock().await.get(&notification.method).cloned();

        let Some(handler) = handler else {
            tracing::trace!(method = %notification.method, "No notification callback");
            return false;
        };

        let mut delivery = self.delivery.lock().await;
        let mut item = (handler, notification);
        if let Some(tx) = delivery.as_ref() {
            match tx.send(item) {
                Ok(()) => return true,
                // The delivery task died with a panicking callback.
                Err(mpsc::error::SendError(returned)) => item = returned,
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(deliver(rx));
        let _ = tx.send(item);
        *delivery = Some(tx);
        true
    }

    pub async fn has_handler(&self, method: &str) -> bool {
        self.handlers.lock().await.contains_key(method)
    }

    /// Remove the callback for `method`
    pub async fn unregister(&self, method: &str) -> bool {
        self.handlers.lock().await.remove(method).is_some()
    }

    /// Methods with a registered callback
    pub async fn methods(&self) -> Vec<String> {
        self.handlers.lock().await.keys().cloned().collect()
    }
}

/// Run queued callbacks in order until the registry is dropped
async fn deliver(mut rx: mpsc::UnboundedReceiver<Delivery>) {
    while let Some((handler, notification)) = rx.recv().await {
        handler(notification).await;
    }
}
