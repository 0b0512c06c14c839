//! Persistent key-value storage for client identity
//!
//! The client keeps two values across process restarts:
//!
//! - a client id (UUID v4), generated once and sent as `X-Client-Id` on
//!   every connection attempt so a relay can recognize a returning client
//! - the time of the last successful connection (RFC 3339, UTC)
//!
//! [`MemoryStore`] is the default and forgets everything on exit.
//! [`JsonFileStore`] keeps a small JSON object on disk.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tether_core::{Error, Result};
use tokio::sync::Mutex;

/// Key holding the persistent client id
pub const CLIENT_ID_KEY: &str = "tether.client_id";

/// Key holding the last successful connection time
pub const LAST_CONNECTED_KEY: &str = "tether.last_connected_at";

/// String key-value store
#[async_trait]
pub trait ClientStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// In-process store
#[derive(Clone, Default)]
pub struct MemoryStore {
    values: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClientStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Store backed by a JSON object in a single file
///
/// The file is created on first write. Writes go to a sibling temp file
/// that is then renamed over the original.
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<HashMap<String, String>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(HashMap::new()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                Error::Storage(format!("{}: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(Error::Storage(format!("{}: {}", self.path.display(), e))),
        }
    }
}

#[async_trait]
impl ClientStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.remove(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.lock.lock().await;

        let mut values = self.load().await?;
        values.insert(key.to_string(), value.to_string());

        let bytes =
            serde_json::to_vec_pretty(&values).map_err(|e| Error::Storage(e.to_string()))?;

        let storage_err = |e: std::io::Error| Error::Storage(format!("{}: {}", self.path.display(), e));

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(storage_err)?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, bytes).await.map_err(storage_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(storage_err)?;

        Ok(())
    }
}

/// Return the stored client id, generating and saving one if needed
pub async fn load_or_create_client_id(store: &dyn ClientStore) -> Result<String> {
    if let Some(id) = store.get(CLIENT_ID_KEY).await? {
        if !id.trim().is_empty() {
            return Ok(id);
        }
    }

    let id = uuid::Uuid::new_v4().to_string();
    store.set(CLIENT_ID_KEY, &id).await?;
    tracing::info!(client_id = %id, "Generated new client id");
    Ok(id)
}

/// Save `at` as the last successful connection time
pub async fn record_last_connected(store: &dyn ClientStore, at: DateTime<Utc>) -> Result<()> {
    store.set(LAST_CONNECTED_KEY, &at.to_rfc3339()).await
}

/// Last successful connection time, if one was recorded and parses
pub async fn last_connected(store: &dyn ClientStore) -> Result<Option<DateTime<Utc>>> {
    let Some(raw) = store.get(LAST_CONNECTED_KEY).await? else {
        return Ok(None);
    };

    match DateTime::parse_from_rfc3339(&raw) {
        Ok(at) => Ok(Some(at.with_timezone(&Utc))),
        Err(e) => {
            tracing::warn!(value = %raw, error = %e, "Ignoring unparsable last-connected time");
            Ok(None)
        }
    }
}
