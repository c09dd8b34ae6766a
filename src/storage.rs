//! Persistent key-value storage used to keep cached evaluations and the stable ID across
//! sessions.
//!
//! Storage comes in two flavors: [`KeyValueStorage`] is read synchronously while the client is
//! constructed, [`AsyncKeyValueStorage`] is read during `initialize()`. Any storage failure
//! degrades the SDK to memory-only operation.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;

use crate::{Error, Result};

/// Key under which cached evaluation rows are persisted.
pub(crate) const INTERNAL_STORE_KEY: &str = "STATSIG_LOCAL_STORAGE_INTERNAL_STORE_V4";
/// Key under which the generated stable ID is persisted.
pub(crate) const STABLE_ID_KEY: &str = "STATSIG_STABLE_ID";

/// Synchronous persistent storage.
pub trait KeyValueStorage: Send + Sync {
    /// Read the value stored under `key`.
    fn get(&self, key: &str) -> Result<Option<String>>;
    /// Store `value` under `key`, replacing the previous value.
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Asynchronous persistent storage.
#[async_trait]
pub trait AsyncKeyValueStorage: Send + Sync {
    /// Read the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<String>>;
    /// Store `value` under `key`, replacing the previous value.
    async fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Persistent storage configured for a client.
#[derive(Clone)]
pub enum Storage {
    /// Read while the client is constructed.
    Sync(Arc<dyn KeyValueStorage>),
    /// Read during `initialize()`.
    Async(Arc<dyn AsyncKeyValueStorage>),
}

impl Storage {
    pub(crate) async fn get(&self, key: &str) -> Result<Option<String>> {
        match self {
            Storage::Sync(storage) => storage.get(key),
            Storage::Async(storage) => storage.get(key).await,
        }
    }

    pub(crate) async fn set(&self, key: &str, value: &str) -> Result<()> {
        match self {
            Storage::Sync(storage) => storage.set(key, value),
            Storage::Async(storage) => storage.set(key, value).await,
        }
    }

    /// Write from a synchronous context.
    ///
    /// Synchronous storage is written in place. Asynchronous storage is written on a spawned task
    /// if a tokio runtime is available; otherwise the write is skipped and the next save persists
    /// the latest state.
    pub(crate) fn set_detached(&self, key: &'static str, value: String) -> Result<()> {
        match self {
            Storage::Sync(storage) => storage.set(key, &value),
            Storage::Async(storage) => {
                let Ok(handle) = tokio::runtime::Handle::try_current() else {
                    log::debug!(target: "statsig", key = key; "no async runtime, skipping storage write");
                    return Ok(());
                };
                let storage = Arc::clone(storage);
                handle.spawn(async move {
                    if let Err(err) = storage.set(key, &value).await {
                        log::warn!(target: "statsig", key = key; "failed to write storage: {err}");
                    }
                });
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Storage::Sync(_) => f.write_str("Storage::Sync"),
            Storage::Async(_) => f.write_str("Storage::Async"),
        }
    }
}

/// In-memory storage. Useful for tests and for platforms without persistent storage.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl InMemoryStorage {
    /// Create empty storage.
    pub fn new() -> InMemoryStorage {
        InMemoryStorage::default()
    }
}

impl KeyValueStorage for InMemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| Error::StorageUnavailable("storage lock poisoned".to_owned()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::StorageUnavailable("storage lock poisoned".to_owned()))?;
        entries.insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}

#[async_trait]
impl AsyncKeyValueStorage for InMemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        KeyValueStorage::get(self, key)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        KeyValueStorage::set(self, key, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_round_trip() {
        let storage = InMemoryStorage::new();

        assert_eq!(KeyValueStorage::get(&storage, "k").unwrap(), None);
        KeyValueStorage::set(&storage, "k", "v").unwrap();
        assert_eq!(KeyValueStorage::get(&storage, "k").unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn async_storage_is_spawned_from_sync_context() {
        let inner = Arc::new(InMemoryStorage::new());
        let storage = Storage::Async(inner.clone());

        storage.set_detached(STABLE_ID_KEY, "abc".to_owned()).unwrap();
        tokio::task::yield_now().await;

        assert_eq!(
            KeyValueStorage::get(inner.as_ref(), STABLE_ID_KEY).unwrap().as_deref(),
            Some("abc")
        );
    }
}
