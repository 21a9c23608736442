//! Key-value persistence shared by the cache and the pending-action queue.
//!
//! Every persisted byte goes through a [`LocalStore`]. Keys are namespaced
//! strings built by the helpers in [`keys`]; values are JSON documents written
//! with [`write_json`] and read back with [`read_json`]. Two backends exist:
//! [`LmdbStore`](crate::lmdb_store::LmdbStore) for devices and [`MemoryStore`]
//! for tests and ephemeral sessions.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The device (or the configured map) has no room left for this write.
    #[error("storage quota exceeded")]
    QuotaExceeded,

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Durable key-value persistence scoped to one device/user.
///
/// `set` replaces the whole value or nothing; readers never observe a partial
/// write. A `set` that fails with [`StoreError::QuotaExceeded`] leaves the
/// previous value in place.
pub trait LocalStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Returns whether a value was present.
    fn remove(&self, key: &str) -> Result<bool, StoreError>;

    /// Keys starting with `prefix`, in ascending byte order.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Drops every key in the store.
    fn clear(&self) -> Result<(), StoreError>;
}

/// Key layout shared by every component.
///
/// ```text
/// cache/<entity_type>/<id>   CachedEntity
/// pending/<local_id>         PendingAction
/// idmap/<local_id>           EntityIdMapping
/// ```
pub mod keys {
    pub const CACHE: &str = "cache/";
    pub const PENDING: &str = "pending/";
    pub const ID_MAP: &str = "idmap/";

    pub fn cache_prefix(entity_type: &str) -> String {
        format!("{CACHE}{entity_type}/")
    }

    pub fn cache(entity_type: &str, id: &str) -> String {
        format!("{CACHE}{entity_type}/{id}")
    }

    pub fn pending(local_id: &str) -> String {
        format!("{PENDING}{local_id}")
    }

    pub fn id_map(local_id: &str) -> String {
        format!("{ID_MAP}{local_id}")
    }
}

/// Serializes `value` as JSON and stores it under `key`.
pub fn write_json<T: Serialize>(
    store: &dyn LocalStore,
    key: &str,
    value: &T,
) -> Result<(), crate::error::SyncError> {
    let bytes = serde_json::to_vec(value)?;
    store.set(key, &bytes)?;
    Ok(())
}

/// Reads and deserializes the JSON value under `key`, `None` when absent.
pub fn read_json<T: DeserializeOwned>(
    store: &dyn LocalStore,
    key: &str,
) -> Result<Option<T>, crate::error::SyncError> {
    match store.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// In-process store. Optionally enforces a byte quota (keys plus values) so
/// storage-full paths can be exercised without filling a disk.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    entries: BTreeMap<String, Vec<u8>>,
    quota_bytes: Option<usize>,
}

impl MemoryInner {
    fn used_bytes(&self) -> usize {
        self.entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        let store = Self::default();
        store.set_quota(Some(quota_bytes));
        store
    }

    /// Changes the quota. Existing entries are kept even if they exceed it.
    pub fn set_quota(&self, quota_bytes: Option<usize>) {
        self.lock().quota_bytes = quota_bytes;
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.lock().entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(quota) = inner.quota_bytes {
            let replaced = inner.entries.get(key).map_or(0, |old| key.len() + old.len());
            let projected = inner.used_bytes() - replaced + key.len() + value.len();
            if projected > quota {
                warn!("MemoryStore quota of {quota} bytes exceeded writing {key}");
                return Err(StoreError::QuotaExceeded);
            }
        }
        inner.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.lock().entries.remove(key).is_some())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.lock().entries.clear();
        Ok(())
    }
}
