//! Read-through cache of server entities for use while offline.
//!
//! Entries never expire on their own; a newer `put` overwrites, `invalidate`
//! and `clear_type` remove.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, info};
use serde_json::Value as JsonValue;

use crate::error::{Result, SyncError};
use crate::local_store::{keys, read_json, write_json, LocalStore};
use crate::sync_model::CachedEntity;

#[derive(Clone)]
pub struct CacheManager {
    store: Arc<dyn LocalStore>,
}

impl CacheManager {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    /// Stores or overwrites the snapshot for `(entity_type, id)`.
    pub fn put(&self, entity_type: &str, id: &str, payload: JsonValue) -> Result<()> {
        validate_segment("entity type", entity_type)?;
        if id.is_empty() {
            return Err(SyncError::invalid_input("cache id must not be empty"));
        }

        let entity = CachedEntity {
            entity_type: entity_type.to_string(),
            id: id.to_string(),
            payload,
            cached_at: Utc::now(),
        };
        write_json(self.store.as_ref(), &keys::cache(entity_type, id), &entity)?;
        debug!("Cached {entity_type}/{id}");
        Ok(())
    }

    /// The cached payload, or `None` on a miss.
    pub fn get(&self, entity_type: &str, id: &str) -> Result<Option<JsonValue>> {
        Ok(self.get_entry(entity_type, id)?.map(|entity| entity.payload))
    }

    pub fn get_entry(&self, entity_type: &str, id: &str) -> Result<Option<CachedEntity>> {
        if entity_type.is_empty() || id.is_empty() {
            return Ok(None);
        }
        read_json(self.store.as_ref(), &keys::cache(entity_type, id))
    }

    /// Every cached payload of `entity_type`, ordered by id.
    pub fn get_all(&self, entity_type: &str) -> Result<Vec<JsonValue>> {
        validate_segment("entity type", entity_type)?;
        let mut payloads = Vec::new();
        for key in self.store.keys_with_prefix(&keys::cache_prefix(entity_type))? {
            if let Some(entity) = read_json::<CachedEntity>(self.store.as_ref(), &key)? {
                payloads.push(entity.payload);
            }
        }
        Ok(payloads)
    }

    /// Returns whether an entry was removed.
    pub fn invalidate(&self, entity_type: &str, id: &str) -> Result<bool> {
        Ok(self.store.remove(&keys::cache(entity_type, id))?)
    }

    /// Removes every entry of `entity_type`; returns how many were dropped.
    pub fn clear_type(&self, entity_type: &str) -> Result<usize> {
        validate_segment("entity type", entity_type)?;
        let mut removed = 0;
        for key in self.store.keys_with_prefix(&keys::cache_prefix(entity_type))? {
            if self.store.remove(&key)? {
                removed += 1;
            }
        }
        info!("Cleared {removed} cached {entity_type} entries");
        Ok(removed)
    }
}

fn validate_segment(what: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.contains('/') {
        return Err(SyncError::invalid_input(format!(
            "{what} must be non-empty and contain no '/': {value:?}"
        )));
    }
    Ok(())
}
