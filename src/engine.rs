//! Entry point for UI code.
//!
//! [`SyncEngine`] wires the cache, queue, monitor and reconciler together.
//! Writes go straight to the server when online and fall back to the queue
//! when offline or when the network fails; reads refresh the cache when
//! online and fall back to it otherwise.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;

use crate::cache_manager::CacheManager;
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{ApiError, Result, SyncError};
use crate::lmdb_store::LmdbStore;
use crate::local_store::LocalStore;
use crate::pending_queue::PendingActionQueue;
use crate::reconciler::{DrainReport, SyncReconciler};
use crate::server_api::{replay, server_id_of, HttpServerApi, ServerApi};
use crate::sync_model::{referenced_local_id, substitute_id, ActionKind, ActionStatus, LocalId};

/// Entity type under which events are cached.
pub const EVENT_ENTITY: &str = "event";

/// Result of [`SyncEngine::submit`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "value", rename_all = "kebab-case")]
pub enum SubmitOutcome {
    /// The server accepted the write; this is its response.
    Sent(JsonValue),
    /// The write was queued under this temporary id.
    Queued(LocalId),
}

pub struct SyncEngine {
    cache: CacheManager,
    queue: Arc<PendingActionQueue>,
    monitor: Arc<ConnectivityMonitor>,
    reconciler: Arc<SyncReconciler>,
    api: Arc<dyn ServerApi>,
    request_timeout: Duration,
    auto_sync: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn LocalStore>,
        api: Arc<dyn ServerApi>,
        monitor: Arc<ConnectivityMonitor>,
        config: &SyncConfig,
    ) -> Result<Self> {
        config.validate()?;
        let queue = Arc::new(PendingActionQueue::open(
            Arc::clone(&store),
            config.max_attempts,
        )?);
        let reconciler = Arc::new(SyncReconciler::new(
            Arc::clone(&queue),
            Arc::clone(&api),
            Arc::clone(&monitor),
            config.request_timeout(),
        ));
        Ok(Self {
            cache: CacheManager::new(store),
            queue,
            monitor,
            reconciler,
            api,
            request_timeout: config.request_timeout(),
            auto_sync: Mutex::new(None),
        })
    }

    /// Production wiring: LMDB store at `config.store_path`, HTTP API client.
    pub fn open(config: &SyncConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(LmdbStore::open(&config.store_path, config.map_size_bytes)?);
        let api = Arc::new(HttpServerApi::new(config)?);
        Self::new(store, api, Arc::new(ConnectivityMonitor::new()), config)
    }

    /// Drains once for anything left from a previous session and starts
    /// draining automatically on every reconnect. Must run inside a tokio
    /// runtime.
    pub async fn start(&self) -> DrainReport {
        {
            let mut auto_sync = self
                .auto_sync
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if auto_sync.is_none() {
                *auto_sync = Some(self.reconciler.spawn_auto_sync());
            }
        }
        self.reconciler.drain().await
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn queue(&self) -> &Arc<PendingActionQueue> {
        &self.queue
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn reconciler(&self) -> &Arc<SyncReconciler> {
        &self.reconciler
    }

    /// Explicit "retry sync": re-queues failed actions, then drains.
    pub async fn retry_sync(&self) -> Result<DrainReport> {
        self.queue.retry_failed()?;
        Ok(self.reconciler.drain().await)
    }

    pub async fn sync_now(&self) -> DrainReport {
        self.reconciler.drain().await
    }

    /// Online-first write with offline fallback.
    ///
    /// Queues when offline, when the request fails at the network level or
    /// times out, and whenever the payload still points at an event that
    /// has no server id yet. A server rejection while online is returned as
    /// an error and nothing is queued.
    pub async fn submit(&self, kind: ActionKind, payload: JsonValue) -> Result<SubmitOutcome> {
        let mut payload = payload;
        if let Some(field) = kind.dependency_field() {
            if let Some(referenced) = referenced_local_id(&payload, field) {
                match self.queue.resolve(&referenced) {
                    Some(server_id) => substitute_id(&mut payload, field, &server_id),
                    None => return self.enqueue(kind, payload),
                }
            }
        }

        if !self.monitor.is_online() {
            return self.enqueue(kind, payload);
        }

        let call = replay(self.api.as_ref(), kind, &payload);
        let result = match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::Timeout(self.request_timeout)),
        };

        match result {
            Ok(resource) => {
                if kind == ActionKind::CreateEvent {
                    self.cache_created_event(&resource);
                }
                Ok(SubmitOutcome::Sent(resource))
            }
            Err(err) if err.is_network() => {
                warn!("{kind} failed over the network, queueing: {err}");
                self.enqueue(kind, payload)
            }
            Err(err) => Err(SyncError::Api(err)),
        }
    }

    /// One event by id. Temporary ids resolve through the id mapping, or to
    /// the queued `create-event` payload while the event is still offline-only.
    pub async fn fetch_event(&self, id: &str) -> Result<Option<JsonValue>> {
        let server_id = match LocalId::parse(id) {
            Some(local_id) => match self.queue.resolve(&local_id) {
                Some(server_id) => server_id,
                None => {
                    return Ok(self
                        .queue
                        .get(&local_id)
                        .filter(|action| action.kind == ActionKind::CreateEvent)
                        .map(|action| action.payload));
                }
            },
            None => id.to_string(),
        };

        if !self.monitor.is_online() {
            return self.cache.get(EVENT_ENTITY, &server_id);
        }

        match self.api.get_event(&server_id).await {
            Ok(Some(event)) => {
                self.cache_quietly(&server_id, event.clone());
                Ok(Some(event))
            }
            Ok(None) => Ok(None),
            Err(err) if err.is_network() => {
                warn!("Fetching event {server_id} failed, using cache: {err}");
                self.cache.get(EVENT_ENTITY, &server_id)
            }
            Err(err) => Err(SyncError::Api(err)),
        }
    }

    /// All events: from the server when reachable (refreshing the cache),
    /// otherwise the cached list.
    pub async fn fetch_events(&self) -> Result<Vec<JsonValue>> {
        if !self.monitor.is_online() {
            return self.cache.get_all(EVENT_ENTITY);
        }

        match self.api.list_events().await {
            Ok(events) => {
                for event in &events {
                    match server_id_of(event) {
                        Some(id) => self.cache_quietly(&id, event.clone()),
                        None => warn!("Not caching event without id"),
                    }
                }
                Ok(events)
            }
            Err(err) if err.is_network() => {
                warn!("Listing events failed, using cache: {err}");
                self.cache.get_all(EVENT_ENTITY)
            }
            Err(err) => Err(SyncError::Api(err)),
        }
    }

    /// Actions the UI should badge as waiting.
    pub fn pending_count(&self) -> usize {
        self.queue.list(Some(ActionStatus::Pending)).len()
    }

    fn enqueue(&self, kind: ActionKind, payload: JsonValue) -> Result<SubmitOutcome> {
        let local_id = self.queue.enqueue(kind, payload)?;
        Ok(SubmitOutcome::Queued(local_id))
    }

    fn cache_created_event(&self, resource: &JsonValue) {
        match server_id_of(resource) {
            Some(id) => self.cache_quietly(&id, resource.clone()),
            None => warn!("Created event response has no id; not cached"),
        }
    }

    /// Cache refreshes are best effort; a full store must not fail a read.
    fn cache_quietly(&self, id: &str, event: JsonValue) {
        if let Err(e) = self.cache.put(EVENT_ENTITY, id, event) {
            warn!("Could not cache event {id}: {e}");
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        let handle = self
            .auto_sync
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
            info!("Auto-sync stopped");
        }
    }
}
