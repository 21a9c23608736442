//! Mutation log for writes that could not reach the server.
//!
//! The queue keeps an in-memory index mirrored to the [`LocalStore`]. Every
//! change is applied in memory first and then persisted; when the store is
//! full the change stays in memory only and a [`StorageWarning`] is recorded
//! for the UI to pick up with [`PendingActionQueue::take_warnings`].
//!
//! Actions that reference an offline-created event carry the event's
//! [`LocalId`] in `depends_on`. When that event syncs, the server id is
//! recorded as an [`EntityIdMapping`] and every dependent payload is rewritten.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{Result, SyncError};
use crate::local_store::{keys, read_json, write_json, LocalStore};
use crate::sync_model::{
    referenced_local_id, substitute_id, ActionKind, ActionStatus, EntityIdMapping, FailureReason,
    LocalId, PendingAction, StorageWarning,
};

/// What the queue knows about an event an action depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyState {
    /// The event synced; this is its server id.
    Resolved(String),
    /// The `create-event` action is still queued with this status.
    Queued(ActionStatus),
    /// Neither a mapping nor a queued action exists for the id.
    Missing,
}

/// Data for the "N items failed to sync" indicator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedSummary {
    pub count: usize,
    pub items: Vec<FailedItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedItem {
    pub local_id: LocalId,
    pub kind: ActionKind,
    pub attempts: u32,
    pub reason: Option<FailureReason>,
}

#[derive(Default)]
struct QueueState {
    actions: HashMap<LocalId, PendingAction>,
    mappings: HashMap<LocalId, EntityIdMapping>,
    next_sequence: u64,
    warnings: Vec<StorageWarning>,
}

pub struct PendingActionQueue {
    store: Arc<dyn LocalStore>,
    max_attempts: u32,
    state: Mutex<QueueState>,
}

impl PendingActionQueue {
    /// Loads the queue and id mappings from `store`.
    ///
    /// Actions persisted as `syncing` were interrupted mid-replay and are
    /// restored as `pending`.
    pub fn open(store: Arc<dyn LocalStore>, max_attempts: u32) -> Result<Self> {
        if max_attempts == 0 {
            return Err(SyncError::Config("max_attempts must be at least 1".into()));
        }

        let mut state = QueueState::default();

        for key in store.keys_with_prefix(keys::ID_MAP)? {
            match read_json::<EntityIdMapping>(store.as_ref(), &key) {
                Ok(Some(mapping)) => {
                    state.mappings.insert(mapping.local_id.clone(), mapping);
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable id mapping {key}: {e}"),
            }
        }

        let mut recovered = 0;
        for key in store.keys_with_prefix(keys::PENDING)? {
            let mut action = match read_json::<PendingAction>(store.as_ref(), &key) {
                Ok(Some(action)) => action,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Skipping unreadable pending action {key}: {e}");
                    continue;
                }
            };
            if action.status == ActionStatus::Syncing {
                action.status = ActionStatus::Pending;
                write_json(store.as_ref(), &key, &action)?;
                recovered += 1;
            }
            state.next_sequence = state.next_sequence.max(action.sequence + 1);
            state.actions.insert(action.local_id.clone(), action);
        }

        info!(
            "Opened pending queue: {} actions, {} id mappings, {} recovered from syncing",
            state.actions.len(),
            state.mappings.len(),
            recovered
        );

        Ok(Self {
            store,
            max_attempts,
            state: Mutex::new(state),
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Records a new `pending` action and returns its fresh [`LocalId`].
    ///
    /// A `register`/`check-in` whose `eventId` is a temporary id is rewritten
    /// right away when that id is already mapped; otherwise the id is stored
    /// as the action's dependency.
    pub fn enqueue(&self, kind: ActionKind, payload: JsonValue) -> Result<LocalId> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let mut payload = payload;
        let mut depends_on = None;
        if let Some(field) = kind.dependency_field() {
            if let Some(referenced) = referenced_local_id(&payload, field) {
                match state.mappings.get(&referenced) {
                    Some(mapping) => substitute_id(&mut payload, field, &mapping.server_id),
                    None => depends_on = Some(referenced),
                }
            }
        }

        let mut local_id = LocalId::generate();
        while state.actions.contains_key(&local_id) || state.mappings.contains_key(&local_id) {
            local_id = LocalId::generate();
        }

        let action = PendingAction {
            local_id: local_id.clone(),
            kind,
            payload,
            depends_on,
            created_at: Utc::now(),
            sequence: state.next_sequence,
            attempts: 0,
            status: ActionStatus::Pending,
            last_error: None,
        };
        state.next_sequence += 1;

        state.actions.insert(local_id.clone(), action.clone());
        self.persist(&mut state.warnings, &keys::pending(local_id.as_str()), &action)?;

        info!("Queued {kind} action {local_id}");
        Ok(local_id)
    }

    pub fn get(&self, local_id: &LocalId) -> Option<PendingAction> {
        self.lock().actions.get(local_id).cloned()
    }

    /// Actions in replay order (oldest first), optionally filtered by status.
    /// The result is a snapshot; later changes do not affect it.
    pub fn list(&self, status: Option<ActionStatus>) -> Vec<PendingAction> {
        let state = self.lock();
        let mut actions: Vec<PendingAction> = state
            .actions
            .values()
            .filter(|action| status.map_or(true, |s| action.status == s))
            .cloned()
            .collect();
        actions.sort_by_key(PendingAction::replay_key);
        actions
    }

    pub fn len(&self) -> usize {
        self.lock().actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mark_syncing(&self, local_id: &LocalId) -> Result<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let action = Self::action_mut(&mut state.actions, local_id)?;
        Self::transition(action, ActionStatus::Syncing)?;
        let snapshot = action.clone();
        self.persist(&mut state.warnings, &keys::pending(local_id.as_str()), &snapshot)
    }

    /// Completes an action and removes it from the queue.
    ///
    /// For `create-event`, `server_id` is required: it is recorded as the
    /// action's [`EntityIdMapping`] and substituted into every queued action
    /// that depends on it before the action itself is removed.
    pub fn mark_synced(
        &self,
        local_id: &LocalId,
        server_id: Option<&str>,
    ) -> Result<PendingAction> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let action = Self::action_mut(&mut state.actions, local_id)?;
        if !action.status.can_transition_to(ActionStatus::Synced) {
            return Err(SyncError::InvalidTransition {
                local_id: local_id.clone(),
                from: action.status,
                to: ActionStatus::Synced,
            });
        }
        let kind = action.kind;

        if kind == ActionKind::CreateEvent {
            let server_id = server_id.ok_or_else(|| {
                SyncError::invalid_input(format!("create-event {local_id} synced without a server id"))
            })?;
            self.record_mapping(state, local_id, server_id)?;
            self.rewrite_dependents(state, local_id)?;
        }

        // Disk first: if the delete fails the action stays queued in memory too.
        self.store.remove(&keys::pending(local_id.as_str()))?;
        let mut synced = state
            .actions
            .remove(local_id)
            .ok_or_else(|| SyncError::UnknownAction(local_id.clone()))?;
        synced.status = ActionStatus::Synced;

        info!("Synced {kind} action {local_id}");
        Ok(synced)
    }

    /// Records a failed replay. The action returns to `pending` while its
    /// attempt count is below the budget and becomes `failed` once it
    /// reaches it. Returns the resulting status.
    pub fn mark_failed(&self, local_id: &LocalId, reason: FailureReason) -> Result<ActionStatus> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let action = Self::action_mut(&mut state.actions, local_id)?;
        Self::transition(action, ActionStatus::Failed)?;

        action.attempts += 1;
        if action.attempts < self.max_attempts {
            action.status = ActionStatus::Pending;
            debug!(
                "Action {local_id} failed attempt {}/{}: {reason}",
                action.attempts, self.max_attempts
            );
        } else {
            warn!(
                "Action {local_id} failed permanently after {} attempts: {reason}",
                action.attempts
            );
        }
        action.last_error = Some(reason);

        let snapshot = action.clone();
        self.persist(&mut state.warnings, &keys::pending(local_id.as_str()), &snapshot)?;
        Ok(snapshot.status)
    }

    /// Notes why a `pending` action was held back without sending it.
    /// No request was made, so the attempt count is left alone.
    pub fn mark_waiting(&self, local_id: &LocalId, reason: FailureReason) -> Result<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let action = Self::action_mut(&mut state.actions, local_id)?;
        if action.status != ActionStatus::Pending {
            return Err(SyncError::InvalidTransition {
                local_id: local_id.clone(),
                from: action.status,
                to: ActionStatus::Pending,
            });
        }
        debug!("Action {local_id} waiting: {reason}");
        action.last_error = Some(reason);

        let snapshot = action.clone();
        self.persist(&mut state.warnings, &keys::pending(local_id.as_str()), &snapshot)
    }

    /// Fails an action permanently regardless of its remaining budget.
    pub fn abandon(&self, local_id: &LocalId, reason: FailureReason) -> Result<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let action = Self::action_mut(&mut state.actions, local_id)?;
        Self::transition(action, ActionStatus::Failed)?;
        action.attempts += 1;
        warn!("Action {local_id} abandoned: {reason}");
        action.last_error = Some(reason);

        let snapshot = action.clone();
        self.persist(&mut state.warnings, &keys::pending(local_id.as_str()), &snapshot)
    }

    pub fn remove(&self, local_id: &LocalId) -> Result<Option<PendingAction>> {
        let removed = self.lock().actions.remove(local_id);
        if removed.is_some() {
            self.store.remove(&keys::pending(local_id.as_str()))?;
            info!("Removed action {local_id}");
        }
        Ok(removed)
    }

    /// Moves every `failed` action back to `pending` with a fresh budget.
    pub fn retry_failed(&self) -> Result<usize> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let mut retried = Vec::new();
        for action in state.actions.values_mut() {
            if action.status == ActionStatus::Failed {
                action.status = ActionStatus::Pending;
                action.attempts = 0;
                action.last_error = None;
                retried.push(action.clone());
            }
        }
        for action in &retried {
            self.persist(
                &mut state.warnings,
                &keys::pending(action.local_id.as_str()),
                action,
            )?;
        }

        if !retried.is_empty() {
            info!("Re-queued {} failed actions", retried.len());
        }
        Ok(retried.len())
    }

    pub fn failed_summary(&self) -> FailedSummary {
        let items: Vec<FailedItem> = self
            .list(Some(ActionStatus::Failed))
            .into_iter()
            .map(|action| FailedItem {
                local_id: action.local_id,
                kind: action.kind,
                attempts: action.attempts,
                reason: action.last_error,
            })
            .collect();
        FailedSummary {
            count: items.len(),
            items,
        }
    }

    /// Server id for an offline-created entity, once synced.
    pub fn resolve(&self, local_id: &LocalId) -> Option<String> {
        self.lock()
            .mappings
            .get(local_id)
            .map(|mapping| mapping.server_id.clone())
    }

    pub fn mapping(&self, local_id: &LocalId) -> Option<EntityIdMapping> {
        self.lock().mappings.get(local_id).cloned()
    }

    pub fn dependency_state(&self, dependency: &LocalId) -> DependencyState {
        let state = self.lock();
        if let Some(mapping) = state.mappings.get(dependency) {
            return DependencyState::Resolved(mapping.server_id.clone());
        }
        match state.actions.get(dependency) {
            Some(action) if action.kind == ActionKind::CreateEvent => {
                DependencyState::Queued(action.status)
            }
            _ => DependencyState::Missing,
        }
    }

    /// Substitutes `server_id` for the action's dependency and clears it.
    pub fn resolve_dependency(&self, local_id: &LocalId, server_id: &str) -> Result<PendingAction> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let action = Self::action_mut(&mut state.actions, local_id)?;
        Self::apply_server_id(action, server_id);
        let snapshot = action.clone();
        self.persist(&mut state.warnings, &keys::pending(local_id.as_str()), &snapshot)?;
        Ok(snapshot)
    }

    /// Drains the storage warnings recorded since the last call.
    pub fn take_warnings(&self) -> Vec<StorageWarning> {
        std::mem::take(&mut self.lock().warnings)
    }

    fn record_mapping(&self, state: &mut QueueState, local_id: &LocalId, server_id: &str) -> Result<()> {
        if let Some(existing) = state.mappings.get(local_id) {
            if existing.server_id != server_id {
                warn!(
                    "Ignoring remap of {local_id} to {server_id}; already mapped to {}",
                    existing.server_id
                );
            }
            return Ok(());
        }

        let mapping = EntityIdMapping {
            local_id: local_id.clone(),
            server_id: server_id.to_string(),
            mapped_at: Utc::now(),
        };
        state.mappings.insert(local_id.clone(), mapping.clone());
        self.persist(&mut state.warnings, &keys::id_map(local_id.as_str()), &mapping)?;
        info!("Mapped {local_id} -> {server_id}");
        Ok(())
    }

    fn rewrite_dependents(&self, state: &mut QueueState, local_id: &LocalId) -> Result<()> {
        let server_id = match state.mappings.get(local_id) {
            Some(mapping) => mapping.server_id.clone(),
            None => return Ok(()),
        };

        let mut rewritten = Vec::new();
        for action in state.actions.values_mut() {
            if action.depends_on.as_ref() == Some(local_id) {
                Self::apply_server_id(action, &server_id);
                rewritten.push(action.clone());
            }
        }
        for action in &rewritten {
            self.persist(
                &mut state.warnings,
                &keys::pending(action.local_id.as_str()),
                action,
            )?;
        }
        if !rewritten.is_empty() {
            debug!("Rewrote {} actions waiting on {local_id}", rewritten.len());
        }
        Ok(())
    }

    fn apply_server_id(action: &mut PendingAction, server_id: &str) {
        if let Some(field) = action.kind.dependency_field() {
            substitute_id(&mut action.payload, field, server_id);
        }
        action.depends_on = None;
    }

    fn action_mut<'a>(
        actions: &'a mut HashMap<LocalId, PendingAction>,
        local_id: &LocalId,
    ) -> Result<&'a mut PendingAction> {
        actions
            .get_mut(local_id)
            .ok_or_else(|| SyncError::UnknownAction(local_id.clone()))
    }

    fn transition(action: &mut PendingAction, next: ActionStatus) -> Result<()> {
        if !action.status.can_transition_to(next) {
            return Err(SyncError::InvalidTransition {
                local_id: action.local_id.clone(),
                from: action.status,
                to: next,
            });
        }
        debug!("Action {}: {} -> {}", action.local_id, action.status, next);
        action.status = next;
        Ok(())
    }

    /// Writes through to the store. A full store leaves the change in memory
    /// and records a warning instead of failing the caller.
    fn persist<T: Serialize>(
        &self,
        warnings: &mut Vec<StorageWarning>,
        key: &str,
        value: &T,
    ) -> Result<()> {
        match write_json(self.store.as_ref(), key, value) {
            Ok(()) => Ok(()),
            Err(e) if e.is_storage_full() => {
                warn!("Storage full; {key} kept in memory only");
                warnings.push(StorageWarning {
                    key: key.to_string(),
                    message: e.to_string(),
                });
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
