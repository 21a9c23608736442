//! Replays queued actions against the server.
//!
//! A drain works on a snapshot of the `pending` actions taken when it starts,
//! oldest first, one request at a time. Anything enqueued during a drain waits
//! for the next trigger. Only one drain runs at a time; a trigger that arrives
//! while one is running returns immediately.
//!
//! An action whose event is still queued ahead of it in the same batch is
//! moved to the back once. If the event still has no server id when the
//! action comes up again, it stays `pending` with an `unresolved-dependency`
//! reason; no request is sent and no attempt is spent. Actions whose event
//! failed for good or is unknown are failed without a request.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::connectivity::ConnectivityMonitor;
use crate::error::ApiError;
use crate::pending_queue::{DependencyState, PendingActionQueue};
use crate::server_api::{replay, server_id_of, ServerApi};
use crate::sync_model::{ActionKind, ActionStatus, FailureReason, LocalId, PendingAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DrainOutcome {
    Completed,
    /// Another drain was running; nothing was done.
    AlreadyDraining,
    /// The monitor reported no connectivity; nothing was done.
    Offline,
}

/// What one drain did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub outcome: DrainOutcome,
    /// Removed from the queue; status `synced`, payload as replayed.
    pub synced: Vec<PendingAction>,
    /// Not synced this time; still `pending` for the next drain.
    pub retrying: Vec<PendingAction>,
    /// Out of attempts or unresolvable; will not be retried automatically.
    pub failed: Vec<PendingAction>,
    /// Actions moved behind the event they depend on.
    pub deferred: usize,
}

impl DrainReport {
    fn new(outcome: DrainOutcome) -> Self {
        Self {
            outcome,
            synced: Vec::new(),
            retrying: Vec::new(),
            failed: Vec::new(),
            deferred: 0,
        }
    }

    pub fn attempted(&self) -> usize {
        self.synced.len() + self.retrying.len() + self.failed.len()
    }
}

struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| DrainGuard(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncReconciler {
    queue: Arc<PendingActionQueue>,
    api: Arc<dyn ServerApi>,
    monitor: Arc<ConnectivityMonitor>,
    request_timeout: Duration,
    draining: AtomicBool,
}

impl SyncReconciler {
    pub fn new(
        queue: Arc<PendingActionQueue>,
        api: Arc<dyn ServerApi>,
        monitor: Arc<ConnectivityMonitor>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            api,
            monitor,
            request_timeout,
            draining: AtomicBool::new(false),
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Runs one drain over the currently pending actions.
    pub async fn drain(&self) -> DrainReport {
        if !self.monitor.is_online() {
            return DrainReport::new(DrainOutcome::Offline);
        }
        let Some(_guard) = DrainGuard::acquire(&self.draining) else {
            info!("Drain already running; trigger ignored");
            return DrainReport::new(DrainOutcome::AlreadyDraining);
        };

        let mut report = DrainReport::new(DrainOutcome::Completed);
        let mut work: VecDeque<PendingAction> = self.queue.list(Some(ActionStatus::Pending)).into();
        if work.is_empty() {
            return report;
        }
        info!("Draining {} pending actions", work.len());

        let mut deferred: HashSet<LocalId> = HashSet::new();
        while let Some(queued) = work.pop_front() {
            // Earlier items may have rewritten this one since the snapshot.
            let Some(mut action) = self.queue.get(&queued.local_id) else {
                continue;
            };
            if action.status != ActionStatus::Pending {
                continue;
            }

            if let Some(dependency) = action.depends_on.clone() {
                match self.queue.dependency_state(&dependency) {
                    DependencyState::Resolved(server_id) => {
                        match self.queue.resolve_dependency(&action.local_id, &server_id) {
                            Ok(resolved) => action = resolved,
                            Err(e) => {
                                error!("Could not rewrite {}: {e}", action.local_id);
                                continue;
                            }
                        }
                    }
                    DependencyState::Queued(ActionStatus::Pending)
                        if !deferred.contains(&action.local_id)
                            && work.iter().any(|later| later.local_id == dependency) =>
                    {
                        deferred.insert(action.local_id.clone());
                        report.deferred += 1;
                        work.push_back(action);
                        continue;
                    }
                    DependencyState::Queued(ActionStatus::Failed) | DependencyState::Missing => {
                        self.abandon(&action.local_id, dependency, &mut report);
                        continue;
                    }
                    DependencyState::Queued(_) => {
                        self.wait_for(&action.local_id, dependency, &mut report);
                        continue;
                    }
                }
            }

            self.replay_action(action, &mut report).await;
        }

        info!(
            "Drain finished: {} synced, {} retrying, {} failed",
            report.synced.len(),
            report.retrying.len(),
            report.failed.len()
        );
        report
    }

    /// Drains every time the monitor reports that connectivity came back.
    pub fn spawn_auto_sync(self: &Arc<Self>) -> JoinHandle<()> {
        let reconciler = Arc::clone(self);
        let mut changes = self.monitor.subscribe();
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let online = *changes.borrow_and_update();
                if online {
                    let report = reconciler.drain().await;
                    if !report.failed.is_empty() {
                        warn!("{} actions failed to sync", report.failed.len());
                    }
                }
            }
        })
    }

    async fn replay_action(&self, action: PendingAction, report: &mut DrainReport) {
        let local_id = action.local_id.clone();
        if let Err(e) = self.queue.mark_syncing(&local_id) {
            error!("Could not start replay of {local_id}: {e}");
            return;
        }

        let call = replay(self.api.as_ref(), action.kind, &action.payload);
        let result = match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::Timeout(self.request_timeout)),
        };

        let resource = match result {
            Ok(resource) => resource,
            Err(err) => {
                self.record_failure(&local_id, FailureReason::from(&err), report);
                return;
            }
        };

        let server_id = match action.kind {
            ActionKind::CreateEvent => match server_id_of(&resource) {
                Some(id) => Some(id),
                None => {
                    let reason = FailureReason::from(&ApiError::MalformedResponse(
                        "created event has no id".into(),
                    ));
                    self.record_failure(&local_id, reason, report);
                    return;
                }
            },
            ActionKind::Register | ActionKind::CheckIn => None,
        };

        match self.queue.mark_synced(&local_id, server_id.as_deref()) {
            Ok(synced) => report.synced.push(synced),
            Err(e) => error!("Could not complete {local_id}: {e}"),
        }
    }

    fn record_failure(&self, local_id: &LocalId, reason: FailureReason, report: &mut DrainReport) {
        match self.queue.mark_failed(local_id, reason) {
            Ok(status) => {
                if let Some(action) = self.queue.get(local_id) {
                    match status {
                        ActionStatus::Failed => report.failed.push(action),
                        _ => report.retrying.push(action),
                    }
                }
            }
            Err(e) => error!("Could not record failure of {local_id}: {e}"),
        }
    }

    fn wait_for(&self, local_id: &LocalId, dependency: LocalId, report: &mut DrainReport) {
        let reason = FailureReason::UnresolvedDependency {
            depends_on: dependency,
        };
        match self.queue.mark_waiting(local_id, reason) {
            Ok(()) => {
                if let Some(action) = self.queue.get(local_id) {
                    report.retrying.push(action);
                }
            }
            Err(e) => error!("Could not hold back {local_id}: {e}"),
        }
    }

    fn abandon(&self, local_id: &LocalId, dependency: LocalId, report: &mut DrainReport) {
        let reason = FailureReason::UnresolvedDependency {
            depends_on: dependency,
        };
        match self.queue.abandon(local_id, reason) {
            Ok(()) => {
                if let Some(action) = self.queue.get(local_id) {
                    report.failed.push(action);
                }
            }
            Err(e) => error!("Could not abandon {local_id}: {e}"),
        }
    }
}
