//! Online/offline tracking.
//!
//! The host platform feeds connectivity changes in through
//! [`ConnectivityMonitor::set_online`]. Without any signal the monitor
//! assumes the device is online; a wrong guess just makes the next replay
//! fail over the network and go through the normal retry budget.

use std::sync::{Arc, Mutex, MutexGuard};

use log::info;
use tokio::sync::watch;

type Listener = Arc<dyn Fn(bool) + Send + Sync>;

/// Handle returned by [`ConnectivityMonitor::on_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub struct ConnectivityMonitor {
    state: watch::Sender<bool>,
    listeners: Mutex<Listeners>,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(ListenerId, Listener)>,
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityMonitor {
    /// A monitor that assumes connectivity until told otherwise.
    pub fn new() -> Self {
        Self::with_status(true)
    }

    pub fn with_status(online: bool) -> Self {
        let (state, _) = watch::channel(online);
        Self {
            state,
            listeners: Mutex::new(Listeners::default()),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Feeds a platform connectivity signal. Listeners run only when the
    /// status actually changes; they are called in no particular order.
    pub fn set_online(&self, online: bool) {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if !changed {
            return;
        }

        info!(
            "Connectivity changed: {}",
            if online { "online" } else { "offline" }
        );

        // Clone out so listeners may register or remove listeners themselves.
        let listeners: Vec<Listener> = self
            .lock()
            .entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(online);
        }
    }

    pub fn on_change<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let mut listeners = self.lock();
        let id = ListenerId(listeners.next_id);
        listeners.next_id += 1;
        listeners.entries.push((id, Arc::new(callback)));
        id
    }

    /// Returns whether the listener was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.entries.len();
        listeners.entries.retain(|(entry_id, _)| *entry_id != id);
        listeners.entries.len() != before
    }

    /// A receiver that observes every status change, for async consumers.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, Listeners> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
