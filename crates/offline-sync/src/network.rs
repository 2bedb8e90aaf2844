use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStatus {
    Online,
    Offline,
}

impl NetworkStatus {
    pub fn from_online(online: bool) -> Self {
        if online {
            NetworkStatus::Online
        } else {
            NetworkStatus::Offline
        }
    }

    pub fn is_online(self) -> bool {
        matches!(self, NetworkStatus::Online)
    }
}

impl fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NetworkStatus::Online => "online",
            NetworkStatus::Offline => "offline",
        })
    }
}

pub type StatusCallback = Arc<dyn Fn(NetworkStatus) + Send + Sync>;

/// Result of a status update, used by the queue to decide whether to replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    WentOnline,
    WentOffline,
}

struct Registered {
    id: u64,
    callback: StatusCallback,
}

pub(crate) struct NetworkMonitor {
    status: watch::Sender<NetworkStatus>,
    listeners: Mutex<Vec<Registered>>,
    /// Held while callbacks run: a new listener's initial call and each
    /// transition are delivered whole, one at a time. Reentrant so a
    /// callback may register listeners or report status itself.
    delivery: ReentrantMutex<()>,
    next_id: AtomicU64,
}

impl NetworkMonitor {
    pub(crate) fn new(initial: NetworkStatus) -> Arc<Self> {
        let (status, _) = watch::channel(initial);
        Arc::new(Self {
            status,
            listeners: Mutex::new(Vec::new()),
            delivery: ReentrantMutex::new(()),
            next_id: AtomicU64::new(1),
        })
    }

    pub(crate) fn current(&self) -> NetworkStatus {
        *self.status.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.status.subscribe()
    }

    pub(crate) fn set(&self, next: NetworkStatus) -> Transition {
        let _delivering = self.delivery.lock();
        let mut previous = next;
        let changed = self.status.send_if_modified(|current| {
            previous = *current;
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if !changed {
            return Transition::Unchanged;
        }
        // Callbacks run outside the lock so they may add or remove listeners.
        let callbacks: Vec<StatusCallback> = self
            .listeners
            .lock()
            .iter()
            .map(|entry| entry.callback.clone())
            .collect();
        for callback in callbacks {
            callback(next);
        }
        match (previous, next) {
            (NetworkStatus::Offline, NetworkStatus::Online) => Transition::WentOnline,
            _ => Transition::WentOffline,
        }
    }

    pub(crate) fn add_listener(self: &Arc<Self>, callback: StatusCallback) -> StatusSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _delivering = self.delivery.lock();
        self.listeners.lock().push(Registered {
            id,
            callback: callback.clone(),
        });
        callback(self.current());
        StatusSubscription {
            id,
            monitor: Arc::downgrade(self),
        }
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    fn remove(&self, id: u64) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|entry| entry.id != id);
        listeners.len() != before
    }
}

/// Handle for one status listener registration. Dropping it keeps the
/// listener registered; call [`StatusSubscription::unsubscribe`] to remove it.
#[derive(Debug)]
pub struct StatusSubscription {
    id: u64,
    monitor: Weak<NetworkMonitor>,
}

impl StatusSubscription {
    /// Removes exactly this registration. Returns `false` when it was
    /// already gone.
    pub fn unsubscribe(self) -> bool {
        self.monitor
            .upgrade()
            .map_or(false, |monitor| monitor.remove(self.id))
    }
}
