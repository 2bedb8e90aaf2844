//! Keeps at most one live realtime subscription per logical key.
//!
//! The first `acquire` for a key creates the transport channel, attaches its
//! listeners and starts the join handshake in a spawned task, raced against
//! the configured timeout. Callers arriving while the handshake is in flight
//! wait for that same outcome instead of starting another one. Failed or
//! timed out handshakes evict the entry so the next `acquire` starts fresh.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use realtime_bus::{ListenerConfig, RealtimeChannel, RealtimeTransport};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Subscribing,
    Subscribed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquireError {
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("subscription released before the handshake finished")]
    Released,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub handshake_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Shared handle to a registry-owned channel. Clones refer to the same
/// subscription; [`ChannelHandle::state`] turns `Closed` once the registry
/// lets go of it.
#[derive(Clone)]
pub struct ChannelHandle {
    key: Arc<str>,
    channel: Arc<dyn RealtimeChannel>,
    state: Arc<RwLock<ChannelState>>,
}

impl ChannelHandle {
    fn new(key: &str, channel: Arc<dyn RealtimeChannel>) -> Self {
        Self {
            key: Arc::from(key),
            channel,
            state: Arc::new(RwLock::new(ChannelState::Subscribing)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn topic(&self) -> &str {
        self.channel.topic()
    }

    pub fn state(&self) -> ChannelState {
        *self.state.read()
    }

    /// True when both handles refer to the same transport channel.
    pub fn same_channel(&self, other: &ChannelHandle) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    fn set_state(&self, state: ChannelState) {
        *self.state.write() = state;
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("key", &self.key)
            .field("topic", &self.channel.topic())
            .field("state", &self.state())
            .finish()
    }
}

type Outcome = Option<Result<(), AcquireError>>;

enum Entry {
    Subscribing {
        generation: u64,
        handle: ChannelHandle,
        outcome: watch::Receiver<Outcome>,
    },
    Subscribed {
        handle: ChannelHandle,
    },
}

struct Inner {
    transport: Arc<dyn RealtimeTransport>,
    config: RegistryConfig,
    entries: Mutex<HashMap<String, Entry>>,
    next_generation: AtomicU64,
}

#[derive(Clone)]
pub struct ChannelRegistry {
    inner: Arc<Inner>,
}

impl ChannelRegistry {
    pub fn new(transport: Arc<dyn RealtimeTransport>, config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                entries: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Returns the live channel for `key`, subscribing it first if needed.
    /// `listeners` are only attached when this call creates the channel.
    pub async fn acquire(
        &self,
        key: &str,
        listeners: Vec<ListenerConfig>,
    ) -> Result<ChannelHandle, AcquireError> {
        let (handle, mut outcome) = {
            let mut entries = self.inner.entries.lock();
            match entries.get(key) {
                Some(Entry::Subscribed { handle }) => return Ok(handle.clone()),
                Some(Entry::Subscribing {
                    handle, outcome, ..
                }) => {
                    debug!(target = "registry", key, "joining in-flight handshake");
                    (handle.clone(), outcome.clone())
                }
                None => {
                    let channel = self.inner.transport.channel(key);
                    let listener_count = listeners.len();
                    for listener in listeners {
                        channel.on_change(listener);
                    }
                    let handle = ChannelHandle::new(key, channel);
                    let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(None);
                    entries.insert(
                        key.to_string(),
                        Entry::Subscribing {
                            generation,
                            handle: handle.clone(),
                            outcome: rx.clone(),
                        },
                    );
                    debug!(
                        target = "registry",
                        key,
                        listeners = listener_count,
                        "starting handshake"
                    );
                    self.spawn_handshake(key.to_string(), generation, handle.clone(), tx);
                    (handle, rx)
                }
            }
        };

        let result = match outcome.wait_for(Option::is_some).await {
            Ok(value) => value.clone().unwrap_or(Err(AcquireError::Released)),
            Err(_) => Err(AcquireError::Released),
        };
        result.map(|()| handle)
    }

    fn spawn_handshake(
        &self,
        key: String,
        generation: u64,
        handle: ChannelHandle,
        outcome: watch::Sender<Outcome>,
    ) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let limit = inner.config.handshake_timeout;
            let result = match tokio::time::timeout(limit, handle.channel.subscribe()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(AcquireError::Handshake(err.to_string())),
                Err(_) => Err(AcquireError::Timeout(limit)),
            };
            let result = inner.settle(&key, generation, &handle, result);
            match &result {
                Ok(()) => info!(target = "registry", key = %key, "subscribed"),
                Err(err) => {
                    warn!(target = "registry", key = %key, error = %err, "subscription failed");
                    teardown(&key, &handle).await;
                }
            }
            let _ = outcome.send(Some(result));
        });
    }

    /// Releases `key`, tearing its channel down. Returns `false` when the
    /// key was not registered.
    pub async fn release(&self, key: &str) -> bool {
        let removed = self.inner.entries.lock().remove(key);
        match removed {
            None => {
                debug!(target = "registry", key, "release of unknown key");
                false
            }
            Some(Entry::Subscribed { handle }) => {
                teardown(key, &handle).await;
                info!(target = "registry", key, "released");
                true
            }
            // The handshake task sees the entry gone and tears the channel down.
            Some(Entry::Subscribing { .. }) => {
                info!(target = "registry", key, "released during handshake");
                true
            }
        }
    }

    /// Releases every registered key. Returns how many were released.
    pub async fn release_all(&self) -> usize {
        let drained: Vec<(String, Entry)> = self.inner.entries.lock().drain().collect();
        let count = drained.len();
        for (key, entry) in drained {
            if let Entry::Subscribed { handle } = entry {
                teardown(&key, &handle).await;
            }
        }
        info!(target = "registry", count, "released all subscriptions");
        count
    }

    pub fn state_of(&self, key: &str) -> Option<ChannelState> {
        self.inner.entries.lock().get(key).map(|entry| match entry {
            Entry::Subscribing { .. } => ChannelState::Subscribing,
            Entry::Subscribed { .. } => ChannelState::Subscribed,
        })
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }
}

impl Inner {
    /// Records a handshake outcome against the entry that started it. An
    /// entry released or replaced meanwhile turns the outcome into `Released`.
    fn settle(
        &self,
        key: &str,
        generation: u64,
        handle: &ChannelHandle,
        result: Result<(), AcquireError>,
    ) -> Result<(), AcquireError> {
        let mut entries = self.entries.lock();
        let current = matches!(
            entries.get(key),
            Some(Entry::Subscribing { generation: g, .. }) if *g == generation
        );
        if !current {
            return Err(AcquireError::Released);
        }
        match result {
            Ok(()) => {
                handle.set_state(ChannelState::Subscribed);
                entries.insert(
                    key.to_string(),
                    Entry::Subscribed {
                        handle: handle.clone(),
                    },
                );
                Ok(())
            }
            Err(err) => {
                entries.remove(key);
                Err(err)
            }
        }
    }
}

async fn teardown(key: &str, handle: &ChannelHandle) {
    handle.set_state(ChannelState::Closed);
    if let Err(err) = handle.channel.unsubscribe().await {
        warn!(target = "registry", key, error = %err, "channel teardown failed");
    }
}
