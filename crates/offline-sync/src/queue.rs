use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backend_sdk::{BackendError, BackendResult, MatchKey, RemoteBackend};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{cache_key, CacheEntry, CachedData, CACHE_PREFIX};
use crate::clock::{Clock, SystemClock};
use crate::mutation::{DeadLetter, MutationId, Operation, QueuedMutation};
use crate::network::{NetworkMonitor, NetworkStatus, StatusSubscription, Transition};
use crate::storage::{LocalStorage, StorageError, StorageResult};
use crate::QueueConfig;

pub const QUEUE_KEY: &str = "offline_sync_queue";
pub const DEAD_LETTER_KEY: &str = "offline_dead_letters";

const EVENT_CAPACITY: usize = 64;
const DISPOSE_GRACE: Duration = Duration::from_secs(5);

/// Outcome of [`OfflineQueue::enqueue`]. The mutation is queued in memory
/// even when `persisted` is an error; before [`OfflineQueue::init`] it is
/// always [`StorageError::NotLoaded`] and `init` writes it out.
#[derive(Debug, Clone)]
pub struct Enqueued {
    pub id: MutationId,
    pub persisted: StorageResult<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaySkip {
    Offline,
    Empty,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayReport {
    pub skipped: Option<ReplaySkip>,
    pub succeeded: Vec<MutationId>,
    pub failed: Vec<MutationId>,
    /// Entries left untouched because their backoff was not due or the
    /// network dropped mid-pass.
    pub deferred: usize,
    pub dead_lettered: Vec<MutationId>,
}

impl ReplayReport {
    fn skipped(reason: ReplaySkip) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }

    pub fn any_succeeded(&self) -> bool {
        !self.succeeded.is_empty()
    }
}

/// Durable mutation queue with a read-through cache and network status.
///
/// Cloning is cheap and every clone shares the same state.
#[derive(Clone)]
pub struct OfflineQueue {
    inner: Arc<Inner>,
}

struct Inner {
    storage: Arc<dyn LocalStorage>,
    backend: Arc<dyn RemoteBackend>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    entries: Mutex<Vec<QueuedMutation>>,
    dead: Mutex<Vec<DeadLetter>>,
    network: Arc<NetworkMonitor>,
    replay_lock: tokio::sync::Mutex<()>,
    persist_lock: tokio::sync::Mutex<()>,
    dead_letters: broadcast::Sender<DeadLetter>,
    reports: broadcast::Sender<ReplayReport>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Timer for the earliest backoff expiry and the instant it targets.
    wake: Mutex<Option<(DateTime<Utc>, JoinHandle<()>)>>,
    loaded: AtomicBool,
    disposed: AtomicBool,
}

impl OfflineQueue {
    pub fn new(
        storage: Arc<dyn LocalStorage>,
        backend: Arc<dyn RemoteBackend>,
        config: QueueConfig,
    ) -> Self {
        Self::with_clock(storage, backend, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        storage: Arc<dyn LocalStorage>,
        backend: Arc<dyn RemoteBackend>,
        config: QueueConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (dead_letters, _) = broadcast::channel(EVENT_CAPACITY);
        let (reports, _) = broadcast::channel(EVENT_CAPACITY);
        let network = NetworkMonitor::new(NetworkStatus::from_online(config.initially_online));
        Self {
            inner: Arc::new(Inner {
                storage,
                backend,
                clock,
                config,
                entries: Mutex::new(Vec::new()),
                dead: Mutex::new(Vec::new()),
                network,
                replay_lock: tokio::sync::Mutex::new(()),
                persist_lock: tokio::sync::Mutex::new(()),
                dead_letters,
                reports,
                tasks: Mutex::new(Vec::new()),
                wake: Mutex::new(None),
                loaded: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Reloads the durable queue and dead letters. Nothing is written to
    /// storage until this has run. Entries restored from storage go ahead of
    /// anything enqueued before `init`, and the merged lists are written
    /// back. Returns the number of restored queue entries.
    pub async fn init(&self) -> StorageResult<usize> {
        let restored: Vec<QueuedMutation> = self.load_list(QUEUE_KEY).await?;
        let dead: Vec<DeadLetter> = self.load_list(DEAD_LETTER_KEY).await?;
        let count = restored.len();
        let buffered = {
            let mut entries = self.inner.entries.lock();
            let buffered = entries.len();
            let known: HashSet<MutationId> = entries.iter().map(|m| m.id.clone()).collect();
            let mut merged: Vec<QueuedMutation> = restored
                .into_iter()
                .filter(|m| !known.contains(&m.id))
                .collect();
            merged.append(&mut entries);
            *entries = merged;
            buffered
        };
        let buffered_dead = {
            let mut current = self.inner.dead.lock();
            let buffered = current.len();
            let known: HashSet<MutationId> =
                current.iter().map(|d| d.mutation.id.clone()).collect();
            let mut merged: Vec<DeadLetter> = dead
                .into_iter()
                .filter(|d| !known.contains(&d.mutation.id))
                .collect();
            merged.append(&mut current);
            *current = merged;
            buffered
        };
        self.inner.loaded.store(true, Ordering::SeqCst);
        if buffered > 0 {
            self.persist_queue().await?;
        }
        if buffered_dead > 0 {
            self.persist_dead_letters().await?;
        }
        info!(
            target = "offline_sync.queue",
            restored = count,
            buffered,
            dead_letters = self.inner.dead.lock().len(),
            "offline queue loaded"
        );
        Ok(count)
    }

    async fn load_list<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Vec<T>> {
        let Some(raw) = self.inner.storage.get(key).await? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str(&raw) {
            Ok(list) => Ok(list),
            Err(err) => {
                warn!(
                    target = "offline_sync.queue",
                    key,
                    error = %err,
                    "stored list is unreadable; starting empty"
                );
                Ok(Vec::new())
            }
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.network.current().is_online()
    }

    pub fn network_status(&self) -> NetworkStatus {
        self.inner.network.current()
    }

    /// External connectivity signal. Going online starts a replay pass.
    pub fn set_network_status(&self, status: NetworkStatus) {
        match self.inner.network.set(status) {
            Transition::Unchanged => {}
            Transition::WentOnline => {
                info!(target = "offline_sync.network", "network online");
                self.spawn_replay();
            }
            Transition::WentOffline => {
                info!(target = "offline_sync.network", "network offline");
            }
        }
    }

    /// Registers `callback`, calling it right away with the current status
    /// and then on every transition.
    pub fn add_network_status_listener<F>(&self, callback: F) -> StatusSubscription
    where
        F: Fn(NetworkStatus) + Send + Sync + 'static,
    {
        self.inner.network.add_listener(Arc::new(callback))
    }

    pub fn network_status_stream(&self) -> watch::Receiver<NetworkStatus> {
        self.inner.network.subscribe()
    }

    pub async fn enqueue(
        &self,
        resource: impl Into<String>,
        operation: Operation,
        payload: Value,
    ) -> Enqueued {
        let mutation = QueuedMutation::new(resource, operation, payload, self.inner.clock.now());
        let id = mutation.id.clone();
        debug!(
            target = "offline_sync.queue",
            id = %id,
            resource = %mutation.resource,
            operation = %mutation.operation,
            "enqueue"
        );
        self.inner.entries.lock().push(mutation);
        let persisted = self.persist_queue().await;
        if let Err(err) = &persisted {
            warn!(
                target = "offline_sync.queue",
                id = %id,
                error = %err,
                "queue persist failed; mutation kept in memory"
            );
        }
        if self.is_online() {
            self.spawn_replay();
        }
        Enqueued { id, persisted }
    }

    /// One sequential pass over the queue in insertion order. Failed
    /// entries stay in place; later entries are still attempted.
    pub async fn replay(&self) -> ReplayReport {
        if !self.is_online() {
            return ReplayReport::skipped(ReplaySkip::Offline);
        }
        let _pass = self.inner.replay_lock.lock().await;
        let snapshot = self.inner.entries.lock().clone();
        if snapshot.is_empty() {
            return ReplayReport::skipped(ReplaySkip::Empty);
        }

        let started = self.inner.clock.now();
        let mut report = ReplayReport::default();
        let mut failures: Vec<(MutationId, String)> = Vec::new();
        for mutation in &snapshot {
            if !self.is_online() || !mutation.is_due(started) {
                report.deferred += 1;
                continue;
            }
            match self.attempt(mutation).await {
                Ok(()) => report.succeeded.push(mutation.id.clone()),
                Err(err) => {
                    debug!(
                        target = "offline_sync.replay",
                        id = %mutation.id,
                        error = %err,
                        "replay attempt failed"
                    );
                    report.failed.push(mutation.id.clone());
                    failures.push((mutation.id.clone(), err.to_string()));
                }
            }
        }

        let dead = self.settle(&report.succeeded, failures);
        report.dead_lettered = dead.iter().map(|d| d.mutation.id.clone()).collect();

        if !report.succeeded.is_empty() || !report.failed.is_empty() {
            if let Err(err) = self.persist_queue().await {
                warn!(target = "offline_sync.replay", error = %err, "queue persist failed after replay");
            }
        }
        if !dead.is_empty() {
            if let Err(err) = self.persist_dead_letters().await {
                warn!(target = "offline_sync.replay", error = %err, "dead letter persist failed");
            }
            for letter in dead {
                warn!(
                    target = "offline_sync.replay",
                    id = %letter.mutation.id,
                    resource = %letter.mutation.resource,
                    attempts = letter.mutation.attempts,
                    reason = %letter.reason,
                    "mutation dead-lettered"
                );
                let _ = self.inner.dead_letters.send(letter);
            }
        }

        self.schedule_wake();

        info!(
            target = "offline_sync.replay",
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            deferred = report.deferred,
            dead_lettered = report.dead_lettered.len(),
            "replay pass finished"
        );
        let _ = self.inner.reports.send(report.clone());
        report
    }

    /// One remote call, bounded by the configured request timeout.
    async fn attempt(&self, mutation: &QueuedMutation) -> BackendResult<()> {
        let limit = self.inner.config.request_timeout;
        match tokio::time::timeout(limit, self.apply(mutation)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(BackendError::Unavailable(format!(
                "no response within {}ms",
                limit.as_millis()
            ))),
        }
    }

    async fn apply(&self, mutation: &QueuedMutation) -> BackendResult<()> {
        let backend = &self.inner.backend;
        let resource = mutation.resource.as_str();
        match mutation.operation {
            Operation::Insert => backend.insert(resource, &mutation.payload).await,
            Operation::Update => {
                let key = MatchKey::from_payload(&mutation.payload, &self.inner.config.match_column)?;
                backend.update(resource, &mutation.payload, &key).await
            }
            Operation::Delete => {
                let key = MatchKey::from_payload(&mutation.payload, &self.inner.config.match_column)?;
                backend.delete(resource, &key).await
            }
        }
    }

    /// Applies a pass outcome to the live queue: successes leave in one
    /// batch, failures get their backoff bumped or are dead-lettered.
    fn settle(
        &self,
        succeeded: &[MutationId],
        failures: Vec<(MutationId, String)>,
    ) -> Vec<DeadLetter> {
        let now = self.inner.clock.now();
        let policy = self.inner.config.retry;
        let done: HashSet<&MutationId> = succeeded.iter().collect();
        let mut dead = Vec::new();
        {
            let mut entries = self.inner.entries.lock();
            entries.retain(|m| !done.contains(&m.id));
            for (id, reason) in failures {
                let Some(pos) = entries.iter().position(|m| m.id == id) else {
                    continue;
                };
                let entry = &mut entries[pos];
                entry.attempts = entry.attempts.saturating_add(1);
                entry.last_error = Some(reason.clone());
                if policy.exhausted(entry.attempts) {
                    let mutation = entries.remove(pos);
                    dead.push(DeadLetter {
                        mutation,
                        reason,
                        dead_lettered_at: now,
                    });
                } else {
                    entry.next_attempt_at = Some(after(now, policy.backoff(entry.attempts)));
                }
            }
        }
        if !dead.is_empty() {
            self.inner.dead.lock().extend(dead.iter().cloned());
        }
        dead
    }

    fn spawn_replay(&self) {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(target = "offline_sync.replay", "no runtime; replay left to caller");
            return;
        };
        let queue = self.clone();
        let task = runtime.spawn(async move {
            queue.replay().await;
        });
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Arms one timer for the earliest backoff that has not expired yet, so
    /// deferred entries get their next attempt without any other trigger.
    /// An already armed timer that fires no later is kept.
    fn schedule_wake(&self) {
        if self.inner.disposed.load(Ordering::SeqCst) || !self.is_online() {
            return;
        }
        let now = self.inner.clock.now();
        let earliest = self
            .inner
            .entries
            .lock()
            .iter()
            .filter_map(|m| m.next_attempt_at)
            .filter(|at| *at > now)
            .min();
        let Some(due) = earliest else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let mut wake = self.inner.wake.lock();
        if let Some((armed, task)) = wake.as_ref() {
            if *armed <= due && !task.is_finished() {
                return;
            }
        }
        let delay = (due - now).to_std().unwrap_or(Duration::ZERO);
        debug!(target = "offline_sync.replay", delay_ms = delay.as_millis() as u64, "replay wake armed");
        let queue = self.clone();
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut wake = queue.inner.wake.lock();
                if matches!(wake.as_ref(), Some((armed, _)) if *armed == due) {
                    *wake = None;
                }
            }
            if !queue.is_disposed() {
                queue.replay().await;
            }
        });
        if let Some((_, previous)) = wake.replace((due, task)) {
            previous.abort();
        }
    }

    fn ensure_loaded(&self) -> StorageResult<()> {
        if self.inner.loaded.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::NotLoaded)
        }
    }

    async fn persist_queue(&self) -> StorageResult<()> {
        self.ensure_loaded()?;
        let _write = self.inner.persist_lock.lock().await;
        let raw = {
            let entries = self.inner.entries.lock();
            serde_json::to_string(&*entries).map_err(|err| StorageError::Corrupt(err.to_string()))?
        };
        self.inner.storage.set(QUEUE_KEY, &raw).await
    }

    async fn persist_dead_letters(&self) -> StorageResult<()> {
        self.ensure_loaded()?;
        let _write = self.inner.persist_lock.lock().await;
        let raw = {
            let dead = self.inner.dead.lock();
            serde_json::to_string(&*dead).map_err(|err| StorageError::Corrupt(err.to_string()))?
        };
        self.inner.storage.set(DEAD_LETTER_KEY, &raw).await
    }

    pub fn pending(&self) -> Vec<QueuedMutation> {
        self.inner.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }

    pub fn dead_letters(&self) -> broadcast::Receiver<DeadLetter> {
        self.inner.dead_letters.subscribe()
    }

    pub fn replay_reports(&self) -> broadcast::Receiver<ReplayReport> {
        self.inner.reports.subscribe()
    }

    pub fn dead_lettered(&self) -> Vec<DeadLetter> {
        self.inner.dead.lock().clone()
    }

    /// Moves a dead letter back to the tail of the queue with a fresh
    /// attempt budget. Returns `false` when no such dead letter exists.
    pub async fn retry_dead_letter(&self, id: &MutationId) -> StorageResult<bool> {
        let letter = {
            let mut dead = self.inner.dead.lock();
            match dead.iter().position(|d| &d.mutation.id == id) {
                Some(pos) => dead.remove(pos),
                None => return Ok(false),
            }
        };
        let mut mutation = letter.mutation;
        mutation.attempts = 0;
        mutation.next_attempt_at = None;
        mutation.last_error = None;
        self.inner.entries.lock().push(mutation);
        info!(target = "offline_sync.queue", id = %id, "dead letter re-enqueued");
        self.persist_dead_letters().await?;
        self.persist_queue().await?;
        if self.is_online() {
            self.spawn_replay();
        }
        Ok(true)
    }

    pub async fn discard_dead_letter(&self, id: &MutationId) -> StorageResult<bool> {
        let removed = {
            let mut dead = self.inner.dead.lock();
            let before = dead.len();
            dead.retain(|d| &d.mutation.id != id);
            dead.len() != before
        };
        if removed {
            info!(target = "offline_sync.queue", id = %id, "dead letter discarded");
            self.persist_dead_letters().await?;
        }
        Ok(removed)
    }

    pub async fn cache_data<T: Serialize + ?Sized>(&self, key: &str, data: &T) -> StorageResult<()> {
        let entry = CacheEntry {
            data: serde_json::to_value(data).map_err(|err| StorageError::Corrupt(err.to_string()))?,
            cached_at: self.inner.clock.now(),
        };
        let raw =
            serde_json::to_string(&entry).map_err(|err| StorageError::Corrupt(err.to_string()))?;
        self.inner.storage.set(&cache_key(key), &raw).await
    }

    /// Reads a cached value. Missing, unreadable or undecodable entries all
    /// come back as `{ data: None, is_fresh: false }`.
    pub async fn get_cached_data<T: DeserializeOwned>(
        &self,
        key: &str,
        max_age: Option<Duration>,
    ) -> CachedData<T> {
        let raw = match self.inner.storage.get(&cache_key(key)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return CachedData::missing(),
            Err(err) => {
                warn!(target = "offline_sync.cache", key, error = %err, "cache read failed");
                return CachedData::missing();
            }
        };
        let decoded = serde_json::from_str::<CacheEntry>(&raw).and_then(|entry| {
            let fresh = entry.is_fresh(self.inner.clock.now(), max_age);
            serde_json::from_value::<T>(entry.data).map(|data| (data, fresh))
        });
        match decoded {
            Ok((data, is_fresh)) => CachedData {
                data: Some(data),
                is_fresh,
            },
            Err(err) => {
                warn!(target = "offline_sync.cache", key, error = %err, "cache entry undecodable");
                CachedData::missing()
            }
        }
    }

    /// Removes every cache entry and leaves the queue alone. Returns the
    /// number of entries removed.
    pub async fn clear_cache(&self) -> StorageResult<usize> {
        let keys = self.inner.storage.keys().await?;
        let mut removed = 0;
        for key in keys.iter().filter(|k| k.starts_with(CACHE_PREFIX)) {
            self.inner.storage.remove(key).await?;
            removed += 1;
        }
        debug!(target = "offline_sync.cache", removed, "cache cleared");
        Ok(removed)
    }

    /// Stops background replays and writes the final queue state.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some((_, wake)) = self.inner.wake.lock().take() {
            wake.abort();
        }
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock());
        for mut task in tasks {
            if tokio::time::timeout(DISPOSE_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        if let Err(err) = self.persist_queue().await {
            warn!(target = "offline_sync.queue", error = %err, "final queue persist failed");
        }
        if let Err(err) = self.persist_dead_letters().await {
            warn!(target = "offline_sync.queue", error = %err, "final dead letter persist failed");
        }
        info!(target = "offline_sync.queue", pending = self.len(), "offline queue disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(now)
}
