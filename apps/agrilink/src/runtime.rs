use std::sync::Arc;
use std::time::Duration;

use backend_sdk::{BackendError, InMemoryBackend, RemoteBackend, RestBackend};
use channel_registry::{AcquireError, ChannelHandle, ChannelRegistry, ChannelState};
use offline_sync::{
    CachedData, Enqueued, FileStorage, LocalStorage, MemoryStorage, NetworkStatus, OfflineQueue,
    Operation, RedisStorage, ReplayReport, StatusSubscription, StorageError,
};
use parking_lot::Mutex;
use realtime_bus::{ListenerConfig, LocalRealtime, PhoenixConfig, PhoenixRealtime, RealtimeTransport};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{AppConfig, StorageBackend};
use crate::{connectivity, metrics, observers};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("storage unavailable: {0}")]
    Storage(#[from] StorageError),
    #[error("backend client: {0}")]
    Backend(#[from] BackendError),
    #[error("REDIS_URL must be set when AGRILINK_STORAGE_BACKEND=redis")]
    MissingRedisUrl,
}

/// Remote collaborators: the data backend and the realtime feed.
pub struct Remote {
    pub backend: Arc<dyn RemoteBackend>,
    pub realtime: Arc<dyn RealtimeTransport>,
}

impl Remote {
    pub fn from_config(config: &AppConfig) -> Result<Self, RuntimeError> {
        let Some(base) = config.backend_url.clone() else {
            warn!(target = "runtime", "AGRILINK_BACKEND_URL unset; running against local doubles");
            return Ok(Self::local());
        };
        let mut rest =
            RestBackend::with_timeout(base, config.api_key.clone(), config.request_timeout())?;
        if let Some(token) = &config.access_token {
            rest = rest.with_access_token(token.clone());
        }
        let realtime: Arc<dyn RealtimeTransport> = match &config.realtime_url {
            Some(endpoint) => {
                let mut phoenix = PhoenixConfig::new(endpoint.clone(), config.api_key.clone());
                phoenix.access_token = config.access_token.clone();
                Arc::new(PhoenixRealtime::new(phoenix))
            }
            None => Arc::new(LocalRealtime::new()),
        };
        Ok(Self {
            backend: Arc::new(rest),
            realtime,
        })
    }

    pub fn local() -> Self {
        Self {
            backend: InMemoryBackend::new(),
            realtime: Arc::new(LocalRealtime::new()),
        }
    }
}

pub async fn build_storage(config: &AppConfig) -> Result<Arc<dyn LocalStorage>, RuntimeError> {
    let storage: Arc<dyn LocalStorage> = match config.storage_backend {
        StorageBackend::Memory => MemoryStorage::new(),
        StorageBackend::File => Arc::new(FileStorage::open(config.storage_dir.clone()).await?),
        StorageBackend::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .ok_or(RuntimeError::MissingRedisUrl)?;
            let storage = RedisStorage::connect(url)
                .map_err(|err| StorageError::Backend(err.to_string()))?;
            Arc::new(storage)
        }
    };
    Ok(storage)
}

/// Composes the registry and the offline queue with their background
/// tasks. This is the surface the UI layer talks to.
pub struct SyncRuntime {
    config: AppConfig,
    backend: Arc<dyn RemoteBackend>,
    registry: ChannelRegistry,
    queue: OfflineQueue,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    status_subscription: Mutex<Option<StatusSubscription>>,
}

impl SyncRuntime {
    pub async fn init(config: &AppConfig) -> Result<Self, RuntimeError> {
        let storage = build_storage(config).await?;
        let remote = Remote::from_config(config)?;
        let runtime = Self::assemble(config, storage, remote).await?;
        runtime.start_probe();
        Ok(runtime)
    }

    /// Builds the runtime from explicit parts without starting the
    /// connectivity probe.
    pub async fn assemble(
        config: &AppConfig,
        storage: Arc<dyn LocalStorage>,
        remote: Remote,
    ) -> Result<Self, RuntimeError> {
        metrics::register_all();
        let registry = ChannelRegistry::new(remote.realtime, config.registry_config());
        let queue = OfflineQueue::new(storage, remote.backend.clone(), config.queue_config());
        let restored = queue.init().await?;
        let runtime = Self {
            config: config.clone(),
            backend: remote.backend,
            registry,
            queue,
            tasks: Mutex::new(Vec::new()),
            status_subscription: Mutex::new(None),
        };
        {
            let mut tasks = runtime.tasks.lock();
            tasks.push(observers::start_dead_letter_logger(&runtime.queue));
            tasks.push(observers::start_replay_recorder(&runtime.queue));
        }
        *runtime.status_subscription.lock() = Some(observers::record_connectivity(&runtime.queue));
        info!(
            target = "runtime",
            restored,
            storage = ?config.storage_backend,
            backend = %config.backend_url.as_ref().map(|u| u.as_str()).unwrap_or("local"),
            "sync runtime ready"
        );
        Ok(runtime)
    }

    fn start_probe(&self) {
        if self.config.probe_interval_ms == 0 {
            return;
        }
        let probe = connectivity::start_probe(
            self.backend.clone(),
            self.queue.clone(),
            self.config.probe_interval(),
        );
        self.tasks.lock().push(probe);
    }

    /// One immediate reachability check.
    pub async fn check_connectivity(&self) -> NetworkStatus {
        let limit = self.config.probe_interval().max(Duration::from_secs(1));
        connectivity::probe_once(self.backend.as_ref(), &self.queue, limit).await
    }

    pub fn is_online(&self) -> bool {
        self.queue.is_online()
    }

    pub async fn synchronize(&self) -> ReplayReport {
        self.queue.replay().await
    }

    pub async fn enqueue(&self, resource: &str, operation: Operation, payload: Value) -> Enqueued {
        metrics::ENQUEUED
            .with_label_values(&[operation.as_str()])
            .inc();
        self.queue.enqueue(resource, operation, payload).await
    }

    pub async fn cache_data<T: Serialize + ?Sized>(
        &self,
        key: &str,
        data: &T,
    ) -> Result<(), StorageError> {
        self.queue.cache_data(key, data).await
    }

    pub async fn get_cached_data<T: DeserializeOwned>(
        &self,
        key: &str,
        max_age: Option<Duration>,
    ) -> CachedData<T> {
        self.queue.get_cached_data(key, max_age).await
    }

    pub async fn acquire(
        &self,
        key: &str,
        listeners: Vec<ListenerConfig>,
    ) -> Result<ChannelHandle, AcquireError> {
        let result = self.registry.acquire(key, listeners).await;
        let label = match &result {
            Ok(_) => "ok",
            Err(AcquireError::Handshake(_)) => "rejected",
            Err(AcquireError::Timeout(_)) => "timeout",
            Err(AcquireError::Released) => "released",
        };
        metrics::HANDSHAKES.with_label_values(&[label]).inc();
        result
    }

    pub async fn release(&self, key: &str) -> bool {
        self.registry.release(key).await
    }

    pub fn state_of(&self, key: &str) -> Option<ChannelState> {
        self.registry.state_of(key)
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Stops background work, releases every subscription and flushes the
    /// queue. Safe to call more than once.
    pub async fn dispose_all(&self) {
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }
        if let Some(subscription) = self.status_subscription.lock().take() {
            subscription.unsubscribe();
        }
        let released = self.registry.release_all().await;
        self.queue.dispose().await;
        info!(target = "runtime", released, "sync runtime disposed");
    }
}
