//! Offline-first persistence for the client: a durable mutation queue that
//! replays against the remote backend when connectivity returns, a
//! read-through cache with staleness checks, and the network status that
//! drives both.

use std::time::Duration;

mod cache;
pub mod clock;
pub mod mutation;
pub mod network;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod storage_redis;

pub use cache::CachedData;
pub use clock::{Clock, ManualClock, SystemClock};
pub use mutation::{DeadLetter, MutationId, Operation, QueuedMutation};
pub use network::{NetworkStatus, StatusSubscription};
pub use queue::{Enqueued, OfflineQueue, ReplayReport, ReplaySkip, DEAD_LETTER_KEY, QUEUE_KEY};
pub use retry::RetryPolicy;
pub use storage::{FileStorage, LocalStorage, MemoryStorage, StorageError, StorageResult};
pub use storage_redis::RedisStorage;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub retry: RetryPolicy,
    /// Status assumed until the first connectivity signal arrives.
    pub initially_online: bool,
    /// Column used to address rows for update and delete.
    pub match_column: String,
    /// Bound on one remote call during replay. A call that runs past it
    /// counts as a failed attempt.
    pub request_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            initially_online: true,
            match_column: "id".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}
