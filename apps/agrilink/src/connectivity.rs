use std::sync::Arc;
use std::time::Duration;

use backend_sdk::RemoteBackend;
use offline_sync::{NetworkStatus, OfflineQueue};
use tokio::task::JoinHandle;
use tracing::debug;

/// Checks backend reachability once and feeds the result to the queue.
/// A health check slower than `limit` counts as offline.
pub async fn probe_once(
    backend: &dyn RemoteBackend,
    queue: &OfflineQueue,
    limit: Duration,
) -> NetworkStatus {
    let status = match tokio::time::timeout(limit, backend.health()).await {
        Ok(Ok(())) => NetworkStatus::Online,
        Ok(Err(err)) => {
            debug!(target = "connectivity", error = %err, "health check failed");
            NetworkStatus::Offline
        }
        Err(_) => {
            debug!(target = "connectivity", "health check timed out");
            NetworkStatus::Offline
        }
    };
    queue.set_network_status(status);
    status
}

pub fn start_probe(
    backend: Arc<dyn RemoteBackend>,
    queue: OfflineQueue,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            probe_once(backend.as_ref(), &queue, interval).await;
        }
    })
}
