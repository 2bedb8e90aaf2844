use offline_sync::{NetworkStatus, OfflineQueue, StatusSubscription};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::metrics;

/// Logs dead letters as they happen; the caller decides later whether to
/// retry or discard them.
pub fn start_dead_letter_logger(queue: &OfflineQueue) -> JoinHandle<()> {
    let mut dead_letters = queue.dead_letters();
    tokio::spawn(async move {
        loop {
            match dead_letters.recv().await {
                Ok(letter) => {
                    metrics::DEAD_LETTERS.inc();
                    warn!(
                        target = "sync.dead_letters",
                        id = %letter.mutation.id,
                        resource = %letter.mutation.resource,
                        operation = %letter.mutation.operation,
                        attempts = letter.mutation.attempts,
                        reason = %letter.reason,
                        "mutation needs attention"
                    );
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target = "sync.dead_letters", skipped, "dead letter log lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

pub fn start_replay_recorder(queue: &OfflineQueue) -> JoinHandle<()> {
    let mut reports = queue.replay_reports();
    tokio::spawn(async move {
        loop {
            match reports.recv().await {
                Ok(report) => {
                    let counts = [
                        ("succeeded", report.succeeded.len()),
                        ("failed", report.failed.len()),
                        ("deferred", report.deferred),
                    ];
                    for (result, count) in counts {
                        metrics::REPLAYED
                            .with_label_values(&[result])
                            .inc_by(count as u64);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(target = "sync.replay", skipped, "replay recorder lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

pub fn record_connectivity(queue: &OfflineQueue) -> StatusSubscription {
    queue.add_network_status_listener(|status: NetworkStatus| {
        metrics::CONNECTIVITY
            .with_label_values(&[&status.to_string()])
            .inc();
    })
}
