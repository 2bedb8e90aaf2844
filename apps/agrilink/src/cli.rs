use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use offline_sync::{MutationId, Operation};
use realtime_bus::{ChangeEvent, ChangeKind, ListenerConfig, RowFilter};
use serde_json::{json, Value};
use tracing::info;

use crate::metrics;
use crate::runtime::SyncRuntime;

#[derive(Parser, Debug)]
#[command(name = "agrilink")]
#[command(about = "Offline-first sync client for the Agrilink backend")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Queue a mutation; it is sent right away when the backend is reachable
    Enqueue {
        resource: String,
        /// insert, update or delete
        operation: Operation,
        /// Record as JSON; update and delete need its `id`
        payload: String,
    },
    /// Replay the queue against the backend once
    Sync,
    /// List queued mutations
    Queue {
        /// List dead-lettered mutations instead
        #[arg(long)]
        dead: bool,
    },
    /// Act on a dead-lettered mutation
    DeadLetter {
        #[command(subcommand)]
        action: DeadLetterCommand,
    },
    /// Read and write the local cache
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },
    /// Print realtime changes for a resource until Ctrl-C
    Watch {
        resource: String,
        #[arg(long)]
        event: Option<ChangeKind>,
        /// Row filter, e.g. `thread_id=eq.42`
        #[arg(long)]
        filter: Option<String>,
    },
    /// Keep probing connectivity and replaying until Ctrl-C
    Run,
    /// Show connectivity, queue and subscription state
    Status {
        /// Print prometheus metrics as well
        #[arg(long)]
        metrics: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum DeadLetterCommand {
    /// Move it back to the end of the queue
    Retry { id: String },
    /// Drop it for good
    Discard { id: String },
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    Put {
        key: String,
        json: String,
    },
    Get {
        key: String,
        #[arg(long)]
        max_age_ms: Option<u64>,
    },
    Clear,
}

pub async fn run(command: Commands, runtime: &SyncRuntime) -> Result<()> {
    match command {
        Commands::Enqueue {
            resource,
            operation,
            payload,
        } => {
            let payload: Value =
                serde_json::from_str(&payload).context("payload must be valid JSON")?;
            runtime.check_connectivity().await;
            let queued = runtime.enqueue(&resource, operation, payload).await;
            print_json(&json!({
                "id": queued.id,
                "persisted": queued.persisted.is_ok(),
                "online": runtime.is_online(),
            }))?;
            if let Err(err) = queued.persisted {
                bail!("mutation {} is queued in memory only: {err}", queued.id);
            }
        }
        Commands::Sync => {
            let status = runtime.check_connectivity().await;
            let report = runtime.synchronize().await;
            print_json(&json!({
                "status": status,
                "skipped": report.skipped.map(|s| format!("{s:?}").to_lowercase()),
                "succeeded": report.succeeded,
                "failed": report.failed,
                "deferred": report.deferred,
                "dead_lettered": report.dead_lettered,
                "pending": runtime.queue().len(),
            }))?;
        }
        Commands::Queue { dead } => {
            if dead {
                print_json(&serde_json::to_value(runtime.queue().dead_lettered())?)?;
            } else {
                print_json(&serde_json::to_value(runtime.queue().pending())?)?;
            }
        }
        Commands::DeadLetter { action } => {
            let (id, done) = match action {
                DeadLetterCommand::Retry { id } => {
                    runtime.check_connectivity().await;
                    let id = MutationId::from(id);
                    let done = runtime.queue().retry_dead_letter(&id).await?;
                    (id, done)
                }
                DeadLetterCommand::Discard { id } => {
                    let id = MutationId::from(id);
                    let done = runtime.queue().discard_dead_letter(&id).await?;
                    (id, done)
                }
            };
            if !done {
                bail!("no dead letter with id {id}");
            }
            print_json(&json!({ "id": id, "ok": true }))?;
        }
        Commands::Cache { action } => match action {
            CacheCommand::Put { key, json } => {
                let data: Value = serde_json::from_str(&json).context("cache value must be JSON")?;
                runtime.cache_data(&key, &data).await?;
            }
            CacheCommand::Get { key, max_age_ms } => {
                let cached = runtime
                    .get_cached_data::<Value>(&key, max_age_ms.map(Duration::from_millis))
                    .await;
                print_json(&json!({ "data": cached.data, "is_fresh": cached.is_fresh }))?;
            }
            CacheCommand::Clear => {
                let removed = runtime.queue().clear_cache().await?;
                print_json(&json!({ "removed": removed }))?;
            }
        },
        Commands::Watch {
            resource,
            event,
            filter,
        } => {
            let mut listener = ListenerConfig::new(resource.clone(), |change: &ChangeEvent| {
                if let Ok(line) = serde_json::to_string(change) {
                    println!("{line}");
                }
            });
            if let Some(kind) = event {
                listener = listener.on(kind);
            }
            let key = match &filter {
                Some(raw) => {
                    let parsed: RowFilter = raw.parse()?;
                    listener = listener.with_filter(parsed);
                    format!("{resource}:{raw}")
                }
                None => resource.clone(),
            };
            let handle = runtime.acquire(&key, vec![listener]).await?;
            info!(target = "cli", key = %key, topic = handle.topic(), "watching; Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            runtime.release(&key).await;
        }
        Commands::Run => {
            info!(target = "cli", "sync daemon running; Ctrl-C to stop");
            runtime.check_connectivity().await;
            tokio::signal::ctrl_c().await?;
        }
        Commands::Status { metrics: show_metrics } => {
            let status = runtime.check_connectivity().await;
            print_json(&json!({
                "status": status,
                "pending": runtime.queue().len(),
                "dead_letters": runtime.queue().dead_lettered().len(),
                "subscriptions": runtime.registry().keys(),
            }))?;
            if show_metrics {
                print!("{}", metrics::gather());
            }
        }
    }
    Ok(())
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_commands() {
        let cli = Cli::try_parse_from([
            "agrilink",
            "enqueue",
            "investments",
            "update",
            "{\"id\":\"inv-1\"}",
        ])
        .expect("enqueue");
        assert!(matches!(
            cli.command,
            Commands::Enqueue {
                operation: Operation::Update,
                ..
            }
        ));

        let cli = Cli::try_parse_from(["agrilink", "cache", "get", "weather", "--max-age-ms", "500"])
            .expect("cache get");
        assert!(matches!(
            cli.command,
            Commands::Cache {
                action: CacheCommand::Get {
                    max_age_ms: Some(500),
                    ..
                }
            }
        ));

        let cli = Cli::try_parse_from([
            "agrilink", "watch", "messages", "--event", "insert", "--filter", "thread_id=eq.4",
        ])
        .expect("watch");
        assert!(matches!(
            cli.command,
            Commands::Watch {
                event: Some(ChangeKind::Insert),
                ..
            }
        ));
    }

    #[test]
    fn rejects_unknown_operation() {
        assert!(Cli::try_parse_from(["agrilink", "enqueue", "projects", "upsert", "{}"]).is_err());
    }
}
