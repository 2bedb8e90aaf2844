use agrilink::cli::{self, Cli};
use agrilink::config::AppConfig;
use agrilink::runtime::SyncRuntime;
use agrilink::telemetry::init_tracing;
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let cfg = AppConfig::from_env()?;
    init_tracing(&cfg.log_filter);

    info!(
        backend = %cfg.backend_url.as_ref().map(|u| u.as_str()).unwrap_or("local"),
        realtime = %cfg.realtime_url.as_ref().map(|u| u.as_str()).unwrap_or("local"),
        storage = ?cfg.storage_backend,
        storage_dir = %cfg.storage_dir.display(),
        handshake_timeout_ms = cfg.handshake_timeout_ms,
        probe_interval_ms = cfg.probe_interval_ms,
        replay_max_attempts = cfg.replay_max_attempts,
        "starting agrilink"
    );

    let runtime = SyncRuntime::init(&cfg).await?;
    let outcome = cli::run(cli.command, &runtime).await;
    runtime.dispose_all().await;
    outcome
}
