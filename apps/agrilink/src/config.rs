use std::path::PathBuf;
use std::time::Duration;

use channel_registry::RegistryConfig;
use offline_sync::{QueueConfig, RetryPolicy};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} is not a valid url: {source}")]
    InvalidUrl {
        var: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("cannot derive a realtime endpoint from {0}")]
    RealtimeEndpoint(Url),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Unset means local mode: in-memory backend and in-process realtime.
    pub backend_url: Option<Url>,
    pub api_key: String,
    pub access_token: Option<String>,
    pub realtime_url: Option<Url>,
    pub storage_backend: StorageBackend,
    pub storage_dir: PathBuf,
    pub redis_url: Option<String>,
    pub log_filter: String,
    pub handshake_timeout_ms: u64,
    pub probe_interval_ms: u64,
    /// Bound on each backend request, including one replayed mutation.
    pub request_timeout_ms: u64,
    pub replay_max_attempts: u32,
    pub replay_backoff_ms: u64,
    pub replay_backoff_max_ms: u64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend_url = url_var("AGRILINK_BACKEND_URL")?;
        let realtime_url = match url_var("AGRILINK_REALTIME_URL")? {
            Some(url) => Some(url),
            None => backend_url.as_ref().map(derive_realtime_url).transpose()?,
        };
        let api_key = std::env::var("AGRILINK_API_KEY").unwrap_or_default();
        let access_token = std::env::var("AGRILINK_ACCESS_TOKEN")
            .ok()
            .filter(|v| !v.is_empty());
        let storage_backend = StorageBackend::from_env();
        let storage_dir = std::env::var("AGRILINK_STORAGE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".agrilink"));
        let redis_url = std::env::var("REDIS_URL").ok();
        let log_filter =
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,agrilink=debug".into());
        Ok(Self {
            backend_url,
            api_key,
            access_token,
            realtime_url,
            storage_backend,
            storage_dir,
            redis_url,
            log_filter,
            handshake_timeout_ms: number_var("AGRILINK_HANDSHAKE_TIMEOUT_MS", 10_000),
            probe_interval_ms: number_var("AGRILINK_PROBE_INTERVAL_MS", 5_000),
            request_timeout_ms: number_var("AGRILINK_REQUEST_TIMEOUT_MS", 30_000),
            replay_max_attempts: number_var("AGRILINK_REPLAY_MAX_ATTEMPTS", 5),
            replay_backoff_ms: number_var("AGRILINK_REPLAY_BACKOFF_MS", 1_000),
            replay_backoff_max_ms: number_var("AGRILINK_REPLAY_BACKOFF_MAX_MS", 300_000),
        })
    }

    /// Everything in memory; used by tests and `AGRILINK_STORAGE_BACKEND=memory`.
    pub fn local() -> Self {
        Self {
            backend_url: None,
            api_key: String::new(),
            access_token: None,
            realtime_url: None,
            storage_backend: StorageBackend::Memory,
            storage_dir: PathBuf::from(".agrilink"),
            redis_url: None,
            log_filter: "info".into(),
            handshake_timeout_ms: 10_000,
            probe_interval_ms: 5_000,
            request_timeout_ms: 30_000,
            replay_max_attempts: 5,
            replay_backoff_ms: 1_000,
            replay_backoff_max_ms: 300_000,
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            retry: RetryPolicy {
                max_attempts: self.replay_max_attempts,
                base_backoff: Duration::from_millis(self.replay_backoff_ms),
                max_backoff: Duration::from_millis(self.replay_backoff_max_ms),
            },
            request_timeout: self.request_timeout(),
            ..QueueConfig::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    File,
    Memory,
    Redis,
}

impl StorageBackend {
    fn from_env() -> Self {
        match std::env::var("AGRILINK_STORAGE_BACKEND")
            .unwrap_or_else(|_| "file".into())
            .as_str()
        {
            "memory" => StorageBackend::Memory,
            "redis" => StorageBackend::Redis,
            _ => StorageBackend::File,
        }
    }
}

fn url_var(var: &'static str) -> Result<Option<Url>, ConfigError> {
    match std::env::var(var) {
        Ok(raw) if !raw.trim().is_empty() => Url::parse(raw.trim())
            .map(Some)
            .map_err(|source| ConfigError::InvalidUrl { var, source }),
        _ => Ok(None),
    }
}

fn number_var<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// `https://host/` becomes `wss://host/realtime/v1/websocket`.
fn derive_realtime_url(backend: &Url) -> Result<Url, ConfigError> {
    let mut url = backend.clone();
    let scheme = if backend.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme)
        .map_err(|_| ConfigError::RealtimeEndpoint(backend.clone()))?;
    url.join("realtime/v1/websocket")
        .map_err(|_| ConfigError::RealtimeEndpoint(backend.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-wide; serialize the tests touching them.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "AGRILINK_BACKEND_URL",
        "AGRILINK_REALTIME_URL",
        "AGRILINK_API_KEY",
        "AGRILINK_ACCESS_TOKEN",
        "AGRILINK_STORAGE_BACKEND",
        "AGRILINK_STORAGE_DIR",
        "AGRILINK_HANDSHAKE_TIMEOUT_MS",
        "AGRILINK_REQUEST_TIMEOUT_MS",
        "AGRILINK_REPLAY_MAX_ATTEMPTS",
    ];

    fn clear() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn defaults_without_environment() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear();
        let config = AppConfig::from_env().expect("config");
        assert!(config.backend_url.is_none());
        assert!(config.realtime_url.is_none());
        assert_eq!(config.storage_backend, StorageBackend::File);
        assert_eq!(config.storage_dir, PathBuf::from(".agrilink"));
        assert_eq!(config.handshake_timeout_ms, 10_000);
        assert_eq!(config.queue_config().request_timeout, Duration::from_secs(30));
        assert_eq!(config.queue_config().retry, RetryPolicy::default());
    }

    #[test]
    fn derives_realtime_endpoint_and_parses_numbers() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear();
        std::env::set_var("AGRILINK_BACKEND_URL", "https://farm.example.co/");
        std::env::set_var("AGRILINK_STORAGE_BACKEND", "redis");
        std::env::set_var("AGRILINK_HANDSHAKE_TIMEOUT_MS", "2500");
        std::env::set_var("AGRILINK_REPLAY_MAX_ATTEMPTS", "many");
        std::env::set_var("AGRILINK_REQUEST_TIMEOUT_MS", "750");
        let config = AppConfig::from_env().expect("config");
        clear();

        assert_eq!(
            config.realtime_url.as_ref().map(|u| u.to_string()).as_deref(),
            Some("wss://farm.example.co/realtime/v1/websocket")
        );
        assert_eq!(config.storage_backend, StorageBackend::Redis);
        assert_eq!(
            config.registry_config().handshake_timeout,
            Duration::from_millis(2500)
        );
        assert_eq!(config.replay_max_attempts, 5);
        assert_eq!(
            config.queue_config().request_timeout,
            Duration::from_millis(750)
        );
    }

    #[test]
    fn rejects_malformed_backend_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear();
        std::env::set_var("AGRILINK_BACKEND_URL", "not a url");
        let err = AppConfig::from_env().unwrap_err();
        clear();
        assert!(matches!(
            err,
            ConfigError::InvalidUrl {
                var: "AGRILINK_BACKEND_URL",
                ..
            }
        ));
    }
}
