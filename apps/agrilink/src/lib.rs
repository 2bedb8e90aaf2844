//! Agrilink sync client: wires the realtime channel registry and the offline
//! mutation queue to the backend, plus the configuration, logging, metrics
//! and CLI around them.

pub mod cli;
pub mod config;
pub mod connectivity;
pub mod metrics;
pub mod observers;
pub mod runtime;
pub mod telemetry;

pub use config::AppConfig;
pub use runtime::{Remote, SyncRuntime};
