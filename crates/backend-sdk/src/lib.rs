//! Client-side contract for the hosted data backend.
//!
//! The sync core only needs three row operations and a reachability check:
//! [`RemoteBackend`] captures exactly that. [`RestBackend`] talks to the
//! auto-generated REST surface; [`InMemoryBackend`] backs tests and local
//! development.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod memory;
pub mod rest;

pub use memory::InMemoryBackend;
pub use rest::RestBackend;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend rejected write: {0}")]
    Rejected(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Identifies the row(s) an update or delete applies to (`column = value`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchKey {
    pub column: String,
    pub value: Value,
}

impl MatchKey {
    pub fn new(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Reads the match column out of a record payload.
    pub fn from_payload(payload: &Value, column: &str) -> BackendResult<Self> {
        match payload.get(column) {
            Some(value) if !value.is_null() => Ok(Self::new(column, value.clone())),
            _ => Err(BackendError::InvalidPayload(format!(
                "payload is missing match column `{column}`"
            ))),
        }
    }

    /// Value rendered the way PostgREST expects it after `eq.`.
    pub fn value_text(&self) -> String {
        match &self.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    pub fn matches(&self, row: &Value) -> bool {
        row.get(&self.column)
            .map(|candidate| candidate == &self.value)
            .unwrap_or(false)
    }
}

#[async_trait]
pub trait RemoteBackend: Send + Sync {
    async fn insert(&self, resource: &str, record: &Value) -> BackendResult<()>;

    async fn update(&self, resource: &str, patch: &Value, key: &MatchKey) -> BackendResult<()>;

    async fn delete(&self, resource: &str, key: &MatchKey) -> BackendResult<()>;

    /// Cheap reachability probe used as the connectivity signal.
    async fn health(&self) -> BackendResult<()>;
}
