use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::{BackendError, BackendResult, MatchKey, RemoteBackend};

#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    Insert { resource: String, record: Value },
    Update { resource: String, patch: Value, key: MatchKey },
    Delete { resource: String, key: MatchKey },
}

/// In-memory adapter for tests and early wiring.
///
/// Rows are kept per resource. Writes can be made to fail for a given
/// resource, or for any record whose `id` equals a given value.
#[derive(Default)]
pub struct InMemoryBackend {
    tables: Mutex<HashMap<String, Vec<Value>>>,
    calls: Mutex<Vec<RecordedCall>>,
    failing_resources: Mutex<Vec<String>>,
    failing_ids: Mutex<Vec<Value>>,
    offline: AtomicBool,
    health_checks: AtomicUsize,
}

impl InMemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_resource(&self, resource: impl Into<String>) {
        self.failing_resources.lock().push(resource.into());
    }

    pub fn fail_record_id(&self, id: impl Into<Value>) {
        self.failing_ids.lock().push(id.into());
    }

    pub fn clear_failures(&self) {
        self.failing_resources.lock().clear();
        self.failing_ids.lock().clear();
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.offline.store(!reachable, Ordering::SeqCst);
    }

    pub fn rows(&self, resource: &str) -> Vec<Value> {
        self.tables
            .lock()
            .get(resource)
            .cloned()
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn health_checks(&self) -> usize {
        self.health_checks.load(Ordering::SeqCst)
    }

    fn check(&self, resource: &str, id: Option<&Value>) -> BackendResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("backend unreachable".into()));
        }
        if self.failing_resources.lock().iter().any(|r| r == resource) {
            return Err(BackendError::Rejected(format!("writes to {resource} fail")));
        }
        if let Some(id) = id {
            if self.failing_ids.lock().iter().any(|failing| failing == id) {
                return Err(BackendError::Rejected(format!("record {id} fails")));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteBackend for InMemoryBackend {
    async fn insert(&self, resource: &str, record: &Value) -> BackendResult<()> {
        self.calls.lock().push(RecordedCall::Insert {
            resource: resource.to_string(),
            record: record.clone(),
        });
        self.check(resource, record.get("id"))?;
        self.tables
            .lock()
            .entry(resource.to_string())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn update(&self, resource: &str, patch: &Value, key: &MatchKey) -> BackendResult<()> {
        self.calls.lock().push(RecordedCall::Update {
            resource: resource.to_string(),
            patch: patch.clone(),
            key: key.clone(),
        });
        self.check(resource, Some(&key.value))?;
        let mut tables = self.tables.lock();
        let rows = tables.entry(resource.to_string()).or_default();
        for row in rows.iter_mut().filter(|row| key.matches(row)) {
            if let (Some(target), Some(changes)) = (row.as_object_mut(), patch.as_object()) {
                for (field, value) in changes {
                    target.insert(field.clone(), value.clone());
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, resource: &str, key: &MatchKey) -> BackendResult<()> {
        self.calls.lock().push(RecordedCall::Delete {
            resource: resource.to_string(),
            key: key.clone(),
        });
        self.check(resource, Some(&key.value))?;
        if let Some(rows) = self.tables.lock().get_mut(resource) {
            rows.retain(|row| !key.matches(row));
        }
        Ok(())
    }

    async fn health(&self) -> BackendResult<()> {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("backend unreachable".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn applies_row_operations() {
        let backend = InMemoryBackend::new();
        backend
            .insert("projects", &json!({"id": 1, "crop": "maize", "status": "open"}))
            .await
            .unwrap();
        backend
            .insert("projects", &json!({"id": 2, "crop": "cassava", "status": "open"}))
            .await
            .unwrap();
        backend
            .update(
                "projects",
                &json!({"status": "funded"}),
                &MatchKey::new("id", 1),
            )
            .await
            .unwrap();
        backend
            .delete("projects", &MatchKey::new("id", 2))
            .await
            .unwrap();

        let rows = backend.rows("projects");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["status"], "funded");
        assert_eq!(backend.calls().len(), 4);
    }

    #[tokio::test]
    async fn injected_failures_and_reachability() {
        let backend = InMemoryBackend::new();
        backend.fail_record_id(9);
        let err = backend
            .insert("milestones", &json!({"id": 9}))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Rejected(_)));
        assert!(backend.rows("milestones").is_empty());

        backend.set_reachable(false);
        assert!(backend.health().await.is_err());
        backend.set_reachable(true);
        backend.clear_failures();
        backend.health().await.unwrap();
        backend.insert("milestones", &json!({"id": 9})).await.unwrap();
        assert_eq!(backend.health_checks(), 2);
    }
}
