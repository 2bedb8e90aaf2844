use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;

use crate::storage::{LocalStorage, StorageError, StorageResult};

const DEFAULT_NAMESPACE: &str = "agrilink:sync";

/// Redis-backed storage for deployments where several workers share one
/// queue. Keys are stored under `<namespace>:<key>`.
pub struct RedisStorage {
    client: redis::Client,
    namespace: String,
    conn: OnceCell<ConnectionManager>,
}

impl RedisStorage {
    pub fn connect(url: &str) -> redis::RedisResult<Self> {
        Self::with_namespace(url, DEFAULT_NAMESPACE)
    }

    pub fn with_namespace(url: &str, namespace: impl Into<String>) -> redis::RedisResult<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            namespace: namespace.into(),
            conn: OnceCell::new(),
        })
    }

    async fn conn(&self) -> StorageResult<ConnectionManager> {
        let conn = self
            .conn
            .get_or_try_init(|| self.client.get_connection_manager())
            .await
            .map_err(to_storage_err)?;
        Ok(conn.clone())
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{key}", self.namespace)
    }
}

fn to_storage_err(err: redis::RedisError) -> StorageError {
    StorageError::Backend(err.to_string())
}

#[async_trait]
impl LocalStorage for RedisStorage {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let mut conn = self.conn().await?;
        redis::cmd("GET")
            .arg(self.namespaced(key))
            .query_async(&mut conn)
            .await
            .map_err(to_storage_err)
    }

    async fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("SET")
            .arg(self.namespaced(key))
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(to_storage_err)
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        let mut conn = self.conn().await?;
        let _: i64 = redis::cmd("DEL")
            .arg(self.namespaced(key))
            .query_async(&mut conn)
            .await
            .map_err(to_storage_err)?;
        Ok(())
    }

    async fn keys(&self) -> StorageResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let prefix = format!("{}:", self.namespace);
        let raw: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{prefix}*"))
            .query_async(&mut conn)
            .await
            .map_err(to_storage_err)?;
        let mut keys: Vec<String> = raw
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires a running redis"]
    async fn redis_storage_roundtrip() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".into());
        let storage = RedisStorage::with_namespace(&url, "agrilink:test").expect("redis");
        storage.set("cache_roundtrip", "{\"ok\":true}").await.unwrap();
        assert_eq!(
            storage.get("cache_roundtrip").await.unwrap().as_deref(),
            Some("{\"ok\":true}")
        );
        assert!(storage
            .keys()
            .await
            .unwrap()
            .contains(&"cache_roundtrip".to_string()));
        storage.remove("cache_roundtrip").await.unwrap();
        assert_eq!(storage.get("cache_roundtrip").await.unwrap(), None);
    }
}
