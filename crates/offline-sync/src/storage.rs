//! Durable local key-value storage backing the sync queue and the cache.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(String),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("stored value is corrupt: {0}")]
    Corrupt(String),
    #[error("durable queue not loaded yet; call init first")]
    NotLoaded,
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait]
pub trait LocalStorage: Send + Sync {
    async fn get(&self, key: &str) -> StorageResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> StorageResult<()>;
    async fn remove(&self, key: &str) -> StorageResult<()>;
    async fn keys(&self) -> StorageResult<Vec<String>>;
}

/// Process-local storage; survives an `OfflineQueue` restart when the same
/// instance is shared, which is what tests use to simulate a reload.
#[derive(Default)]
pub struct MemoryStorage {
    values: Mutex<BTreeMap<String, String>>,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every subsequent `set`/`remove` fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.values.lock().clone()
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(StorageError::Backend("writes disabled".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LocalStorage for MemoryStorage {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.check_writable()?;
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        self.check_writable()?;
        self.values.lock().remove(key);
        Ok(())
    }

    async fn keys(&self) -> StorageResult<Vec<String>> {
        Ok(self.values.lock().keys().cloned().collect())
    }
}

const FILE_SUFFIX: &str = ".json";

/// One file per key under a directory. Writes go to a temp file first and
/// are renamed into place, so a crash never leaves a half-written value.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub async fn open(dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{FILE_SUFFIX}", encode_key(key)))
    }
}

#[async_trait]
impl LocalStorage for FileStorage {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let target = self.path_for(key);
        let staging = target.with_extension("json.tmp");
        tokio::fs::write(&staging, value).await?;
        tokio::fs::rename(&staging, &target).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn keys(&self) -> StorageResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(encoded) = name.strip_suffix(FILE_SUFFIX) {
                if let Some(key) = decode_key(encoded) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' | b'-' => out.push(byte as char),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

fn decode_key(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_encoding_is_reversible() {
        for key in ["offline_sync_queue", "cache_weather:nairobi/7d", "cache_ü"] {
            let encoded = encode_key(key);
            assert!(!encoded.contains('/'));
            assert!(!encoded.contains('.'));
            assert_eq!(decode_key(&encoded).as_deref(), Some(key));
        }
        assert_eq!(decode_key("bad%G1"), None);
    }

    #[tokio::test]
    async fn file_storage_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FileStorage::open(dir.path().join("store"))
            .await
            .expect("open");
        storage.set("cache_a/b", "{\"v\":1}").await.unwrap();
        storage.set("offline_sync_queue", "[]").await.unwrap();
        assert_eq!(
            storage.get("cache_a/b").await.unwrap().as_deref(),
            Some("{\"v\":1}")
        );
        assert_eq!(
            storage.keys().await.unwrap(),
            vec!["cache_a/b".to_string(), "offline_sync_queue".to_string()]
        );
        storage.remove("cache_a/b").await.unwrap();
        storage.remove("cache_a/b").await.unwrap();
        assert_eq!(storage.get("cache_a/b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_storage_write_failures() {
        let storage = MemoryStorage::new();
        storage.set("k", "v").await.unwrap();
        storage.fail_writes(true);
        assert!(storage.set("k", "w").await.is_err());
        assert!(storage.remove("k").await.is_err());
        assert_eq!(storage.get("k").await.unwrap().as_deref(), Some("v"));
    }
}
