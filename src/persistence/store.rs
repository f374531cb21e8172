//! Key-value store implementations
//!
//! `FileStore` writes one JSON file per key with atomic tmp-rename
//! replacement. Corrupted entries are discarded and reinitialized at load
//! rather than failing startup.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{Result, VigilError};

/// Durable key-value storage abstraction
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load a value; `None` when the key is absent or its entry was corrupt.
    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>>;

    /// Persist a value under a key, replacing any previous entry.
    async fn save(&self, key: &str, value: serde_json::Value) -> Result<()>;

    /// Remove a key; absent keys are not an error.
    async fn remove(&self, key: &str) -> Result<()>;
}

/// File-backed store: one JSON file per key under a state directory
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.dir.exists() {
            tokio::fs::create_dir_all(&self.dir).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }

        let raw = tokio::fs::read_to_string(&path).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                // Corrupt entries are discarded, not fatal
                warn!(key, error = %e, "discarding corrupt store entry");
                let _ = tokio::fs::remove_file(&path).await;
                Ok(None)
            }
        }
    }

    async fn save(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.ensure_dir().await?;

        let path = self.path_for(key);
        let tmp = self.dir.join(format!("{}.json.tmp", key));
        let raw = serde_json::to_string_pretty(&value)?;

        tokio::fs::write(&tmp, raw.as_bytes()).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(key, path = %path.display(), "state saved");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }
}

/// In-memory store for tests and ephemeral runs
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn save(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Open a file store rooted at `dir`, verifying the directory is usable.
pub async fn open_file_store(dir: &Path) -> Result<FileStore> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| VigilError::Store(format!("cannot create state dir {}: {}", dir.display(), e)))?;
    Ok(FileStore::new(dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryStore::new();
        store.save("k", json!({"a": 1})).await.unwrap();
        let loaded = store.load("k").await.unwrap().unwrap();
        assert_eq!(loaded["a"], 1);

        store.remove("k").await.unwrap();
        assert!(store.load("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        store.save("metrics", json!({"total": 5})).await.unwrap();
        let loaded = store.load("metrics").await.unwrap().unwrap();
        assert_eq!(loaded["total"], 5);
    }

    #[tokio::test]
    async fn file_store_discards_corrupt_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        tokio::fs::write(dir.path().join("bad.json"), b"{not json")
            .await
            .unwrap();

        assert!(store.load("bad").await.unwrap().is_none());
        // The corrupt file is gone after load
        assert!(!dir.path().join("bad.json").exists());
    }

    #[tokio::test]
    async fn missing_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        assert!(store.load("absent").await.unwrap().is_none());
    }
}
