//! Generation result caches
//!
//! The core only needs `get`/`set`; eviction is left to implementations.
//! `get` returns `None` for a missing key, which is distinct from a stored
//! JSON `null`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

use crate::canonical::sha256_hex;
use crate::error::{Result, StepwiseError};

/// Key/value store for generation results
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> Result<()>;
}

/// Process-local cache
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct FileEntry {
    key: String,
    value: Value,
}

/// One JSON file per key under a directory, named by the key's SHA-256
#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sha256_hex(key)))
    }
}

#[async_trait]
impl Cache for FileCache {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StepwiseError::Cache(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )));
            }
        };
        let entry: FileEntry = serde_json::from_slice(&bytes).map_err(|e| {
            StepwiseError::Cache(format!("Corrupt cache entry {}: {}", path.display(), e))
        })?;
        if entry.key != key {
            debug!(path = %path.display(), "cache file holds a different key");
            return Ok(None);
        }
        Ok(Some(entry.value))
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            StepwiseError::Cache(format!("Failed to create {}: {}", self.dir.display(), e))
        })?;
        let path = self.path_for(key);
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4()));
        let bytes = serde_json::to_vec(&FileEntry {
            key: key.to_string(),
            value,
        })?;
        tokio::fs::write(&tmp, bytes).await.map_err(|e| {
            StepwiseError::Cache(format!("Failed to write {}: {}", tmp.display(), e))
        })?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| {
            StepwiseError::Cache(format!("Failed to move {} into place: {}", path.display(), e))
        })?;
        Ok(())
    }
}
