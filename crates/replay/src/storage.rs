//! Storage trait and implementations

use std::collections::HashMap;
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::{Result, StoreError};

#[async_trait]
pub trait StageStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn put(&self, key: &str, value: &Value) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// In-memory storage (for testing)
#[derive(Clone, Default)]
pub struct InMemoryStore {
    data: Arc<RwLock<HashMap<String, Value>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

#[async_trait]
impl StageStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &Value) -> Result<()> {
        self.data.write().await.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data.write().await.remove(key);
        Ok(())
    }
}

/// One JSON document per key inside a directory.
///
/// Writes land in a uniquely named temp file that is synced and then renamed
/// over the target, so a reader never observes a half-written record.
#[derive(Clone, Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| StoreError::Storage(format!("create {}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", urlencoding::encode(key)))
    }
}

async fn blocking<R, F>(f: F) -> Result<R>
where
    R: Send + 'static,
    F: FnOnce() -> Result<R> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Storage(format!("blocking task failed: {e}")))?
}

#[async_trait]
impl StageStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key);
        blocking(move || match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Serialization(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Storage(format!("read {}: {e}", path.display()))),
        })
        .await
    }

    async fn put(&self, key: &str, value: &Value) -> Result<()> {
        let path = self.path_for(key);
        let dir = self.dir.clone();
        let bytes =
            serde_json::to_vec_pretty(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        blocking(move || {
            // Each writer gets its own temp file; concurrent puts to one key
            // race only on the final rename.
            let write = || -> std::io::Result<()> {
                let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
                tmp.write_all(&bytes)?;
                tmp.as_file().sync_all()?;
                tmp.persist(&path).map_err(|e| e.error)?;
                Ok(())
            };
            write().map_err(|e| StoreError::Storage(format!("write {}: {e}", path.display())))
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        blocking(move || match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Storage(format!("delete {}: {e}", path.display()))),
        })
        .await
    }
}
