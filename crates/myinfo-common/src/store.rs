//! Locked key-value storage, the persistence primitive behind the MyInfo
//! client state.

use async_trait::async_trait;
use miette::Diagnostic;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Errors emitted by key-value stores.
#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum StoreError {
    /// Filesystem or I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(myinfo::store::io))]
    Io(#[from] std::io::Error),
    /// Serialization error (e.g., JSON)
    #[error("serialization error: {0}")]
    #[diagnostic(code(myinfo::store::serde))]
    Serde(#[from] serde_json::Error),
    /// Any other error from a backend implementation
    #[error(transparent)]
    #[diagnostic(code(myinfo::store::other))]
    Other(#[from] Box<dyn StdError + Send + Sync>),
}

/// Pluggable string key-value storage.
///
/// Implementations serialize their own reads and writes; callers may share a
/// store between tasks without additional locking.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get the value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    /// Store `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: String) -> Result<(), StoreError>;
    /// Remove `key`. Removing a missing key is not an error.
    async fn del(&self, key: &str) -> Result<(), StoreError>;
}

/// In-memory store suitable for short-lived clients and tests.
#[derive(Clone, Default)]
pub struct MemoryStore(Arc<RwLock<HashMap<String, String>>>);

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.0.read().await.get(key).cloned())
    }
    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.0.write().await.insert(key.to_owned(), value);
        Ok(())
    }
    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.0.write().await.remove(key);
        Ok(())
    }
}

/// File-backed store keeping every key in one JSON object.
///
/// Values are written in plain text, so the file should live somewhere only
/// the current user can read.
///
/// Example
/// ```ignore
/// use myinfo_common::store::{FileStore, KeyValueStore};
/// let store = FileStore::new("/tmp/myinfo-state.json");
/// store.set("greeting", "hello".into()).await?;
/// ```
#[derive(Clone, Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl FileStore {
    /// Create a store backed by the JSON file at `path`. The file is created
    /// on first write.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Map<String, Value>, StoreError> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<Value>(&data)? {
            Value::Object(map) => Ok(map),
            _ => Err(StoreError::Other("store file is not a JSON object".into())),
        }
    }

    async fn save(&self, map: &Map<String, Value>) -> Result<(), StoreError> {
        let buf = serde_json::to_vec_pretty(map)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &buf).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _guard = self.lock.lock().await;
        let map = self.load().await?;
        Ok(map.get(key).and_then(Value::as_str).map(str::to_owned))
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut map = self.load().await?;
        map.insert(key.to_owned(), Value::String(value));
        self.save(&map).await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut map = self.load().await?;
        if map.remove(key).is_some() {
            self.save(&map).await?;
        } else {
            tracing::trace!(key, "delete of missing key ignored");
        }
        Ok(())
    }
}
