//! Durable key-value storage
//!
//! Each session gets its own namespace (a directory for the file backend).
//! Values are JSON documents; a successful `set` means the value is on disk.

pub mod file_store;
pub mod memory;

pub use file_store::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::StorageConfig;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported storage provider: {0}")]
    UnsupportedProvider(String),
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError>;

    /// Store `value` under `key`. Returns only once the write is durable.
    async fn set(&self, key: &str, value: serde_json::Value) -> Result<(), StorageError>;

    async fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// All keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Remove every key in this namespace.
    async fn clear(&self) -> Result<(), StorageError>;
}

/// Opens per-session stores.
#[derive(Clone)]
pub enum StorageBackend {
    File(PathBuf),
    Memory(Arc<Mutex<HashMap<String, Arc<MemoryStore>>>>),
}

impl StorageBackend {
    pub fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        match config.provider.as_str() {
            "file" => {
                info!(data_dir = %config.data_dir.display(), "Using file storage");
                Ok(StorageBackend::File(config.data_dir.clone()))
            }
            "memory" => {
                info!("Using in-memory storage, progress will not survive restarts");
                Ok(StorageBackend::memory())
            }
            other => Err(StorageError::UnsupportedProvider(other.to_string())),
        }
    }

    pub fn memory() -> Self {
        StorageBackend::Memory(Arc::new(Mutex::new(HashMap::new())))
    }

    /// Open (creating if needed) the store for one session.
    pub async fn open(&self, session_id: &str) -> Result<Arc<dyn KeyValueStore>, StorageError> {
        match self {
            StorageBackend::File(root) => {
                let store: Arc<dyn KeyValueStore> =
                    Arc::new(FileStore::open(root.join("sessions").join(session_id)).await?);
                Ok(store)
            }
            StorageBackend::Memory(stores) => {
                let mut guard = stores.lock().await;
                let store: Arc<dyn KeyValueStore> = guard
                    .entry(session_id.to_string())
                    .or_insert_with(|| Arc::new(MemoryStore::new()))
                    .clone();
                Ok(store)
            }
        }
    }

    /// Session ids that have a store in this backend.
    pub async fn session_ids(&self) -> Result<Vec<String>, StorageError> {
        match self {
            StorageBackend::File(root) => {
                let dir = root.join("sessions");
                if !tokio::fs::try_exists(&dir).await? {
                    return Ok(Vec::new());
                }
                let mut ids = Vec::new();
                let mut entries = tokio::fs::read_dir(&dir).await?;
                while let Some(entry) = entries.next_entry().await? {
                    if entry.file_type().await?.is_dir() {
                        if let Some(name) = entry.file_name().to_str() {
                            ids.push(name.to_string());
                        }
                    }
                }
                ids.sort();
                Ok(ids)
            }
            StorageBackend::Memory(stores) => {
                let mut ids: Vec<String> = stores.lock().await.keys().cloned().collect();
                ids.sort();
                Ok(ids)
            }
        }
    }

    /// Drop a session's namespace entirely.
    pub async fn destroy(&self, session_id: &str) -> Result<(), StorageError> {
        match self {
            StorageBackend::File(root) => {
                let dir = root.join("sessions").join(session_id);
                if tokio::fs::try_exists(&dir).await? {
                    tokio::fs::remove_dir_all(&dir).await?;
                }
                Ok(())
            }
            StorageBackend::Memory(stores) => {
                stores.lock().await.remove(session_id);
                Ok(())
            }
        }
    }
}
