//! File-backed key-value store
//!
//! One JSON file per key inside the session directory. File names are the
//! SHA-256 of the key so arbitrary video ids are safe on disk; the original
//! key is stored alongside the value. Writes go to a temporary file that is
//! fsynced and renamed into place, so a crash leaves either the old or the new
//! value, never a torn one.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{KeyValueStore, StorageError};

const ENTRY_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "tmp";

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    key: String,
    value: serde_json::Value,
}

pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open the store rooted at `dir`, creating the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.dir.join(format!("{}.{}", digest, ENTRY_EXTENSION))
    }

    async fn read_entry(path: &Path) -> Result<Option<StoredEntry>, StorageError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn entries(&self) -> Result<Vec<(PathBuf, StoredEntry)>, StorageError> {
        let mut found = Vec::new();
        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            match Self::read_entry(&path).await {
                Ok(Some(stored)) => found.push((path, stored)),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable entry"),
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        let entry = Self::read_entry(&self.entry_path(key)).await?;
        Ok(entry.filter(|e| e.key == key).map(|e| e.value))
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<(), StorageError> {
        let path = self.entry_path(key);
        let temp_path = path.with_extension(TEMP_EXTENSION);
        let content = serde_json::to_vec(&StoredEntry {
            key: key.to_string(),
            value,
        })?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, &path).await?;

        debug!(key, path = %path.display(), "Persisted entry");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.entry_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self
            .entries()
            .await?
            .into_iter()
            .map(|(_, entry)| entry.key)
            .filter(|key| key.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn clear(&self) -> Result<(), StorageError> {
        for (path, _) in self.entries().await? {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_set_get_roundtrip_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::open(temp_dir.path()).await.unwrap();
        store.set("progress:ls_demo", json!([[0.0, 2.0]])).await.unwrap();
        drop(store);

        let reopened = FileStore::open(temp_dir.path()).await.unwrap();
        assert_eq!(
            reopened.get("progress:ls_demo").await.unwrap(),
            Some(json!([[0.0, 2.0]]))
        );
        assert_eq!(reopened.get("progress:other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_keys_filter_by_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::open(temp_dir.path()).await.unwrap();
        store.set("progress:b/with/slashes", json!([])).await.unwrap();
        store.set("progress:a", json!([])).await.unwrap();
        store.set("invoice:s1", json!("lnbc1")).await.unwrap();

        let keys = store.keys("progress:").await.unwrap();
        assert_eq!(keys, vec!["progress:a", "progress:b/with/slashes"]);
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::open(temp_dir.path()).await.unwrap();
        store.set("a", json!(1)).await.unwrap();
        store.set("b", json!(2)).await.unwrap();

        store.remove("a").await.unwrap();
        store.remove("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);

        store.clear().await.unwrap();
        assert!(store.keys("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_leaves_no_temp_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::open(temp_dir.path()).await.unwrap();
        store.set("k", json!(1)).await.unwrap();
        store.set("k", json!(2)).await.unwrap();

        let mut names = Vec::new();
        let mut dir = fs::read_dir(store.dir()).await.unwrap();
        while let Some(entry) = dir.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with(".json"));
        assert_eq!(store.get("k").await.unwrap(), Some(json!(2)));
    }
}
