//! Durable store backed by a local directory
//!
//! Uploads are written to a hidden temp file next to the target and renamed
//! into place, so readers never observe a half-written file.

use crate::store::error::{StoreError, StoreResult};
use crate::store::DurableStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Store rooted at a directory on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a key below the root, rejecting absolute and `..` keys
    fn resolve(&self, key: &str) -> StoreResult<PathBuf> {
        let relative = Path::new(key.trim_end_matches('/'));
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

fn is_temp_file(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(".tmp")
}

#[async_trait]
impl DurableStore for LocalFileStore {
    async fn list(&self, directory_key: &str) -> StoreResult<HashMap<String, i64>> {
        let dir = self.resolve(directory_key)?;
        let mut files = HashMap::new();

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if is_temp_file(&name) {
                continue;
            }
            let modified = metadata
                .modified()?
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            files.insert(name, modified);
        }

        Ok(files)
    }

    async fn read_bytes(&self, key: &str) -> StoreResult<Vec<u8>> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn upload(&self, bytes: Vec<u8>, key: &str) -> StoreResult<()> {
        let path = self.resolve(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::InvalidKey(key.to_string()))?;
        let file_name = path
            .file_name()
            .ok_or_else(|| StoreError::InvalidKey(key.to_string()))?
            .to_string_lossy()
            .to_string();

        tokio::fs::create_dir_all(parent).await?;

        let temp = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));
        tokio::fs::write(&temp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }

        tracing::debug!(key = %key, bytes = bytes.len(), "Uploaded file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_upload_list_read() {
        let dir = tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());

        store
            .upload(b"hello".to_vec(), "events/1/2/2024/01/01/00/a.zip")
            .await
            .unwrap();
        store
            .upload(b"world".to_vec(), "events/1/2/2024/01/01/00/b.zip")
            .await
            .unwrap();

        let listing = store.list("events/1/2/2024/01/01/00/").await.unwrap();
        assert_eq!(listing.len(), 2);
        assert!(listing["a.zip"] > 0);

        let bytes = store.read_bytes("events/1/2/2024/01/01/00/b.zip").await.unwrap();
        assert_eq!(bytes, b"world");
    }

    #[tokio::test]
    async fn test_overwrite() {
        let dir = tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());

        store.upload(b"one".to_vec(), "d/f").await.unwrap();
        store.upload(b"two".to_vec(), "d/f").await.unwrap();
        assert_eq!(store.read_bytes("d/f").await.unwrap(), b"two");
        assert_eq!(store.list("d/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing() {
        let dir = tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());

        assert!(store.list("nothing/here/").await.unwrap().is_empty());
        let err = store.read_bytes("nothing/here/x").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());

        let err = store.upload(b"x".to_vec(), "../outside").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
        assert!(store.read_bytes("/etc/passwd").await.is_err());
    }
}
