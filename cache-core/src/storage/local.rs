// cache-core/src/storage/local.rs

//! Local filesystem storage backend.
//!
//! Caches live directly under the storage root and are opened in place, so
//! the cache store never mirrors them. Transfers still go through a
//! temporary sibling and a rename, so a reader never sees a partial file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;

use super::traits::StorageBackend;
use crate::error::{CacheError, Result};

/// Storage backend rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
    base_name: String,
}

impl LocalStorage {
    /// Creates a backend rooted at `base_path`, creating the directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the base path cannot be created.
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        if !base_path.exists() {
            std::fs::create_dir_all(&base_path).map_err(|e| {
                CacheError::storage_with_source(&base_path, "failed to create base directory", e)
            })?;
        }
        let base_name = base_path.to_string_lossy().into_owned();

        Ok(Self {
            base_path,
            base_name,
        })
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }
}

/// Copies `source` into `destination` through a temporary sibling.
async fn copy_atomic(source: &Path, destination: &Path) -> Result<()> {
    let parent = destination.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await.map_err(|e| {
        CacheError::storage_with_source(parent, "failed to create parent directories", e)
    })?;

    let staging = super::staging_path(destination);
    if let Err(e) = fs::copy(source, &staging).await {
        if let Err(cleanup) = fs::remove_file(&staging).await {
            super::log_cleanup_failure(&staging, &cleanup);
        }
        let message = match e.kind() {
            ErrorKind::NotFound => "object not found",
            _ => "failed to copy file",
        };
        return Err(CacheError::storage_with_source(source, message, e));
    }
    fs::rename(&staging, destination).await.map_err(|e| {
        CacheError::storage_with_source(destination, "failed to move file into place", e)
    })
}

#[async_trait]
impl StorageBackend for LocalStorage {
    fn storage_type(&self) -> &'static str {
        "local"
    }

    fn bucket(&self) -> &str {
        &self.base_name
    }

    fn local_path(&self) -> Option<&Path> {
        Some(&self.base_path)
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let full_path = self.resolve_path(path);
        fs::try_exists(&full_path).await.map_err(|e| {
            CacheError::storage_with_source(&full_path, "failed to check existence", e)
        })
    }

    async fn remote_timestamp(&self, path: &Path) -> Result<Option<DateTime<Utc>>> {
        let full_path = self.resolve_path(path);
        let meta = match fs::metadata(&full_path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CacheError::storage_with_source(
                    &full_path,
                    "failed to read metadata",
                    e,
                ))
            }
        };
        let modified = meta.modified().map_err(|e| {
            CacheError::storage_with_source(&full_path, "modification time unavailable", e)
        })?;
        Ok(Some(DateTime::<Utc>::from(modified)))
    }

    async fn download(&self, path: &Path, destination: &Path) -> Result<()> {
        copy_atomic(&self.resolve_path(path), destination).await
    }

    async fn upload(&self, source: &Path, path: &Path) -> Result<()> {
        copy_atomic(source, &self.resolve_path(path)).await
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let full_path = self.resolve_path(path);
        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::storage_with_source(&full_path, "failed to delete file", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (LocalStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path().join("root")).unwrap();
        (storage, temp_dir)
    }

    #[test]
    fn test_new_creates_base_dir() {
        let (storage, temp_dir) = create_test_storage();
        assert!(temp_dir.path().join("root").is_dir());
        assert_eq!(storage.local_path(), Some(temp_dir.path().join("root").as_path()));
        assert_eq!(storage.storage_type(), "local");
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let (storage, temp_dir) = create_test_storage();
        let source = temp_dir.path().join("source.bin");
        std::fs::write(&source, b"cache bytes").unwrap();

        let object = Path::new("ds/1.0/cache.mdb");
        assert!(!storage.exists(object).await.unwrap());
        storage.upload(&source, object).await.unwrap();
        assert!(storage.exists(object).await.unwrap());

        let destination = temp_dir.path().join("mirror/cache.mdb");
        storage.download(object, &destination).await.unwrap();
        assert_eq!(std::fs::read(&destination).unwrap(), b"cache bytes");
    }

    #[tokio::test]
    async fn test_remote_timestamp() {
        let (storage, temp_dir) = create_test_storage();
        let object = Path::new("ds/1.0/cache.mdb");
        assert!(storage.remote_timestamp(object).await.unwrap().is_none());

        let source = temp_dir.path().join("source.bin");
        std::fs::write(&source, b"x").unwrap();
        storage.upload(&source, object).await.unwrap();
        let stamp = storage.remote_timestamp(object).await.unwrap().unwrap();
        assert!((Utc::now() - stamp).num_seconds().abs() < 60);
    }

    #[tokio::test]
    async fn test_download_missing() {
        let (storage, temp_dir) = create_test_storage();
        let result = storage
            .download(Path::new("missing/cache.mdb"), &temp_dir.path().join("out"))
            .await;
        assert!(matches!(result, Err(CacheError::Storage { .. })));
        assert!(!temp_dir.path().join("out").exists());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (storage, temp_dir) = create_test_storage();
        let source = temp_dir.path().join("source.bin");
        std::fs::write(&source, b"x").unwrap();
        let object = Path::new("ds/1.0/cache.mdb");
        storage.upload(&source, object).await.unwrap();

        storage.delete(object).await.unwrap();
        assert!(!storage.exists(object).await.unwrap());
        storage.delete(object).await.unwrap();
    }
}
