// cache-core/src/storage/traits.rs

//! The storage backend trait used by the cache store.

use std::fmt::Debug;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// File name of a materialized cache inside its version directory.
pub const CACHE_FILE_NAME: &str = "cache.mdb";

/// Relative location of one dataset version: `<id>/<version>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheLocation {
    pub dataset_id: String,
    pub dataset_version: String,
}

impl CacheLocation {
    pub fn new(dataset_id: impl Into<String>, dataset_version: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            dataset_version: dataset_version.into(),
        }
    }

    /// `<id>/<version>`, relative to a storage root.
    pub fn dir(&self) -> PathBuf {
        Path::new(&self.dataset_id).join(&self.dataset_version)
    }

    /// `<id>/<version>/cache.mdb`, relative to a storage root.
    pub fn cache_file(&self) -> PathBuf {
        self.dir().join(CACHE_FILE_NAME)
    }
}

/// A place where materialized caches are kept.
///
/// Paths passed to the async operations are relative object paths such as
/// [`CacheLocation::cache_file`]; each backend resolves them against its own
/// root or prefix.
#[async_trait]
pub trait StorageBackend: Send + Sync + Debug {
    /// Short backend name used in coordinator resource paths.
    fn storage_type(&self) -> &'static str;

    /// Bucket name, or the storage root for filesystem backends.
    fn bucket(&self) -> &str;

    /// Root directory when caches are opened in place instead of mirrored.
    fn local_path(&self) -> Option<&Path>;

    /// Verifies that the bucket or root is reachable.
    async fn verify(&self) -> Result<()> {
        Ok(())
    }

    /// Checks if an object exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached.
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Creation or last-modified time of an object, `None` when absent.
    async fn remote_timestamp(&self, path: &Path) -> Result<Option<DateTime<Utc>>>;

    /// Copies an object to `destination`, replacing it atomically.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the object is missing or the transfer fails.
    async fn download(&self, path: &Path, destination: &Path) -> Result<()>;

    /// Publishes the local file `source` as the object `path`.
    async fn upload(&self, source: &Path, path: &Path) -> Result<()>;

    /// Removes an object. Deleting a missing object is not an error.
    async fn delete(&self, path: &Path) -> Result<()>;
}
