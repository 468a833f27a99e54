// cache-core/src/storage/mod.rs

//! Storage backends holding materialized caches.
//!
//! A backend either keeps caches directly on a local filesystem
//! ([`LocalStorage`]), where they are opened in place, or in a cloud bucket
//! ([`ObjectStoreBackend`]), where the cache store keeps a local mirror.
//!
//! # Example
//!
//! ```no_run
//! use cache_core::config::StorageConfig;
//! use cache_core::storage::{backend_from_config, CacheLocation};
//!
//! # async fn example() -> cache_core::Result<()> {
//! let backend = backend_from_config(&StorageConfig::default())?;
//! let location = CacheLocation::new("mnist", "1.0");
//! let present = backend.exists(&location.cache_file()).await?;
//! # Ok(())
//! # }
//! ```

mod local;
mod object;
mod retry;
mod traits;

pub use local::LocalStorage;
pub use object::ObjectStoreBackend;
pub use retry::{with_retries, Attempt, RetryPolicy};
pub use traits::{CacheLocation, StorageBackend, CACHE_FILE_NAME};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{StorageBackendType, StorageConfig};
use crate::error::{CacheError, Result};

/// Builds the backend selected by `config.backend`.
///
/// # Errors
///
/// Returns `Config` if the backend is not compiled in or its client cannot
/// be built.
pub fn backend_from_config(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    match config.backend {
        StorageBackendType::Local => Ok(Arc::new(LocalStorage::new(&config.storage_dir)?)),
        #[cfg(feature = "s3")]
        StorageBackendType::S3 => {
            let s3 = config.s3.clone().unwrap_or_default();
            let backend = ObjectStoreBackend::s3(&s3, &config.bucket, &config.bucket_prefix)?;
            Ok(Arc::new(backend))
        }
        #[cfg(feature = "gcs")]
        StorageBackendType::Gcs => {
            let gcs = config.gcs.clone().unwrap_or_default();
            let backend = ObjectStoreBackend::gcs(&gcs, &config.bucket, &config.bucket_prefix)?;
            Ok(Arc::new(backend))
        }
        #[allow(unreachable_patterns)]
        other => Err(CacheError::config(format!(
            "storage backend {other:?} is not enabled in this build"
        ))),
    }
}

/// A hidden, unique sibling of `destination` used while a file is being
/// written.
pub(crate) fn staging_path(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    destination.with_file_name(format!(".{}.{}.partial", name, uuid::Uuid::new_v4()))
}

/// Reports a failed cleanup of a staging file; a file that was never
/// created is not a failure.
pub(crate) fn log_cleanup_failure(path: &Path, error: &std::io::Error) {
    if error.kind() != std::io::ErrorKind::NotFound {
        tracing::warn!("Failed to remove staging file {}: {}", path.display(), error);
    }
}
