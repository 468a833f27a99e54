// cache-core/src/store.rs

//! The cache store: submit, fetch and build-once access to dataset caches.
//!
//! `CacheStore` owns the storage backend and, for cloud backends, the local
//! mirror and the coordinator client. It ties together the keyed store, the
//! storage backends and the reader/writer lock protocol.
//!
//! # Example
//!
//! ```no_run
//! use cache_core::dataset::{RecordSource, StreamOptions};
//! use cache_core::keyed::Descriptors;
//! use cache_core::CacheStore;
//!
//! # fn example() -> cache_core::Result<()> {
//! let store = CacheStore::local("/data/caches")?;
//!
//! let range = store.cacheable("range", "1.0", || {
//!     Ok(RecordSource::from_serializable(Descriptors::default(), 0u64..20))
//! });
//! let dataref = range()?;
//!
//! let mut stream = dataref.stream(&StreamOptions::default())?;
//! for value in stream.decoded::<u64>() {
//!     let value = value?;
//! }
//! # Ok(())
//! # }
//! ```

use std::fs::{File, OpenOptions};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::config::{CacheConfig, KeyedStoreConfig};
use crate::coordinator::{LockHold, LockMode, LockResource, RwCoordinatorClient};
use crate::dataset::{DataRef, RecordSource};
use crate::error::{CacheError, Result};
use crate::keyed::{KeyedStoreReader, KeyedStoreWriter};
use crate::storage::{self, backend_from_config, CacheLocation, StorageBackend, CACHE_FILE_NAME};

/// Directory under `local_cache_dir` holding mirrors of remote caches.
pub const LOCAL_CACHE_DIR_NAME: &str = "yogadl_local_cache";

/// Sidecar recording which remote object a mirror was downloaded from.
pub const METADATA_FILE_NAME: &str = "local_metadata.json";

/// Same-machine lease file inside an identity directory.
pub const LEASE_FILE_NAME: &str = "yogadl.lock";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct LocalMetadata {
    /// Remote creation time of the mirrored object, in epoch seconds.
    time_created: f64,
}

fn epoch_seconds(timestamp: DateTime<Utc>) -> f64 {
    timestamp.timestamp_micros() as f64 / 1e6
}

/// Steps of [`CacheStore::get_or_build`].
#[derive(Debug)]
enum Phase {
    /// Look for an existing cache under a read lock.
    ReadCheck,
    /// Re-check under the write lock and build if still absent.
    WriteCheck,
    /// Open what the writer left behind under a fresh read lock.
    Reread,
    Done(DataRef),
}

/// Exclusive advisory lock on a lease file, released on drop.
struct Lease {
    file: File,
    path: PathBuf,
}

impl Lease {
    fn acquire(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| CacheError::storage_with_source(&path, "failed to open lease file", e))?;
        FileExt::lock_exclusive(&file)
            .map_err(|e| CacheError::storage_with_source(&path, "failed to lock lease file", e))?;
        Ok(Self { file, path })
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("Failed to unlock {}: {}", self.path.display(), e);
        }
    }
}

/// Dataset cache on a local filesystem or a cloud bucket.
///
/// All operations are blocking. Cloud transfers run on a small runtime owned
/// by the store, so a `CacheStore` must not be used from inside an async
/// context.
pub struct CacheStore {
    backend: Arc<dyn StorageBackend>,
    coordinator: Option<RwCoordinatorClient>,
    writer: KeyedStoreWriter,
    mirror_root: PathBuf,
    runtime: tokio::runtime::Runtime,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("backend", &self.backend)
            .field("coordinator", &self.coordinator)
            .field("mirror_root", &self.mirror_root)
            .finish_non_exhaustive()
    }
}

impl CacheStore {
    /// Creates a store for a local cache directory with default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn local(storage_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::from_config(&CacheConfig::local(storage_dir))
    }

    /// Creates a store from a configuration file.
    ///
    /// The configuration file should be in TOML format. Environment variable
    /// overrides are applied after loading the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or is invalid.
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        let config = CacheConfig::from_file(path)?.with_env_overrides();
        Self::from_config(&config)
    }

    /// Creates a store from a configuration.
    ///
    /// Cloud backends are checked for bucket access before this returns.
    ///
    /// # Errors
    ///
    /// Returns `Config` for invalid settings or an unreachable bucket.
    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        config.validate()?;

        let backend = backend_from_config(&config.storage)?;
        let coordinator = config
            .coordinator
            .as_ref()
            .map(RwCoordinatorClient::new)
            .transpose()?;

        Self::with_backend(
            backend,
            coordinator,
            &config.storage.local_cache_dir,
            config.keyed_store.clone(),
        )
    }

    /// Creates a store over an already constructed backend.
    ///
    /// `local_cache_dir` is only used when the backend has no local path.
    /// Without a coordinator, callers on the same machine are still
    /// serialized by the lease file.
    pub fn with_backend(
        backend: Arc<dyn StorageBackend>,
        coordinator: Option<RwCoordinatorClient>,
        local_cache_dir: impl AsRef<Path>,
        keyed_store: KeyedStoreConfig,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("cache-store-io")
            .enable_all()
            .build()
            .map_err(|e| CacheError::config_with_source("failed to start I/O runtime", e))?;

        runtime.block_on(backend.verify())?;

        let mirror_root = local_cache_dir.as_ref().join(LOCAL_CACHE_DIR_NAME);
        tracing::info!(
            "Cache store ready on {} backend `{}`",
            backend.storage_type(),
            backend.bucket()
        );

        Ok(Self {
            backend,
            coordinator,
            writer: KeyedStoreWriter::new(keyed_store),
            mirror_root,
            runtime,
        })
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn coordinator(&self) -> Option<&RwCoordinatorClient> {
        self.coordinator.as_ref()
    }

    /// Local file a cache is opened from: the canonical file for a local
    /// backend, the mirror for a cloud backend.
    pub fn cache_path(&self, dataset_id: &str, dataset_version: &str) -> PathBuf {
        self.local_dir(&CacheLocation::new(dataset_id, dataset_version))
            .join(CACHE_FILE_NAME)
    }

    /// Checks whether a cache exists for the identity.
    pub fn exists(&self, dataset_id: &str, dataset_version: &str) -> Result<bool> {
        self.exists_at(&CacheLocation::new(dataset_id, dataset_version))
    }

    /// Builds a cache from `source` and publishes it, replacing any existing
    /// cache for the identity. Returns the number of records written.
    ///
    /// # Errors
    ///
    /// Producer, keyed store and transfer errors. The previous cache, if
    /// any, stays in place when the build fails.
    pub fn submit(
        &self,
        source: RecordSource<'_>,
        dataset_id: &str,
        dataset_version: &str,
    ) -> Result<u64> {
        let location = CacheLocation::new(dataset_id, dataset_version);
        let _lease = self.lease(&location)?;
        self.submit_leased(source, &location)
    }

    /// Opens the cache for the identity, refreshing the local mirror first
    /// when the remote object has changed.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no cache exists.
    pub fn fetch(&self, dataset_id: &str, dataset_version: &str) -> Result<DataRef> {
        let location = CacheLocation::new(dataset_id, dataset_version);
        if self.backend.local_path().is_some() {
            return self.open_local(&location);
        }
        let _lease = self.lease(&location)?;
        self.fetch_leased(&location)
    }

    /// Returns the cache for the identity, building it with `build` if no
    /// cache exists yet.
    ///
    /// Racing callers (threads, processes or machines sharing the
    /// coordinator) run `build` at most once between them; everyone gets
    /// the same cache.
    ///
    /// # Errors
    ///
    /// Returns any error from `build`, the build itself or the coordinator.
    /// Returns `NotFound` if the cache vanished right after being built.
    pub fn get_or_build<'a, F>(
        &self,
        dataset_id: &str,
        dataset_version: &str,
        build: F,
    ) -> Result<DataRef>
    where
        F: FnOnce() -> Result<RecordSource<'a>>,
    {
        let location = CacheLocation::new(dataset_id, dataset_version);
        let resource = self.lock_resource(&location);
        let mut build = Some(build);
        let mut phase = Phase::ReadCheck;

        loop {
            tracing::debug!("get_or_build {}/{}: {:?}", dataset_id, dataset_version, phase);
            phase = match phase {
                Phase::ReadCheck => {
                    let _hold = self.lock(&resource, LockMode::Read)?;
                    if self.exists_at(&location)? {
                        Phase::Done(self.open(&location)?)
                    } else {
                        Phase::WriteCheck
                    }
                }
                Phase::WriteCheck => {
                    let _hold = self.lock(&resource, LockMode::Write)?;
                    let _lease = self.lease(&location)?;
                    if !self.exists_at(&location)? {
                        if let Some(build) = build.take() {
                            tracing::info!(
                                "No cache for {}/{}, building it",
                                dataset_id,
                                dataset_version
                            );
                            self.submit_leased(build()?, &location)?;
                        }
                    }
                    Phase::Reread
                }
                Phase::Reread => {
                    let _hold = self.lock(&resource, LockMode::Read)?;
                    if !self.exists_at(&location)? {
                        return Err(CacheError::not_found(dataset_id, dataset_version));
                    }
                    Phase::Done(self.open(&location)?)
                }
                Phase::Done(dataref) => return Ok(dataref),
            };
        }
    }

    /// Wraps a record producer so that every call returns the cache for the
    /// identity, running the producer only if no cache exists yet.
    pub fn cacheable<'s, F>(
        &'s self,
        dataset_id: &str,
        dataset_version: &str,
        build: F,
    ) -> impl Fn() -> Result<DataRef> + 's
    where
        F: Fn() -> Result<RecordSource<'s>> + 's,
    {
        let dataset_id = dataset_id.to_string();
        let dataset_version = dataset_version.to_string();
        move || self.get_or_build(&dataset_id, &dataset_version, &build)
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    fn local_dir(&self, location: &CacheLocation) -> PathBuf {
        match self.backend.local_path() {
            Some(root) => root.join(location.dir()),
            None => self.mirror_root.join(location.dir()),
        }
    }

    fn lock_resource(&self, location: &CacheLocation) -> LockResource {
        LockResource::new(
            self.backend.storage_type(),
            self.backend.bucket(),
            location.cache_file().to_string_lossy(),
        )
    }

    fn lock(&self, resource: &LockResource, mode: LockMode) -> Result<Option<LockHold>> {
        self.coordinator
            .as_ref()
            .map(|client| match mode {
                LockMode::Read => client.read_lock(resource),
                LockMode::Write => client.write_lock(resource),
            })
            .transpose()
    }

    fn lease(&self, location: &CacheLocation) -> Result<Lease> {
        let dir = self.local_dir(location);
        std::fs::create_dir_all(&dir)
            .map_err(|e| CacheError::storage_with_source(&dir, "failed to create cache directory", e))?;
        Lease::acquire(dir.join(LEASE_FILE_NAME))
    }

    fn exists_at(&self, location: &CacheLocation) -> Result<bool> {
        match self.backend.local_path() {
            Some(root) => Ok(root.join(location.cache_file()).is_file()),
            None => self.block_on(self.backend.exists(&location.cache_file())),
        }
    }

    fn open(&self, location: &CacheLocation) -> Result<DataRef> {
        if self.backend.local_path().is_some() {
            self.open_local(location)
        } else {
            // Held by this process only; a submit on another machine is
            // serialized by the coordinator lock the caller holds.
            let _lease = self.lease(location)?;
            self.fetch_leased(location)
        }
    }

    fn open_local(&self, location: &CacheLocation) -> Result<DataRef> {
        let path = self.local_dir(location).join(CACHE_FILE_NAME);
        if !path.is_file() {
            return Err(CacheError::not_found(
                &location.dataset_id,
                &location.dataset_version,
            ));
        }
        Ok(DataRef::new(KeyedStoreReader::open(&path)?))
    }

    fn submit_leased(&self, source: RecordSource<'_>, location: &CacheLocation) -> Result<u64> {
        let dir = self.local_dir(location);
        let target = dir.join(CACHE_FILE_NAME);
        let staging = storage::staging_path(&target);

        let (descriptors, records) = source.into_parts();
        let written = self.writer.build(&staging, &descriptors, records)?;

        let published = match self.backend.local_path() {
            Some(_) => replace_file(&staging, &target),
            None => self.publish_remote(&staging, &target, location),
        };
        if let Err(e) = published {
            if let Err(cleanup) = std::fs::remove_file(&staging) {
                storage::log_cleanup_failure(&staging, &cleanup);
            }
            return Err(e);
        }

        tracing::info!(
            "Submitted {} records as {}/{}",
            written,
            location.dataset_id,
            location.dataset_version
        );
        Ok(written)
    }

    fn publish_remote(&self, staging: &Path, mirror: &Path, location: &CacheLocation) -> Result<()> {
        let object = location.cache_file();
        self.block_on(self.backend.upload(staging, &object))?;
        replace_file(staging, mirror)?;

        let uploaded = self
            .block_on(self.backend.remote_timestamp(&object))?
            .ok_or_else(|| CacheError::storage(&object, "uploaded cache is not visible"))?;
        write_metadata(&self.local_dir(location), epoch_seconds(uploaded))
    }

    fn fetch_leased(&self, location: &CacheLocation) -> Result<DataRef> {
        let object = location.cache_file();
        let remote = self
            .block_on(self.backend.remote_timestamp(&object))?
            .ok_or_else(|| CacheError::not_found(&location.dataset_id, &location.dataset_version))?;
        let remote = epoch_seconds(remote);

        let dir = self.local_dir(location);
        let mirror = dir.join(CACHE_FILE_NAME);
        let up_to_date = mirror.is_file()
            && read_metadata(&dir).map(|metadata| metadata.time_created) == Some(remote);

        if up_to_date {
            tracing::debug!("Local mirror of {} is up to date", object.display());
        } else {
            self.block_on(self.backend.download(&object, &mirror))?;
            write_metadata(&dir, remote)?;
            tracing::info!("Downloaded {} to {}", object.display(), mirror.display());
        }

        Ok(DataRef::new(KeyedStoreReader::open(&mirror)?))
    }
}

fn replace_file(from: &Path, to: &Path) -> Result<()> {
    std::fs::rename(from, to)
        .map_err(|e| CacheError::storage_with_source(to, "failed to move cache into place", e))
}

// A missing or unreadable sidecar only forces a fresh download.
fn read_metadata(dir: &Path) -> Option<LocalMetadata> {
    let path = dir.join(METADATA_FILE_NAME);
    let content = std::fs::read(&path).ok()?;
    match serde_json::from_slice(&content) {
        Ok(metadata) => Some(metadata),
        Err(e) => {
            tracing::warn!("Ignoring malformed {}: {}", path.display(), e);
            None
        }
    }
}

fn write_metadata(dir: &Path, time_created: f64) -> Result<()> {
    let path = dir.join(METADATA_FILE_NAME);
    let content = serde_json::to_vec(&LocalMetadata { time_created })
        .map_err(|e| CacheError::serialization(format!("failed to encode local metadata: {e}")))?;

    let staging = storage::staging_path(&path);
    std::fs::write(&staging, content)
        .map_err(|e| CacheError::storage_with_source(&staging, "failed to write local metadata", e))?;
    replace_file(&staging, &path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::StreamOptions;
    use crate::keyed::Descriptors;
    use crate::storage::ObjectStoreBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn range(n: u64) -> Result<RecordSource<'static>> {
        Ok(RecordSource::from_serializable(Descriptors::default(), 0..n))
    }

    fn values(dataref: &DataRef) -> Vec<u64> {
        let mut stream = dataref.stream(&StreamOptions::default()).unwrap();
        stream.decoded::<u64>().map(|v| v.unwrap()).collect()
    }

    fn memory_store(dir: &TempDir) -> CacheStore {
        let backend = Arc::new(ObjectStoreBackend::in_memory("datasets", "team"));
        CacheStore::with_backend(backend, None, dir.path(), KeyedStoreConfig::default()).unwrap()
    }

    #[test]
    fn test_local_submit_and_fetch() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::local(dir.path()).unwrap();

        assert!(!store.exists("range", "1.0").unwrap());
        assert_eq!(store.submit(range(20).unwrap(), "range", "1.0").unwrap(), 20);
        assert!(store.exists("range", "1.0").unwrap());
        assert_eq!(store.cache_path("range", "1.0"), dir.path().join("range/1.0/cache.mdb"));

        let dataref = store.fetch("range", "1.0").unwrap();
        assert_eq!(values(&dataref), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_fetch_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::local(dir.path()).unwrap();
        assert!(matches!(store.fetch("nope", "1"), Err(CacheError::NotFound { .. })));

        let store = memory_store(&dir);
        assert!(matches!(store.fetch("nope", "1"), Err(CacheError::NotFound { .. })));
    }

    #[test]
    fn test_submit_replaces_existing() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::local(dir.path()).unwrap();
        store.submit(range(20).unwrap(), "range", "1.0").unwrap();
        store.submit(range(5).unwrap(), "range", "1.0").unwrap();

        assert_eq!(store.fetch("range", "1.0").unwrap().len(), 5);
    }

    #[test]
    fn test_failed_submit_keeps_previous_cache() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::local(dir.path()).unwrap();
        store.submit(range(3).unwrap(), "range", "1.0").unwrap();

        let failing = RecordSource::new(
            Descriptors::default(),
            vec![Ok(vec![1]), Err(CacheError::serialization("producer failed"))],
        );
        assert!(store.submit(failing, "range", "1.0").is_err());
        assert_eq!(store.fetch("range", "1.0").unwrap().len(), 3);
    }

    #[test]
    fn test_failed_publish_removes_staging_file() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::local(dir.path()).unwrap();
        let target = store.cache_path("range", "1.0");
        std::fs::create_dir_all(target.join("occupied")).unwrap();

        let result = store.submit(range(3).unwrap(), "range", "1.0");
        assert!(matches!(result, Err(CacheError::Storage { .. })));

        let leftovers: Vec<String> = std::fs::read_dir(target.parent().unwrap())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[test]
    fn test_get_or_build_builds_once() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::local(dir.path()).unwrap();
        let calls = AtomicUsize::new(0);

        let build = || {
            calls.fetch_add(1, Ordering::SeqCst);
            range(12)
        };
        let first = store.get_or_build("range", "1.0", build).unwrap();
        let second = store.get_or_build("range", "1.0", build).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.len(), 12);
        assert_eq!(second.len(), 12);
    }

    #[test]
    fn test_get_or_build_propagates_build_error() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::local(dir.path()).unwrap();

        let result = store.get_or_build("range", "1.0", || {
            Err(CacheError::serialization("cannot produce"))
        });
        assert!(matches!(result, Err(CacheError::Serialization { .. })));
        assert!(!store.exists("range", "1.0").unwrap());
    }

    #[test]
    fn test_cacheable_ignores_later_producers() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::local(dir.path()).unwrap();

        let twenty = store.cacheable("range", "1.0", || range(20));
        assert_eq!(twenty().unwrap().len(), 20);

        let ten = store.cacheable("range", "1.0", || range(10));
        assert_eq!(ten().unwrap().len(), 20);
    }

    #[test]
    fn test_cloud_mirror_and_metadata() {
        let dir = TempDir::new().unwrap();
        let store = memory_store(&dir);

        store.submit(range(8).unwrap(), "range", "1.0").unwrap();
        let mirror = store.cache_path("range", "1.0");
        assert_eq!(
            mirror,
            dir.path().join(LOCAL_CACHE_DIR_NAME).join("range/1.0/cache.mdb")
        );
        assert!(mirror.is_file());

        let mirror_dir = mirror.parent().unwrap();
        let metadata = read_metadata(mirror_dir).unwrap();
        let remote = store
            .block_on(store.backend().remote_timestamp(Path::new("range/1.0/cache.mdb")))
            .unwrap()
            .unwrap();
        assert_eq!(metadata.time_created, epoch_seconds(remote));

        let dataref = store.fetch("range", "1.0").unwrap();
        assert_eq!(values(&dataref), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_cloud_fetch_downloads_when_mirror_is_stale() {
        let dir = TempDir::new().unwrap();
        let store = memory_store(&dir);
        store.submit(range(4).unwrap(), "range", "1.0").unwrap();

        let mirror = store.cache_path("range", "1.0");
        std::fs::remove_file(&mirror).unwrap();
        write_metadata(mirror.parent().unwrap(), 0.0).unwrap();

        assert_eq!(store.fetch("range", "1.0").unwrap().len(), 4);
        assert!(mirror.is_file());
        assert_ne!(read_metadata(mirror.parent().unwrap()).unwrap().time_created, 0.0);
    }

    #[test]
    fn test_malformed_metadata_is_ignored() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(METADATA_FILE_NAME), b"{not json").unwrap();
        assert!(read_metadata(dir.path()).is_none());
        assert!(read_metadata(&dir.path().join("missing")).is_none());
    }

    #[test]
    fn test_lease_is_exclusive_across_handles() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LEASE_FILE_NAME);
        let held = Lease::acquire(path.clone()).unwrap();

        let other = File::open(&path).unwrap();
        assert!(FileExt::try_lock_exclusive(&other).is_err());

        drop(held);
        assert!(FileExt::try_lock_exclusive(&other).is_ok());
    }

    #[test]
    fn test_from_config_rejects_invalid() {
        let mut config = CacheConfig::default();
        config.keyed_store.write_frequency = 0;
        assert!(matches!(CacheStore::from_config(&config), Err(CacheError::Config { .. })));
    }
}
