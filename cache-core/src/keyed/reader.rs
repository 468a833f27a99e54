// cache-core/src/keyed/reader.rs

//! Keyed store reader.

use std::path::{Path, PathBuf};

use heed::types::Bytes;
use heed::{Database, Env, EnvFlags, EnvOpenOptions};
use parking_lot::Mutex;

use crate::error::{CacheError, Result};

use super::key::{RecordKey, KEYS_KEY, SHAPES_KEY, TYPES_KEY};
use super::Descriptors;

/// Read-only access to a built keyed store.
///
/// Metadata is loaded eagerly by [`KeyedStoreReader::open`], after which the
/// engine handle is closed so no descriptor is held across a fork. The handle
/// is reopened on the first [`KeyedStoreReader::read`] and closed when the
/// reader is dropped.
///
/// The reader pins the file it was opened on through a private hard link, so
/// a cache published over `path` later is never mixed into this reader, and
/// the engine environment is never shared with a reader of the newer file.
pub struct KeyedStoreReader {
    path: PathBuf,
    snapshot: Snapshot,
    keys: Vec<RecordKey>,
    descriptors: Descriptors,
    handle: Mutex<Option<ReadHandle>>,
}

/// Private name for the file a reader was opened on.
struct Snapshot {
    path: PathBuf,
    linked: bool,
}

impl Snapshot {
    fn pin(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let link = path.with_file_name(format!(".{}.{}.reader", name, uuid::Uuid::new_v4()));
        match std::fs::hard_link(path, &link) {
            Ok(()) => Self { path: link, linked: true },
            Err(e) => {
                tracing::warn!(
                    "Cannot pin {} ({}); reading it in place",
                    path.display(),
                    e
                );
                Self { path: path.to_path_buf(), linked: false }
            }
        }
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        if !self.linked {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("Failed to remove reader link {}: {}", self.path.display(), e);
        }
    }
}

#[derive(Clone)]
struct ReadHandle {
    env: Env,
    db: Database<Bytes, Bytes>,
}

impl KeyedStoreReader {
    /// Opens the store at `path` and loads its metadata.
    ///
    /// # Errors
    ///
    /// Returns a `Storage` error if the file does not exist and a
    /// `KeyedStore` error if it lacks the metadata entries written at the
    /// end of a successful build.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(CacheError::storage(path, "keyed store does not exist"));
        }

        let snapshot = Snapshot::pin(path);
        let handle = ReadHandle::open(&snapshot.path)?;
        let loaded = handle.load_metadata(path);
        handle.close(snapshot.linked);
        let (keys, descriptors) = loaded?;

        tracing::info!("Found {} entries in {}", keys.len(), path.display());

        Ok(Self {
            path: path.to_path_buf(),
            snapshot,
            keys,
            descriptors,
            handle: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A copy of the ordered key list.
    pub fn keys(&self) -> Vec<RecordKey> {
        self.keys.clone()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn descriptors(&self) -> &Descriptors {
        &self.descriptors
    }

    pub fn shapes(&self) -> &serde_json::Value {
        &self.descriptors.shapes
    }

    pub fn types(&self) -> &serde_json::Value {
        &self.descriptors.types
    }

    /// Reads the record stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns `KeyNotFound` if the store holds no such key.
    pub fn read(&self, key: &RecordKey) -> Result<Vec<u8>> {
        let handle = self.handle()?;
        let rtxn = handle
            .env
            .read_txn()
            .map_err(|e| CacheError::keyed_store_with_source(&self.path, "failed to begin read", e))?;
        let value = handle
            .db
            .get(&rtxn, key.as_bytes())
            .map_err(|e| CacheError::keyed_store_with_source(&self.path, "failed to read record", e))?;
        value
            .map(<[u8]>::to_vec)
            .ok_or_else(|| CacheError::key_not_found(key.as_str(), &self.path))
    }

    fn handle(&self) -> Result<ReadHandle> {
        let mut guard = self.handle.lock();
        if let Some(handle) = guard.as_ref() {
            return Ok(handle.clone());
        }
        let handle = ReadHandle::open(&self.snapshot.path)?;
        *guard = Some(handle.clone());
        Ok(handle)
    }
}

impl Drop for KeyedStoreReader {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.close(self.snapshot.linked);
        }
    }
}

impl std::fmt::Debug for KeyedStoreReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedStoreReader")
            .field("path", &self.path)
            .field("len", &self.keys.len())
            .finish()
    }
}

impl ReadHandle {
    fn open(path: &Path) -> Result<Self> {
        let mut options = EnvOpenOptions::new();
        options.max_readers(126);
        // Safety: a built store is immutable; readers never take the lock table.
        let env = unsafe {
            options.flags(EnvFlags::NO_SUB_DIR | EnvFlags::READ_ONLY | EnvFlags::NO_LOCK);
            options.open(path)
        }
        .map_err(|e| CacheError::keyed_store_with_source(path, "failed to open for read", e))?;

        let db = env
            .read_txn()
            .map_err(|e| CacheError::keyed_store_with_source(path, "failed to begin read", e))
            .and_then(|rtxn| {
                env.open_database::<Bytes, Bytes>(&rtxn, None)
                    .map_err(|e| CacheError::keyed_store_with_source(path, "failed to open database", e))?
                    .ok_or_else(|| CacheError::keyed_store(path, "main database is missing"))
            });
        match db {
            Ok(db) => Ok(Self { env, db }),
            Err(e) => {
                drop(env.prepare_for_closing());
                Err(e)
            }
        }
    }

    /// Loads the key list and descriptors written at the end of a build.
    fn load_metadata(&self, path: &Path) -> Result<(Vec<RecordKey>, Descriptors)> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| CacheError::keyed_store_with_source(path, "failed to begin read", e))?;
        let fetch = |name: &[u8]| -> Result<Vec<u8>> {
            self.db
                .get(&rtxn, name)
                .map_err(|e| CacheError::keyed_store_with_source(path, "failed to read metadata", e))?
                .map(<[u8]>::to_vec)
                .ok_or_else(|| {
                    CacheError::keyed_store(
                        path,
                        format!("incomplete build: missing {}", String::from_utf8_lossy(name)),
                    )
                })
        };

        let keys: Vec<RecordKey> = bincode::deserialize(&fetch(KEYS_KEY)?)
            .map_err(|e| CacheError::serialization(format!("failed to decode key list: {e}")))?;
        let shapes = decode_descriptor(&fetch(SHAPES_KEY)?)?;
        let types = decode_descriptor(&fetch(TYPES_KEY)?)?;
        Ok((keys, Descriptors { shapes, types }))
    }

    /// Closes the environment. heed keeps every opened environment alive in
    /// a process-wide table keyed by path until it is explicitly closed.
    ///
    /// Waiting is only safe on a pinned link: no other reader can hold a
    /// clone of that environment.
    fn close(self, exclusive: bool) {
        let closing = self.env.prepare_for_closing();
        if exclusive {
            closing.wait();
        }
    }
}

fn decode_descriptor(bytes: &[u8]) -> Result<serde_json::Value> {
    serde_json::from_slice(bytes)
        .map_err(|e| CacheError::serialization(format!("failed to decode descriptor: {e}")))
}
