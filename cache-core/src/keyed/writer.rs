// cache-core/src/keyed/writer.rs

//! Keyed store writer.

use std::path::{Path, PathBuf};

use heed::types::Bytes;
use heed::{Database, Env, EnvFlags, EnvOpenOptions, MdbError};

use crate::config::KeyedStoreConfig;
use crate::error::{CacheError, Result};

use super::key::{RecordKey, KEYS_KEY, SHAPES_KEY, TYPES_KEY};
use super::Descriptors;

/// Map sizes are kept on a 64 KiB boundary, a multiple of every common page size.
const MAP_SIZE_ALIGNMENT: usize = 64 * 1024;

/// Lifecycle of one write transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transaction {
    Open,
    Committed,
    Aborted,
}

/// Outcome of applying one batch.
enum Attempt {
    Committed,
    MapFull,
}

/// Writes a record sequence into a fresh keyed store file.
///
/// The `KeyedStoreWriter` handles:
/// - Assigning sequential [`RecordKey`]s in production order
/// - Committing every `write_frequency` records
/// - Doubling the map on a map-full condition and replaying the batch
/// - Writing the metadata entries in one final transaction, then syncing
pub struct KeyedStoreWriter {
    config: KeyedStoreConfig,
}

impl KeyedStoreWriter {
    /// Creates a new keyed store writer.
    pub fn new(config: KeyedStoreConfig) -> Self {
        Self { config }
    }

    /// Builds a keyed store at `path` and returns the number of records written.
    ///
    /// # Arguments
    ///
    /// * `path` - Target file; its parent directory must exist
    /// * `descriptors` - Shape and type descriptors captured from the producer
    /// * `records` - Serialized records; the first `Err` aborts the build
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if `path` exists, and any producer, engine or
    /// I/O error. On failure the partial file is removed.
    pub fn build<I>(&self, path: &Path, descriptors: &Descriptors, records: I) -> Result<u64>
    where
        I: IntoIterator<Item = Result<Vec<u8>>>,
    {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        if !parent.as_os_str().is_empty() && !parent.is_dir() {
            return Err(CacheError::storage(
                parent,
                "keyed store directory does not exist",
            ));
        }
        if path.exists() {
            return Err(CacheError::already_exists(path));
        }

        let result = self.build_inner(path, descriptors, records);
        remove_lock_file(path);
        if result.is_err() {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove partial keyed store {}: {}", path.display(), e);
                }
            }
        }
        result
    }

    fn build_inner<I>(&self, path: &Path, descriptors: &Descriptors, records: I) -> Result<u64>
    where
        I: IntoIterator<Item = Result<Vec<u8>>>,
    {
        let mut session = WriteSession::create(path, &self.config)?;
        match self.write_all(&mut session, descriptors, records) {
            Ok(written) => {
                tracing::debug!("Flushing keyed store {} ...", path.display());
                session.finish()?;
                tracing::info!("Wrote {} records to {}", written, path.display());
                Ok(written)
            }
            Err(e) => {
                session.close();
                Err(e)
            }
        }
    }

    fn write_all<I>(&self, session: &mut WriteSession, descriptors: &Descriptors, records: I) -> Result<u64>
    where
        I: IntoIterator<Item = Result<Vec<u8>>>,
    {
        let batch_size = self.config.write_frequency.max(1) as usize;
        let mut batch: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(batch_size.min(1024));
        let mut written: u64 = 0;

        for record in records {
            let record = record?;
            batch.push((RecordKey::from_index(written).as_bytes().to_vec(), record));
            written += 1;
            if batch.len() >= batch_size {
                session.apply(&batch)?;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            session.apply(&batch)?;
        }

        let keys: Vec<RecordKey> = super::keys_for(written);
        let metadata = vec![
            (KEYS_KEY.to_vec(), encode_keys(&keys)?),
            (SHAPES_KEY.to_vec(), encode_descriptor(&descriptors.shapes)?),
            (TYPES_KEY.to_vec(), encode_descriptor(&descriptors.types)?),
        ];
        session.apply(&metadata)?;
        Ok(written)
    }
}

/// An open environment plus the bounded map-growth budget.
struct WriteSession {
    env: Env,
    db: Database<Bytes, Bytes>,
    path: PathBuf,
    growths: u32,
    max_growths: u32,
}

impl WriteSession {
    fn create(path: &Path, config: &KeyedStoreConfig) -> Result<Self> {
        let map_size = align_map_size(config.initial_map_size);
        let mut options = EnvOpenOptions::new();
        options.map_size(map_size);
        // Safety: the file is private to this writer until the build returns.
        let env = unsafe {
            options.flags(EnvFlags::NO_SUB_DIR | EnvFlags::NO_SYNC | EnvFlags::NO_META_SYNC);
            options.open(path)
        }
        .map_err(|e| CacheError::keyed_store_with_source(path, "failed to open for write", e))?;

        let db = env
            .write_txn()
            .map_err(|e| CacheError::keyed_store_with_source(path, "failed to begin write", e))
            .and_then(|mut wtxn| {
                let db = env
                    .create_database::<Bytes, Bytes>(&mut wtxn, None)
                    .map_err(|e| CacheError::keyed_store_with_source(path, "failed to create database", e))?;
                wtxn.commit()
                    .map_err(|e| CacheError::keyed_store_with_source(path, "failed to commit", e))?;
                Ok(db)
            });
        let db = match db {
            Ok(db) => db,
            Err(e) => {
                env.prepare_for_closing().wait();
                return Err(e);
            }
        };

        Ok(Self {
            env,
            db,
            path: path.to_path_buf(),
            growths: 0,
            max_growths: config.max_map_growths,
        })
    }

    /// Writes `batch` in one transaction, growing the map and replaying the
    /// whole batch until it commits or the growth budget runs out.
    fn apply(&mut self, batch: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        loop {
            match self.attempt(batch)? {
                Attempt::Committed => return Ok(()),
                Attempt::MapFull => self.grow()?,
            }
        }
    }

    fn attempt(&self, batch: &[(Vec<u8>, Vec<u8>)]) -> Result<Attempt> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| CacheError::keyed_store_with_source(&self.path, "failed to begin write", e))?;
        let mut state = Transaction::Open;

        for (key, value) in batch {
            if let Err(e) = self.db.put(&mut wtxn, key, value) {
                // An LMDB write transaction must not outlive a failed put.
                wtxn.abort();
                state = Transaction::Aborted;
                tracing::debug!("Write transaction {:?} on {}", state, self.path.display());
                return match e {
                    heed::Error::Mdb(MdbError::MapFull) => Ok(Attempt::MapFull),
                    e => Err(CacheError::keyed_store_with_source(&self.path, "failed to put record", e)),
                };
            }
        }

        debug_assert_eq!(state, Transaction::Open);
        match wtxn.commit() {
            Ok(()) => {
                state = Transaction::Committed;
                tracing::trace!("Write transaction {:?} ({} entries)", state, batch.len());
                Ok(Attempt::Committed)
            }
            Err(heed::Error::Mdb(MdbError::MapFull)) => {
                // LMDB aborts a transaction whose commit fails.
                state = Transaction::Aborted;
                tracing::debug!("Write transaction {:?} on {}", state, self.path.display());
                Ok(Attempt::MapFull)
            }
            Err(e) => Err(CacheError::keyed_store_with_source(&self.path, "failed to commit", e)),
        }
    }

    fn grow(&mut self) -> Result<()> {
        if self.growths >= self.max_growths {
            return Err(CacheError::keyed_store(
                &self.path,
                format!("map is full after {} growths", self.growths),
            ));
        }
        let current = self.env.info().map_size;
        let new_size = align_map_size(current.saturating_mul(2));
        tracing::info!(
            "Doubling keyed store map size to {:.3} GB",
            new_size as f64 / 1e9
        );
        // Safety: no transaction is open on this environment at this point.
        unsafe { self.env.resize(new_size) }
            .map_err(|e| CacheError::keyed_store_with_source(&self.path, "failed to resize map", e))?;
        self.growths += 1;
        Ok(())
    }

    fn finish(self) -> Result<()> {
        let synced = self
            .env
            .force_sync()
            .map_err(|e| CacheError::keyed_store_with_source(&self.path, "failed to sync", e));
        self.close();
        synced
    }

    /// Closes the environment; heed holds it open per path until then.
    fn close(self) {
        self.env.prepare_for_closing().wait();
    }
}

fn encode_keys(keys: &[RecordKey]) -> Result<Vec<u8>> {
    bincode::serialize(keys)
        .map_err(|e| CacheError::serialization(format!("failed to encode key list: {e}")))
}

fn encode_descriptor(value: &serde_json::Value) -> Result<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| CacheError::serialization(format!("failed to encode descriptor: {e}")))
}

pub(crate) fn align_map_size(size: usize) -> usize {
    let size = size.max(MAP_SIZE_ALIGNMENT);
    size.div_ceil(MAP_SIZE_ALIGNMENT) * MAP_SIZE_ALIGNMENT
}

/// LMDB keeps its lock table next to a NO_SUB_DIR file.
fn remove_lock_file(path: &Path) {
    let mut lock = path.as_os_str().to_owned();
    lock.push("-lock");
    let lock = PathBuf::from(lock);
    if let Err(e) = std::fs::remove_file(&lock) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove lock file {}: {}", lock.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyed::KeyedStoreReader;
    use tempfile::TempDir;

    fn range_records(n: u64) -> impl Iterator<Item = Result<Vec<u8>>> {
        (0..n).map(|i| Ok(bincode::serialize(&i).unwrap()))
    }

    #[test]
    fn test_build_writes_all_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.mdb");
        let writer = KeyedStoreWriter::new(KeyedStoreConfig::default());

        let written = writer
            .build(&path, &Descriptors::default(), range_records(20))
            .unwrap();
        assert_eq!(written, 20);
        assert!(path.exists());

        let reader = KeyedStoreReader::open(&path).unwrap();
        assert_eq!(reader.len(), 20);
    }

    #[test]
    fn test_build_rejects_existing_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.mdb");
        std::fs::write(&path, b"occupied").unwrap();

        let writer = KeyedStoreWriter::new(KeyedStoreConfig::default());
        let result = writer.build(&path, &Descriptors::default(), range_records(1));
        assert!(matches!(result, Err(CacheError::AlreadyExists { .. })));
        // The existing file is left alone
        assert_eq!(std::fs::read(&path).unwrap(), b"occupied");
    }

    #[test]
    fn test_build_requires_parent_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("cache.mdb");
        let writer = KeyedStoreWriter::new(KeyedStoreConfig::default());
        let result = writer.build(&path, &Descriptors::default(), range_records(1));
        assert!(matches!(result, Err(CacheError::Storage { .. })));
    }

    #[test]
    fn test_map_growth_is_lossless() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.mdb");
        let config = KeyedStoreConfig {
            write_frequency: 50,
            initial_map_size: MAP_SIZE_ALIGNMENT,
            max_map_growths: 16,
        };
        let writer = KeyedStoreWriter::new(config);
        let records = (0..300u64).map(|i| Ok(vec![(i % 251) as u8; 1024]));

        let written = writer.build(&path, &Descriptors::default(), records).unwrap();
        assert_eq!(written, 300);

        let reader = KeyedStoreReader::open(&path).unwrap();
        assert_eq!(reader.len(), 300);
        for (i, key) in reader.keys().iter().enumerate() {
            let value = reader.read(key).unwrap();
            assert_eq!(value, vec![(i % 251) as u8; 1024]);
        }
    }

    #[test]
    fn test_growth_budget_exhausted_removes_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.mdb");
        let config = KeyedStoreConfig {
            write_frequency: 10,
            initial_map_size: MAP_SIZE_ALIGNMENT,
            max_map_growths: 0,
        };
        let writer = KeyedStoreWriter::new(config);
        let records = (0..200u64).map(|_| Ok(vec![7u8; 4096]));

        let result = writer.build(&path, &Descriptors::default(), records);
        assert!(matches!(result, Err(CacheError::KeyedStore { .. })));
        assert!(!path.exists());
    }

    #[test]
    fn test_producer_error_aborts_build() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.mdb");
        let writer = KeyedStoreWriter::new(KeyedStoreConfig::default());
        let records = (0..10u64).map(|i| {
            if i == 7 {
                Err(CacheError::serialization("producer failed"))
            } else {
                Ok(vec![i as u8])
            }
        });

        let result = writer.build(&path, &Descriptors::default(), records);
        assert!(matches!(result, Err(CacheError::Serialization { .. })));
        assert!(!path.exists());

        // The failed build's environment is closed, so the path is reusable.
        assert_eq!(writer.build(&path, &Descriptors::default(), range_records(3)).unwrap(), 3);
        assert_eq!(KeyedStoreReader::open(&path).unwrap().len(), 3);
    }

    #[test]
    fn test_align_map_size() {
        assert_eq!(align_map_size(0), MAP_SIZE_ALIGNMENT);
        assert_eq!(align_map_size(MAP_SIZE_ALIGNMENT + 1), 2 * MAP_SIZE_ALIGNMENT);
        assert_eq!(align_map_size(1 << 30), 1 << 30);
    }
}
