// cache-core/src/keyed/mod.rs

//! Keyed record store backed by a single-file LMDB environment.
//!
//! A keyed store holds every record of one dataset under sequential
//! [`RecordKey`]s plus three reserved entries: the ordered key list and the
//! dataset-wide shape and type descriptors. The store is written once by
//! [`KeyedStoreWriter::build`] and read by [`KeyedStoreReader`]. The metadata
//! entries are committed last, so a file without them is an incomplete build.
//!
//! # Example
//!
//! ```no_run
//! use cache_core::config::KeyedStoreConfig;
//! use cache_core::keyed::{Descriptors, KeyedStoreReader, KeyedStoreWriter};
//!
//! # fn example() -> cache_core::Result<()> {
//! let writer = KeyedStoreWriter::new(KeyedStoreConfig::default());
//! let records = (0u8..10).map(|i| Ok(vec![i]));
//! let written = writer.build("/tmp/cache.mdb".as_ref(), &Descriptors::default(), records)?;
//!
//! let reader = KeyedStoreReader::open("/tmp/cache.mdb")?;
//! assert_eq!(reader.len() as u64, written);
//! let first = reader.read(&reader.keys()[0])?;
//! # Ok(())
//! # }
//! ```

mod key;
mod reader;
mod writer;

pub use key::{keys_for, RecordKey, KEYS_KEY, SHAPES_KEY, TYPES_KEY};
pub use reader::KeyedStoreReader;
pub use writer::{KeyedStoreWriter, Transaction};

use serde::{Deserialize, Serialize};

/// Dataset-wide descriptors forwarded unchanged from producer to consumer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Descriptors {
    pub shapes: serde_json::Value,
    pub types: serde_json::Value,
}

impl Descriptors {
    pub fn new(shapes: serde_json::Value, types: serde_json::Value) -> Self {
        Self { shapes, types }
    }
}
