// cache-core/src/keyed/key.rs

use std::fmt;

use serde::{Deserialize, Serialize};

/// Reserved key holding the ordered key list.
pub const KEYS_KEY: &[u8] = b"__keys__";
/// Reserved key holding the dataset-wide shape descriptor.
pub const SHAPES_KEY: &[u8] = b"__shapes__";
/// Reserved key holding the dataset-wide type descriptor.
pub const TYPES_KEY: &[u8] = b"__types__";

/// Positional key of one record: the record ordinal, zero-padded to eight
/// decimal digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKey(String);

impl RecordKey {
    pub fn from_index(index: u64) -> Self {
        Self(format!("{index:08}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// The ordinal this key was assigned at build time.
    pub fn index(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Keys for the first `count` records, in production order.
pub fn keys_for(count: u64) -> Vec<RecordKey> {
    (0..count).map(RecordKey::from_index).collect()
}
