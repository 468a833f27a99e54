// cache-core/src/dataset/source.rs

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CacheError, Result};
use crate::keyed::Descriptors;

type RecordIter<'a> = Box<dyn Iterator<Item = Result<Vec<u8>>> + 'a>;

/// A one-pass producer of serialized records plus the dataset descriptors
/// captured before iteration starts.
pub struct RecordSource<'a> {
    descriptors: Descriptors,
    records: RecordIter<'a>,
}

impl<'a> RecordSource<'a> {
    pub fn new<I>(descriptors: Descriptors, records: I) -> Self
    where
        I: IntoIterator<Item = Result<Vec<u8>>>,
        I::IntoIter: 'a,
    {
        Self {
            descriptors,
            records: Box::new(records.into_iter()),
        }
    }

    /// Records that are already serialized and cannot fail.
    pub fn from_bytes<I>(descriptors: Descriptors, records: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
        I::IntoIter: 'a,
    {
        Self::new(descriptors, records.into_iter().map(Ok))
    }

    /// Serializes each item with bincode; pair with [`decode_record`].
    pub fn from_serializable<T, I>(descriptors: Descriptors, items: I) -> Self
    where
        T: Serialize + 'a,
        I: IntoIterator<Item = T>,
        I::IntoIter: 'a,
    {
        Self::new(descriptors, items.into_iter().map(|item| encode_record(&item)))
    }

    pub fn descriptors(&self) -> &Descriptors {
        &self.descriptors
    }

    pub fn into_parts(self) -> (Descriptors, RecordIter<'a>) {
        (self.descriptors, self.records)
    }
}

pub fn encode_record<T: Serialize>(item: &T) -> Result<Vec<u8>> {
    bincode::serialize(item)
        .map_err(|e| CacheError::serialization(format!("failed to encode record: {e}")))
}

pub fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes)
        .map_err(|e| CacheError::serialization(format!("failed to decode record: {e}")))
}
