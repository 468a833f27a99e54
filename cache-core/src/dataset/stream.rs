// cache-core/src/dataset/stream.rs

//! Data references and streams over a built keyed store.

use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::error::Result;
use crate::keyed::{Descriptors, KeyedStoreReader, RecordKey};

use super::keys::{shard_keys, ShardOptions};
use super::replay::{EpochPass, ReplayGenerator, ReplayOptions};
use super::source::decode_record;

/// Options selecting the visit order of a [`Stream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
    pub start_offset: u64,
    pub shuffle: bool,
    pub skip_shuffle_at_epoch_end: bool,
    pub shuffle_seed: Option<u64>,
    pub shard_rank: usize,
    pub num_shards: usize,
    pub drop_shard_remainder: bool,
    // Contiguous shards instead of the default round-robin.
    pub sequential_shards: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            start_offset: 0,
            shuffle: false,
            skip_shuffle_at_epoch_end: false,
            shuffle_seed: None,
            shard_rank: 0,
            num_shards: 1,
            drop_shard_remainder: false,
            sequential_shards: false,
        }
    }
}

/// Handle to one materialized cache, able to produce [`Stream`]s.
#[derive(Debug, Clone)]
pub struct DataRef {
    reader: Arc<KeyedStoreReader>,
}

impl DataRef {
    pub fn new(reader: KeyedStoreReader) -> Self {
        Self {
            reader: Arc::new(reader),
        }
    }

    /// Number of records in the whole dataset.
    pub fn len(&self) -> usize {
        self.reader.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reader.is_empty()
    }

    pub fn descriptors(&self) -> &Descriptors {
        self.reader.descriptors()
    }

    /// Creates a stream for one (offset, shuffle, shard) configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidShard` or `InsufficientKeys` for an impossible shard
    /// and `InvalidConfiguration` when epoch reshuffling is requested
    /// without a seed.
    pub fn stream(&self, options: &StreamOptions) -> Result<Stream> {
        let shard = ShardOptions::new(options.shard_rank, options.num_shards)
            .sequential(options.sequential_shards)
            .drop_remainder(options.drop_shard_remainder);
        let keys = shard_keys(&self.reader.keys(), &shard)?;
        let length = keys.len();

        let generator = ReplayGenerator::new(
            keys,
            ReplayOptions {
                initial_offset: options.start_offset,
                shuffle_at_start: options.shuffle,
                shuffle_after_epoch: options.shuffle && !options.skip_shuffle_at_epoch_end,
                shuffle_seed: options.shuffle_seed,
            },
        )?;

        Ok(Stream {
            reader: Arc::clone(&self.reader),
            generator,
            length,
        })
    }
}

/// A restartable record sequence for one stream configuration.
pub struct Stream {
    reader: Arc<KeyedStoreReader>,
    generator: ReplayGenerator<RecordKey>,
    length: usize,
}

impl Stream {
    /// Records per full pass of this shard.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn shapes(&self) -> &serde_json::Value {
        self.reader.shapes()
    }

    pub fn types(&self) -> &serde_json::Value {
        self.reader.types()
    }

    /// Starts the next pass.
    pub fn iter(&mut self) -> StreamPass {
        StreamPass {
            reader: Arc::clone(&self.reader),
            keys: self.generator.instantiate(),
        }
    }

    /// Starts the next pass, decoding records written with
    /// [`RecordSource::from_serializable`](super::RecordSource::from_serializable).
    pub fn decoded<T: DeserializeOwned>(&mut self) -> impl Iterator<Item = Result<T>> {
        self.iter()
            .map(|record| record.and_then(|bytes| decode_record(&bytes)))
    }
}

/// One pass of a [`Stream`].
pub struct StreamPass {
    reader: Arc<KeyedStoreReader>,
    keys: EpochPass<RecordKey>,
}

impl StreamPass {
    pub fn epoch(&self) -> u64 {
        self.keys.epoch()
    }
}

impl Iterator for StreamPass {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let key = self.keys.next()?;
        Some(self.reader.read(&key))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.keys.size_hint()
    }
}

impl ExactSizeIterator for StreamPass {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyedStoreConfig;
    use crate::dataset::{shuffle_keys, RecordSource};
    use crate::error::CacheError;
    use crate::keyed::KeyedStoreWriter;
    use tempfile::TempDir;

    fn range_dataref(dir: &TempDir, n: u64) -> DataRef {
        let path = dir.path().join("cache.mdb");
        let source = RecordSource::from_serializable(Descriptors::default(), 0..n);
        let (descriptors, records) = source.into_parts();
        KeyedStoreWriter::new(KeyedStoreConfig::default())
            .build(&path, &descriptors, records)
            .unwrap();
        DataRef::new(KeyedStoreReader::open(&path).unwrap())
    }

    fn collect(stream: &mut Stream) -> Vec<u64> {
        stream.decoded::<u64>().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_stream_default_replays_in_order() {
        let dir = TempDir::new().unwrap();
        let dataref = range_dataref(&dir, 10);
        let mut stream = dataref.stream(&StreamOptions::default()).unwrap();

        assert_eq!(stream.len(), 10);
        for _ in 0..3 {
            assert_eq!(collect(&mut stream), (0..10).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_stream_with_offset() {
        let dir = TempDir::new().unwrap();
        let dataref = range_dataref(&dir, 10);
        let options = StreamOptions {
            start_offset: 5,
            ..Default::default()
        };
        let mut stream = dataref.stream(&options).unwrap();

        assert_eq!(collect(&mut stream), vec![5, 6, 7, 8, 9]);
        assert_eq!(collect(&mut stream), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_stream_shuffle_skip_epoch_reshuffle() {
        let dir = TempDir::new().unwrap();
        let dataref = range_dataref(&dir, 10);
        let options = StreamOptions {
            shuffle: true,
            skip_shuffle_at_epoch_end: true,
            shuffle_seed: Some(325),
            ..Default::default()
        };
        let mut stream = dataref.stream(&options).unwrap();
        let expected = shuffle_keys(&(0..10).collect::<Vec<u64>>(), Some(325));

        for _ in 0..3 {
            assert_eq!(collect(&mut stream), expected);
        }
    }

    #[test]
    fn test_stream_shuffle_after_epoch() {
        let dir = TempDir::new().unwrap();
        let dataref = range_dataref(&dir, 10);
        let options = StreamOptions {
            shuffle: true,
            shuffle_seed: Some(325),
            ..Default::default()
        };
        let mut stream = dataref.stream(&options).unwrap();
        let unshuffled: Vec<u64> = (0..10).collect();

        for epoch in 0..3u64 {
            let seed = if epoch == 0 { 325 } else { 325 + epoch };
            assert_eq!(collect(&mut stream), shuffle_keys(&unshuffled, Some(seed)));
        }
    }

    #[test]
    fn test_stream_shuffle_requires_seed_for_reshuffle() {
        let dir = TempDir::new().unwrap();
        let dataref = range_dataref(&dir, 10);
        let options = StreamOptions {
            shuffle: true,
            ..Default::default()
        };
        assert!(matches!(
            dataref.stream(&options),
            Err(CacheError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_stream_shards_are_strided_by_default() {
        let dir = TempDir::new().unwrap();
        let dataref = range_dataref(&dir, 10);
        let options = StreamOptions {
            shard_rank: 1,
            num_shards: 3,
            ..Default::default()
        };
        let mut stream = dataref.stream(&options).unwrap();
        assert_eq!(stream.len(), 3);
        assert_eq!(collect(&mut stream), vec![1, 4, 7]);

        let options = StreamOptions {
            shard_rank: 1,
            num_shards: 3,
            sequential_shards: true,
            drop_shard_remainder: true,
            ..Default::default()
        };
        let mut stream = dataref.stream(&options).unwrap();
        assert_eq!(collect(&mut stream), vec![3, 4, 5]);
    }
}
