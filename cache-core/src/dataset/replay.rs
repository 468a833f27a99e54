// cache-core/src/dataset/replay.rs

//! Restartable replay of a key list with resume offsets and per-epoch
//! reshuffling.
//!
//! A [`ReplayGenerator`] starts unstarted. Each call to
//! [`ReplayGenerator::instantiate`] opens one pass over the keys of the
//! current epoch and advances the epoch counter; exhausting the pass is the
//! epoch boundary. Only the first pass honours the resume offset.

use std::sync::Arc;

use crate::error::{CacheError, Result};

use super::keys::shuffle_keys;

/// Construction options for a [`ReplayGenerator`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayOptions {
    /// Absolute record offset into the endless repetition of the dataset.
    pub initial_offset: u64,
    pub shuffle_at_start: bool,
    pub shuffle_after_epoch: bool,
    pub shuffle_seed: Option<u64>,
}

pub struct ReplayGenerator<K> {
    keys: Arc<[K]>,
    options: ReplayOptions,
    current_epoch: u64,
    offset_within_epoch: usize,
    initial_pass: bool,
    // Permutation reused by every pass when epochs are not reshuffled.
    fixed_order: Option<Arc<[K]>>,
}

impl<K: Clone> ReplayGenerator<K> {
    /// Creates a generator over `keys`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` if `shuffle_after_epoch` is set without
    /// `shuffle_at_start` or without a seed.
    pub fn new(keys: impl Into<Arc<[K]>>, options: ReplayOptions) -> Result<Self> {
        if options.shuffle_after_epoch {
            if !options.shuffle_at_start {
                return Err(CacheError::invalid_configuration(
                    "`shuffle` must be enabled to use `shuffle_after_epoch`",
                ));
            }
            if options.shuffle_seed.is_none() {
                return Err(CacheError::invalid_configuration(
                    "`shuffle_seed` must be set to use `shuffle_after_epoch`",
                ));
            }
        }

        let keys = keys.into();
        let (current_epoch, offset_within_epoch) = match keys.len() as u64 {
            0 => (0, 0),
            len => (options.initial_offset / len, (options.initial_offset % len) as usize),
        };

        Ok(Self {
            keys,
            options,
            current_epoch,
            offset_within_epoch,
            initial_pass: true,
            fixed_order: None,
        })
    }

    /// Number of keys in one full pass.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The epoch the next pass will replay.
    pub fn epoch(&self) -> u64 {
        self.current_epoch
    }

    /// Opens the next pass and moves to the following epoch.
    pub fn instantiate(&mut self) -> EpochPass<K> {
        let epoch = self.current_epoch;
        let keys = self.order_for(epoch);
        let position = if self.initial_pass { self.offset_within_epoch } else { 0 };
        self.initial_pass = false;
        self.current_epoch += 1;
        EpochPass { keys, position, epoch }
    }

    fn order_for(&mut self, epoch: u64) -> Arc<[K]> {
        if !self.options.shuffle_at_start {
            return self.keys.clone();
        }
        if self.options.shuffle_after_epoch {
            return shuffle_keys(&self.keys, self.seed_for(epoch)).into();
        }
        let keys = &self.keys;
        let seed = self.options.shuffle_seed;
        self.fixed_order
            .get_or_insert_with(|| shuffle_keys(keys, seed).into())
            .clone()
    }

    fn seed_for(&self, epoch: u64) -> Option<u64> {
        match self.options.shuffle_seed {
            Some(seed) if epoch > 0 => Some(seed.wrapping_add(epoch)),
            seed => seed,
        }
    }
}

/// One pass over the keys of an epoch.
#[derive(Debug, Clone)]
pub struct EpochPass<K> {
    keys: Arc<[K]>,
    position: usize,
    epoch: u64,
}

impl<K> EpochPass<K> {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl<K: Clone> Iterator for EpochPass<K> {
    type Item = K;

    fn next(&mut self) -> Option<K> {
        let key = self.keys.get(self.position)?.clone();
        self.position += 1;
        Some(key)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.keys.len().saturating_sub(self.position);
        (remaining, Some(remaining))
    }
}

impl<K: Clone> ExactSizeIterator for EpochPass<K> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(n: usize) -> Vec<usize> {
        (0..n).collect()
    }

    #[test]
    fn test_offset_applies_to_first_pass_only() {
        let options = ReplayOptions {
            initial_offset: 5,
            ..Default::default()
        };
        let mut generator = ReplayGenerator::new(range(10), options).unwrap();

        let first = generator.instantiate();
        assert_eq!(first.len(), 5);
        assert_eq!(first.collect::<Vec<_>>(), vec![5, 6, 7, 8, 9]);

        for _ in 0..3 {
            let pass = generator.instantiate();
            assert_eq!(pass.len(), 10);
            assert_eq!(pass.collect::<Vec<_>>(), range(10));
        }
    }

    #[test]
    fn test_offset_past_first_epoch() {
        let options = ReplayOptions {
            initial_offset: 15,
            ..Default::default()
        };
        let mut generator = ReplayGenerator::new(range(10), options).unwrap();
        assert_eq!(generator.epoch(), 1);

        let first = generator.instantiate();
        assert_eq!(first.epoch(), 1);
        assert_eq!(first.collect::<Vec<_>>(), vec![5, 6, 7, 8, 9]);
        assert_eq!(generator.epoch(), 2);
    }

    #[test]
    fn test_shuffle_without_reshuffle_keeps_permutation() {
        for seed in [Some(325), None] {
            let options = ReplayOptions {
                shuffle_at_start: true,
                shuffle_seed: seed,
                ..Default::default()
            };
            let mut generator = ReplayGenerator::new(range(50), options).unwrap();
            let first: Vec<usize> = generator.instantiate().collect();
            let second: Vec<usize> = generator.instantiate().collect();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_shuffle_matches_seeded_shuffle() {
        let options = ReplayOptions {
            shuffle_at_start: true,
            shuffle_seed: Some(325),
            ..Default::default()
        };
        let mut generator = ReplayGenerator::new(range(10), options).unwrap();
        let pass: Vec<usize> = generator.instantiate().collect();
        assert_eq!(pass, shuffle_keys(&range(10), Some(325)));
    }

    #[test]
    fn test_reshuffle_uses_epoch_seed() {
        let seed = 325;
        let options = ReplayOptions {
            initial_offset: 15,
            shuffle_at_start: true,
            shuffle_after_epoch: true,
            shuffle_seed: Some(seed),
        };
        let mut generator = ReplayGenerator::new(range(10), options).unwrap();

        for epoch in 1..5u64 {
            let mut expected = shuffle_keys(&range(10), Some(seed + epoch));
            if epoch == 1 {
                expected.drain(..5);
            }
            let pass: Vec<usize> = generator.instantiate().collect();
            assert_eq!(pass, expected, "epoch {epoch}");
        }
    }

    #[test]
    fn test_reshuffle_requires_seed() {
        let options = ReplayOptions {
            shuffle_at_start: true,
            shuffle_after_epoch: true,
            ..Default::default()
        };
        let result = ReplayGenerator::new(range(10), options);
        assert!(matches!(result, Err(CacheError::InvalidConfiguration { .. })));
    }

    #[test]
    fn test_reshuffle_requires_shuffle() {
        let options = ReplayOptions {
            shuffle_after_epoch: true,
            shuffle_seed: Some(1),
            ..Default::default()
        };
        assert!(ReplayGenerator::new(range(10), options).is_err());
    }

    #[test]
    fn test_empty_keys() {
        let options = ReplayOptions {
            initial_offset: 7,
            ..Default::default()
        };
        let mut generator = ReplayGenerator::<usize>::new(Vec::new(), options).unwrap();
        assert_eq!(generator.instantiate().count(), 0);
        assert_eq!(generator.instantiate().count(), 0);
    }
}
