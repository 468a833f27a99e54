// cache-core/src/dataset/keys.rs

//! Deterministic sharding and seeded shuffling of key lists.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{CacheError, Result};

/// How one consumer's share of the keys is selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardOptions {
    pub shard_index: usize,
    pub num_shards: usize,
    /// Contiguous blocks instead of round-robin assignment.
    pub sequential: bool,
    /// Truncate the tail so every shard has `len / num_shards` keys.
    pub drop_remainder: bool,
}

impl ShardOptions {
    pub fn new(shard_index: usize, num_shards: usize) -> Self {
        Self {
            shard_index,
            num_shards,
            sequential: false,
            drop_remainder: false,
        }
    }

    #[must_use]
    pub fn sequential(mut self, sequential: bool) -> Self {
        self.sequential = sequential;
        self
    }

    #[must_use]
    pub fn drop_remainder(mut self, drop_remainder: bool) -> Self {
        self.drop_remainder = drop_remainder;
        self
    }
}

impl Default for ShardOptions {
    fn default() -> Self {
        Self::new(0, 1)
    }
}

/// Select the keys of one shard.
///
/// With `sequential`, shard `i` gets a contiguous block and concatenating
/// shards `0..num_shards` reproduces the input. Otherwise shard `i` gets
/// positions `i, i + num_shards, ...` and interleaving the shards reproduces
/// the input.
///
/// # Errors
///
/// Returns `InvalidShard` if `shard_index >= num_shards`, and
/// `InsufficientKeys` if `drop_remainder` is set with fewer keys than shards.
pub fn shard_keys<T: Clone>(keys: &[T], options: &ShardOptions) -> Result<Vec<T>> {
    let ShardOptions { shard_index, num_shards, sequential, drop_remainder } = *options;
    if num_shards == 0 || shard_index >= num_shards {
        return Err(CacheError::invalid_shard(shard_index, num_shards));
    }

    let keys = if drop_remainder {
        if keys.len() < num_shards {
            return Err(CacheError::insufficient_keys(keys.len(), num_shards));
        }
        &keys[..keys.len() - keys.len() % num_shards]
    } else {
        keys
    };

    Ok(if sequential {
        sequential_shard(keys, shard_index, num_shards)
    } else {
        strided_shard(keys, shard_index, num_shards)
    })
}

fn sequential_shard<T: Clone>(keys: &[T], shard_index: usize, num_shards: usize) -> Vec<T> {
    // The first `remainder` shards take one extra key each.
    let base = keys.len() / num_shards;
    let remainder = keys.len() % num_shards;
    let start = base * shard_index + remainder.min(shard_index);
    let size = base + usize::from(shard_index < remainder);
    keys[start..start + size].to_vec()
}

fn strided_shard<T: Clone>(keys: &[T], shard_index: usize, num_shards: usize) -> Vec<T> {
    keys.iter().skip(shard_index).step_by(num_shards).cloned().collect()
}

/// Return a permuted copy of `keys`.
///
/// The same `seed` always yields the same permutation of the same input;
/// `None` draws a fresh permutation from entropy. Seed `0` is a real seed.
pub fn shuffle_keys<T: Clone>(keys: &[T], seed: Option<u64>) -> Vec<T> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut shuffled = keys.to_vec();
    shuffled.shuffle(&mut rng);
    shuffled
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_shards(n: usize, num_shards: usize, sequential: bool, drop: bool) -> Vec<Vec<usize>> {
        let keys: Vec<usize> = (0..n).collect();
        (0..num_shards)
            .map(|i| {
                let options = ShardOptions::new(i, num_shards)
                    .sequential(sequential)
                    .drop_remainder(drop);
                shard_keys(&keys, &options).unwrap()
            })
            .collect()
    }

    fn interleave(shards: &[Vec<usize>]) -> Vec<usize> {
        let longest = shards.iter().map(Vec::len).max().unwrap_or(0);
        let mut out = Vec::new();
        for position in 0..longest {
            for shard in shards {
                if let Some(key) = shard.get(position) {
                    out.push(*key);
                }
            }
        }
        out
    }

    #[test]
    fn test_sequential_shards_concatenate_to_input() {
        for n in [0, 1, 7, 10, 23] {
            for num_shards in 1..=6 {
                let shards = all_shards(n, num_shards, true, false);
                let joined: Vec<usize> = shards.concat();
                assert_eq!(joined, (0..n).collect::<Vec<_>>(), "n={n} shards={num_shards}");
            }
        }
    }

    #[test]
    fn test_strided_shards_interleave_to_input() {
        for n in [0, 1, 7, 10, 23] {
            for num_shards in 1..=6 {
                let shards = all_shards(n, num_shards, false, false);
                assert_eq!(interleave(&shards), (0..n).collect::<Vec<_>>());
            }
        }
    }

    #[test]
    fn test_drop_remainder_equal_sizes() {
        for sequential in [true, false] {
            let shards = all_shards(23, 5, sequential, true);
            assert!(shards.iter().all(|s| s.len() == 4));

            let expected: Vec<usize> = (0..20).collect();
            let rebuilt = if sequential { shards.concat() } else { interleave(&shards) };
            assert_eq!(rebuilt, expected);
        }
    }

    #[test]
    fn test_sequential_block_layout() {
        // 10 keys over 3 shards: sizes 4, 3, 3
        let shards = all_shards(10, 3, true, false);
        assert_eq!(shards[0], vec![0, 1, 2, 3]);
        assert_eq!(shards[1], vec![4, 5, 6]);
        assert_eq!(shards[2], vec![7, 8, 9]);
    }

    #[test]
    fn test_sequential_shards_partition_input() {
        let cases = [(7, 4), (3, 5), (0, 3), (10, 10), (11, 3), (100, 7), (5, 1)];
        for (n, num_shards) in cases {
            let shards = all_shards(n, num_shards, true, false);

            let sizes: Vec<usize> = shards.iter().map(Vec::len).collect();
            let (base, extra) = (n / num_shards, n % num_shards);
            let expected: Vec<usize> = (0..num_shards).map(|i| base + usize::from(i < extra)).collect();
            assert_eq!(sizes, expected, "n={n} shards={num_shards}");

            let mut seen = std::collections::HashSet::new();
            assert!(shards.iter().flatten().all(|key| seen.insert(*key)), "n={n} shards={num_shards}");
            assert_eq!(shards.concat(), (0..n).collect::<Vec<_>>(), "n={n} shards={num_shards}");
        }

        let shards = all_shards(7, 4, true, false);
        assert_eq!(shards, vec![vec![0, 1], vec![2, 3], vec![4, 5], vec![6]]);
    }

    #[test]
    fn test_strided_layout() {
        let shards = all_shards(10, 3, false, false);
        assert_eq!(shards[1], vec![1, 4, 7]);
    }

    #[test]
    fn test_drop_remainder_insufficient_keys() {
        let keys: Vec<usize> = (0..3).collect();
        let options = ShardOptions::new(0, 4).drop_remainder(true);
        let result = shard_keys(&keys, &options);
        assert!(matches!(
            result,
            Err(CacheError::InsufficientKeys { num_keys: 3, num_shards: 4 })
        ));
    }

    #[test]
    fn test_invalid_shard_index() {
        let keys: Vec<usize> = (0..3).collect();
        assert!(shard_keys(&keys, &ShardOptions::new(2, 2)).is_err());
        assert!(shard_keys(&keys, &ShardOptions::new(0, 0)).is_err());
    }

    #[test]
    fn test_shuffle_is_reproducible() {
        let keys: Vec<usize> = (0..100).collect();
        let first = shuffle_keys(&keys, Some(325));
        let second = shuffle_keys(&keys, Some(325));
        assert_eq!(first, second);
        assert_ne!(first, keys);

        let mut sorted = first.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, keys);
    }

    #[test]
    fn test_shuffle_seed_zero_still_shuffles() {
        let keys: Vec<usize> = (0..100).collect();
        assert_ne!(shuffle_keys(&keys, Some(0)), keys);
    }

    #[test]
    fn test_shuffle_does_not_mutate_input() {
        let keys: Vec<usize> = (0..10).collect();
        let _ = shuffle_keys(&keys, None);
        assert_eq!(keys, (0..10).collect::<Vec<_>>());
    }
}
