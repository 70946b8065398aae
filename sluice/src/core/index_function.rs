//! Maps keys to a partition and a bucket within it.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Where a key belongs in a partitioned table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexResult {
    /// The partition the key belongs to.
    pub partition_id: usize,
    /// Hash bits from which the bucket within the partition is taken.
    pub global_index: u64,
}

impl IndexResult {
    /// The bucket within a partition of `partition_size` buckets.
    ///
    /// When a partition grows to a multiple of its size, each key's new bucket is its old
    /// bucket plus a multiple of the old size.
    #[inline]
    pub fn local_index(&self, partition_size: usize) -> usize {
        (self.global_index % partition_size as u64) as usize
    }
}

/// Assigns keys to partitions and buckets.
///
/// All workers must compute the same result for the same key, since the partition of a key
/// decides which worker reduces it.
pub trait IndexFunction<K: ?Sized>: Clone {
    /// The partition and bucket bits of `key` in a table of `num_partitions` partitions.
    fn index(&self, key: &K, num_partitions: usize) -> IndexResult;

    /// A function for the `iteration`-th re-reduction of data partitioned by `self`.
    ///
    /// Keys that collided under `self` are spread differently.
    fn for_iteration(&self, iteration: usize) -> Self;
}

/// Hashes keys with a salt, taking the partition from the high bits and buckets from the low bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReduceByHash {
    salt: u64,
}

impl ReduceByHash {
    /// An index function hashing with `salt`.
    pub fn new(salt: u64) -> Self {
        ReduceByHash { salt }
    }

    /// The salt.
    pub fn salt(&self) -> u64 { self.salt }
}

impl<K: Hash + ?Sized> IndexFunction<K> for ReduceByHash {
    fn index(&self, key: &K, num_partitions: usize) -> IndexResult {
        // `DefaultHasher::new` uses fixed keys, so hashes agree across workers.
        let mut hasher = DefaultHasher::new();
        self.salt.hash(&mut hasher);
        key.hash(&mut hasher);
        let hashed = hasher.finish();
        let partition_id = ((u128::from(hashed) * num_partitions as u128) >> 64) as usize;
        IndexResult { partition_id, global_index: hashed }
    }

    fn for_iteration(&self, iteration: usize) -> Self {
        ReduceByHash { salt: self.salt ^ (iteration as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_in_range_and_spread() {
        let index = ReduceByHash::new(0);
        let mut counts = [0usize; 8];
        for key in 0u64 .. 8000 {
            let result = index.index(&key, 8);
            assert!(result.partition_id < 8);
            assert!(result.local_index(100) < 100);
            counts[result.partition_id] += 1;
        }
        assert!(counts.iter().all(|&count| count > 800));
    }

    #[test]
    fn iterations_spread_a_partition() {
        let base = ReduceByHash::new(0);
        let next = IndexFunction::<u64>::for_iteration(&base, 1);
        let mut used = [false; 32];
        for key in (0u64 ..).filter(|key| base.index(key, 32).partition_id == 0).take(1000) {
            used[next.index(&key, 32).partition_id] = true;
        }
        assert!(used.iter().filter(|&&u| u).count() > 16);
    }
}
