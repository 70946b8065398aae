//! A partitioned hash table with linear probing that combines items with equal keys.
//!
//! The buckets are divided into partitions, one per destination of the table's output. Each
//! partition starts small and doubles while memory allows, up to the share of the table's memory
//! limit it would have if all partitions were full. A partition that cannot grow is spilled:
//! written to its own [`File`], or handed straight to the emitter when the table flushes
//! immediately.
//!
//! ```text
//!     partition 0         partition 1         partition 2
//!   +----+----+----+    +----+----+----+    +----+----+----+
//!   | kv |    | kv |... | kv | kv |    |... |    |    | kv |...
//!   +----+----+----+    +----+----+----+    +----+----+----+
//!   <- partition size ->
//!   <- buckets per partition (cap) ->
//! ```
//!
//! An empty bucket is `None`. The key equal to `K::default()` never occupies a bucket. It is
//! reduced into a separate sentinel slot, owned by the partition its hash maps to, and counted
//! with that partition's items.

use std::fmt::Debug;

use serde::Serialize;

use crate::core::index_function::IndexFunction;
use crate::core::reduce_table::{Emitter, TableContext};
use crate::data::File;
use crate::logging::ReduceAction;
use crate::Result;

/// The buckets of one partition and what has been spilled from it.
struct Partition<K, V> {
    /// Valid buckets; the length is the partition's current size.
    slots: Vec<Option<(K, V)>>,
    /// Occupied buckets, plus one if the partition owns the sentinel.
    items: usize,
    /// Item count at which the partition grows or spills.
    limit_items: usize,
    /// Spilled items.
    file: File,
}

/// Combines items `(K, V)` with equal keys using `R`.
pub struct ReduceProbingHashTable<K, V, R, I, E> {
    context: TableContext,
    partitions: Vec<Partition<K, V>>,
    /// The item with the default key, and the partition owning it.
    sentinel: Option<((K, V), usize)>,
    num_items: usize,
    /// Upper bound of every partition's size.
    num_buckets_per_partition: usize,
    limit_memory_bytes: usize,
    /// Bytes charged to the memory tracker for buckets.
    tracked_bytes: usize,
    immediate_flush: bool,
    index_function: I,
    reduce: R,
    emitter: E,
}

impl<K, V, R, I, E> ReduceProbingHashTable<K, V, R, I, E>
where
    K: Eq + Default + Serialize,
    V: Serialize,
    R: Fn(&V, &V) -> V,
    I: IndexFunction<K>,
    E: Emitter<K, V>,
{
    /// A table of `num_partitions` partitions using at most `limit_memory_bytes` for buckets.
    ///
    /// With `immediate_flush`, partitions that cannot grow are flushed to `emitter` instead
    /// of spilled to files.
    pub fn new(
        context: TableContext,
        num_partitions: usize,
        limit_memory_bytes: usize,
        immediate_flush: bool,
        index_function: I,
        reduce: R,
        emitter: E,
    ) -> Self {
        assert!(num_partitions > 0, "a reduce table needs at least one partition");
        let fill_rate = context.config.limit_partition_fill_rate;
        debug_assert!((0.0 ..= 1.0).contains(&fill_rate), "fill rate {} outside [0, 1]", fill_rate);

        // two buckets at least, so that a full partition still keeps an item between spills
        let num_buckets_per_partition = (limit_memory_bytes / Self::SLOT_BYTES / num_partitions).max(2);
        let initial = context.config.initial_items_per_partition.clamp(1, num_buckets_per_partition);
        let partitions = (0 .. num_partitions)
            .map(|_| Partition {
                slots: std::iter::repeat_with(|| None).take(initial).collect(),
                items: 0,
                limit_items: limit_items(initial, fill_rate),
                file: context.new_file(),
            })
            .collect();

        let mut table = ReduceProbingHashTable {
            context,
            partitions,
            sentinel: None,
            num_items: 0,
            num_buckets_per_partition,
            limit_memory_bytes,
            tracked_bytes: 0,
            immediate_flush,
            index_function,
            reduce,
            emitter,
        };
        table.track(num_partitions * initial * Self::SLOT_BYTES);
        table
    }

    const SLOT_BYTES: usize = std::mem::size_of::<Option<(K, V)>>();

    fn track(&mut self, bytes: usize) {
        if let Some(tracker) = &self.context.tracker {
            tracker.add(bytes);
        }
        self.tracked_bytes += bytes;
    }

    /// Inserts an item, reducing it into an item with the same key if there is one.
    ///
    /// Returns `true` if the key was not in the table.
    pub fn insert(&mut self, item: (K, V)) -> Result<bool> {
        let index = self.index_function.index(&item.0, self.partitions.len());
        let partition_id = index.partition_id;
        debug_assert!(partition_id < self.partitions.len());

        if item.0 == K::default() {
            if let Some(((_, value), _)) = &mut self.sentinel {
                *value = (self.reduce)(&*value, &item.1);
                return Ok(false);
            }
            self.sentinel = Some((item, partition_id));
            self.partitions[partition_id].items += 1;
            self.num_items += 1;
            while self.partitions[partition_id].items > self.partitions[partition_id].limit_items {
                self.grow_and_rehash(partition_id)?;
            }
            return Ok(true);
        }

        let size = self.partitions[partition_id].slots.len();
        let start = index.local_index(size);
        let mut position = start;
        loop {
            match &mut self.partitions[partition_id].slots[position] {
                None => break,
                Some((key, value)) if *key == item.0 => {
                    *value = (self.reduce)(&*value, &item.1);
                    return Ok(false);
                },
                Some(_) => {},
            }
            position += 1;
            if position == size {
                position = 0;
            }
            if position == start {
                // every bucket is taken
                self.grow_and_rehash(partition_id)?;
                return self.insert(item);
            }
        }

        self.partitions[partition_id].slots[position] = Some(item);
        self.partitions[partition_id].items += 1;
        self.num_items += 1;

        // a spill empties the partition, which ends the loop even if the limit is zero
        while self.partitions[partition_id].items > 0
            && self.partitions[partition_id].items >= self.partitions[partition_id].limit_items
        {
            self.grow_and_rehash(partition_id)?;
        }
        Ok(true)
    }

    /// Doubles a partition and moves its items to their buckets in the larger range.
    ///
    /// Spills the partition instead if it cannot grow, or if the new size is not a multiple
    /// of the old one.
    pub fn grow_and_rehash(&mut self, partition_id: usize) -> Result<()> {
        let old_size = self.partitions[partition_id].slots.len();
        self.grow_partition(partition_id)?;
        let new_size = self.partitions[partition_id].slots.len();
        if new_size == old_size || new_size % old_size != 0 {
            return self.spill_partition(partition_id);
        }

        // Items only move towards higher buckets of the grown range, except for the ones that
        // wrapped around the old end. Rescan the old range, then continue into the new range
        // until the first hole, past which no wrapped cluster can reach.
        let mut position = 0;
        let mut passed_first_half = false;
        let mut found_hole = false;
        while (!passed_first_half || !found_hole) && position < self.partitions[partition_id].slots.len() {
            let taken = self.partitions[partition_id].slots[position].take();
            let is_empty = taken.is_none();
            if let Some(item) = taken {
                self.partitions[partition_id].items -= 1;
                self.num_items -= 1;
                self.insert(item)?;
            }
            position += 1;
            found_hole = passed_first_half && is_empty;
            passed_first_half = passed_first_half || position == old_size;
        }
        Ok(())
    }

    /// Doubles the buckets of a partition, up to the per-partition cap.
    ///
    /// Spills the partition instead while memory is exceeded.
    pub fn grow_partition(&mut self, partition_id: usize) -> Result<()> {
        if self.context.memory_exceeded() {
            return self.spill_partition(partition_id);
        }
        let size = self.partitions[partition_id].slots.len();
        if size == self.num_buckets_per_partition {
            return Ok(());
        }
        let new_size = (2 * size).min(self.num_buckets_per_partition);
        let fill_rate = self.context.config.limit_partition_fill_rate;
        let partition = &mut self.partitions[partition_id];
        partition.slots.resize_with(new_size, || None);
        partition.limit_items = limit_items(new_size, fill_rate);
        self.track((new_size - size) * Self::SLOT_BYTES);
        self.context.log(ReduceAction::Grow, partition_id, new_size);
        Ok(())
    }

    /// Writes all items of a partition to its file and empties it.
    ///
    /// Tables flushing immediately hand the items to the emitter instead, and grow the
    /// partition afterwards unless memory is exceeded.
    pub fn spill_partition(&mut self, partition_id: usize) -> Result<()> {
        if self.immediate_flush {
            let grow = !self.context.memory_exceeded();
            return self.flush_partition(partition_id, true, grow);
        }
        let count = self.partitions[partition_id].items;
        if count == 0 {
            return Ok(());
        }

        let partition = &mut self.partitions[partition_id];
        let mut writer = partition.file.writer();
        if matches!(self.sentinel, Some((_, owner)) if owner == partition_id) {
            if let Some((item, _)) = self.sentinel.take() {
                writer.put(&item)?;
            }
        }
        for slot in partition.slots.iter_mut() {
            if let Some(item) = slot.take() {
                writer.put(&item)?;
            }
        }
        writer.close()?;
        drop(writer);

        partition.items = 0;
        self.num_items -= count;
        debug_assert_eq!(self.num_items, self.count_items());
        self.context.log(ReduceAction::Spill, partition_id, count);
        Ok(())
    }

    /// Spills the partition holding the most items, if any holds some.
    pub fn spill_largest_partition(&mut self) -> Result<()> {
        let largest = self
            .partitions
            .iter()
            .enumerate()
            .max_by_key(|(_, partition)| partition.items)
            .filter(|(_, partition)| partition.items > 0)
            .map(|(id, _)| id);
        match largest {
            Some(partition_id) => self.spill_partition(partition_id),
            None => Ok(()),
        }
    }

    /// Spills every partition.
    pub fn spill_all_partitions(&mut self) -> Result<()> {
        (0 .. self.partitions.len()).try_for_each(|partition_id| self.spill_partition(partition_id))
    }

    /// Passes every item of a partition, and the sentinel if the partition owns it, to `emit`.
    ///
    /// With `consume`, the emitted items are removed. With `grow`, the partition grows afterwards.
    pub fn flush_partition_emit<F>(&mut self, partition_id: usize, consume: bool, grow: bool, mut emit: F) -> Result<()>
    where
        F: FnMut(usize, &(K, V)) -> Result<()>,
    {
        let count = self.partitions[partition_id].items;
        Self::emit_partition(&mut self.partitions[partition_id], &mut self.sentinel, partition_id, consume, &mut emit)?;
        self.finish_flush(partition_id, count, consume, grow)
    }

    /// Passes every item of a partition to the table's emitter.
    pub fn flush_partition(&mut self, partition_id: usize, consume: bool, grow: bool) -> Result<()> {
        let count = self.partitions[partition_id].items;
        let emitter = &mut self.emitter;
        let mut emit = |partition: usize, item: &(K, V)| emitter.emit(partition, item);
        Self::emit_partition(&mut self.partitions[partition_id], &mut self.sentinel, partition_id, consume, &mut emit)?;
        self.finish_flush(partition_id, count, consume, grow)
    }

    fn emit_partition<F>(
        partition: &mut Partition<K, V>,
        sentinel: &mut Option<((K, V), usize)>,
        partition_id: usize,
        consume: bool,
        emit: &mut F,
    ) -> Result<()>
    where
        F: FnMut(usize, &(K, V)) -> Result<()>,
    {
        if let Some((item, owner)) = sentinel {
            if *owner == partition_id {
                emit(partition_id, &*item)?;
                if consume {
                    *sentinel = None;
                }
            }
        }
        for slot in partition.slots.iter_mut() {
            if let Some(item) = slot {
                emit(partition_id, &*item)?;
                if consume {
                    *slot = None;
                }
            }
        }
        Ok(())
    }

    fn finish_flush(&mut self, partition_id: usize, count: usize, consume: bool, grow: bool) -> Result<()> {
        if consume {
            self.partitions[partition_id].items = 0;
            self.num_items -= count;
            debug_assert_eq!(self.num_items, self.count_items());
        }
        self.context.log(ReduceAction::Flush, partition_id, count);
        if grow {
            self.grow_partition(partition_id)?;
        }
        Ok(())
    }

    /// Flushes and empties every partition through the table's emitter.
    pub fn flush_all(&mut self) -> Result<()> {
        (0 .. self.partitions.len()).try_for_each(|partition_id| self.flush_partition(partition_id, true, false))
    }

    /// Releases the buckets; spilled files are kept.
    pub fn dispose(&mut self) {
        for partition in self.partitions.iter_mut() {
            partition.slots = Vec::new();
            partition.items = 0;
            partition.limit_items = 0;
        }
        self.sentinel = None;
        self.num_items = 0;
        if let Some(tracker) = &self.context.tracker {
            tracker.sub(self.tracked_bytes);
        }
        self.tracked_bytes = 0;
    }

    fn count_items(&self) -> usize {
        let occupied: usize = self
            .partitions
            .iter()
            .map(|partition| partition.slots.iter().filter(|slot| slot.is_some()).count())
            .sum();
        occupied + usize::from(self.sentinel.is_some())
    }

    /// True if any partition has spilled items to its file.
    pub fn has_spilled_data(&self) -> bool {
        self.partitions.iter().any(|partition| !partition.file.is_empty())
    }

    /// The spill file of a partition.
    pub fn partition_file(&self, partition_id: usize) -> &File {
        &self.partitions[partition_id].file
    }

    /// Takes the spill file of a partition, leaving an empty one.
    pub fn take_partition_file(&mut self, partition_id: usize) -> File {
        let empty = self.context.new_file();
        std::mem::replace(&mut self.partitions[partition_id].file, empty)
    }

    /// Items in the table.
    pub fn num_items(&self) -> usize { self.num_items }

    /// Items in a partition.
    pub fn items_per_partition(&self, partition_id: usize) -> usize { self.partitions[partition_id].items }

    /// Current bucket count of a partition.
    pub fn partition_size(&self, partition_id: usize) -> usize { self.partitions[partition_id].slots.len() }

    /// Item count at which a partition grows or spills.
    pub fn limit_items_per_partition(&self, partition_id: usize) -> usize { self.partitions[partition_id].limit_items }

    /// Number of partitions.
    pub fn num_partitions(&self) -> usize { self.partitions.len() }

    /// Upper bound of a partition's bucket count.
    pub fn num_buckets_per_partition(&self) -> usize { self.num_buckets_per_partition }

    /// The memory limit the table was sized for.
    pub fn limit_memory_bytes(&self) -> usize { self.limit_memory_bytes }

    /// The index function.
    pub fn index_function(&self) -> &I { &self.index_function }

    /// The reduce function.
    pub fn reduce_function(&self) -> &R { &self.reduce }

    /// The resources the table runs with.
    pub fn context(&self) -> &TableContext { &self.context }

    /// The emitter.
    pub fn emitter(&self) -> &E { &self.emitter }

    /// The emitter, mutably.
    pub fn emitter_mut(&mut self) -> &mut E { &mut self.emitter }
}

/// Item count at which a partition of `size` buckets grows or spills.
///
/// Partitions of two or more buckets hold at least one item after every insert, whatever the
/// fill rate, which is what lets re-reduction rounds make progress.
fn limit_items(size: usize, fill_rate: f64) -> usize {
    ((size as f64 * fill_rate) as usize).max(size.min(2))
}

impl<K, V, R, I, E> Drop for ReduceProbingHashTable<K, V, R, I, E> {
    fn drop(&mut self) {
        if let Some(tracker) = &self.context.tracker {
            tracker.sub(self.tracked_bytes);
        }
    }
}

impl<K: Debug, V: Debug, R, I, E> Debug for ReduceProbingHashTable<K, V, R, I, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReduceProbingHashTable")
            .field("partitions", &self.partitions.len())
            .field("items", &self.num_items)
            .field("buckets_per_partition", &self.num_buckets_per_partition)
            .field("sentinel", &self.sentinel)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use crate::config::ReduceConfig;
    use crate::core::index_function::ReduceByHash;
    use crate::data::BlockPool;
    use crate::memory::MemoryTracker;

    use super::*;

    fn tracked_context(config: ReduceConfig, tracker: &Arc<MemoryTracker>) -> TableContext {
        TableContext { tracker: Some(Arc::clone(tracker)), ..context(config) }
    }

    fn context(config: ReduceConfig) -> TableContext {
        TableContext {
            pool: Arc::new(BlockPool::unlimited(1)),
            local_worker: 0,
            dia_id: 0,
            block_size: 256,
            tracker: None,
            logger: None,
            config,
        }
    }

    fn small_config() -> ReduceConfig {
        ReduceConfig { initial_items_per_partition: 2, ..Default::default() }
    }

    type Sum = fn(&u64, &u64) -> u64;

    fn sum(a: &u64, b: &u64) -> u64 { a + b }

    fn collect(table: &mut ReduceProbingHashTable<u64, u64, Sum, ReduceByHash, ()>) -> HashMap<u64, u64> {
        let mut out = HashMap::new();
        for partition in 0 .. table.num_partitions() {
            table
                .flush_partition_emit(partition, true, false, |_, (k, v)| {
                    assert!(out.insert(*k, *v).is_none(), "key {} emitted twice", k);
                    Ok(())
                })
                .unwrap();
            let mut reader = table.partition_file(partition).reader();
            while reader.has_next().unwrap() {
                let (k, v): (u64, u64) = reader.next().unwrap();
                *out.entry(k).or_insert(0) += v;
            }
        }
        out
    }

    #[test]
    fn growth_keeps_every_key() {
        let bytes = 4 * 2048 * std::mem::size_of::<Option<(u64, u64)>>();
        let mut table = ReduceProbingHashTable::new(context(small_config()), 4, bytes, false, ReduceByHash::new(0), sum as Sum, ());
        for key in 1 .. 2000u64 {
            assert!(table.insert((key, key)).unwrap());
            assert!(!table.insert((key, 1)).unwrap());
        }
        assert!(!table.has_spilled_data());
        assert_eq!(table.num_items(), 1999);
        assert!((0 .. 4).all(|p| table.partition_size(p) > 2));
        let out = collect(&mut table);
        assert_eq!(out.len(), 1999);
        assert!(out.iter().all(|(k, v)| *v == k + 1));
        assert_eq!(table.num_items(), 0);
    }

    #[test]
    fn full_partitions_spill() {
        let mut table = ReduceProbingHashTable::new(context(small_config()), 2, 2 * 8 * std::mem::size_of::<Option<(u64, u64)>>(), false, ReduceByHash::new(0), sum as Sum, ());
        assert_eq!(table.num_buckets_per_partition(), 8);
        for round in 0 .. 3u64 {
            for key in 1 .. 100u64 {
                table.insert((key, round)).unwrap();
            }
        }
        assert!(table.has_spilled_data());
        let out = collect(&mut table);
        assert_eq!(out.len(), 99);
        assert!(out.values().all(|&v| v == 3));
    }

    #[test]
    fn default_key_lives_in_the_sentinel() {
        let mut table = ReduceProbingHashTable::new(context(small_config()), 3, 1 << 16, false, ReduceByHash::new(0), sum as Sum, ());
        assert!(table.insert((0, 5)).unwrap());
        assert!(!table.insert((0, 7)).unwrap());
        table.insert((9, 1)).unwrap();
        assert_eq!(table.num_items(), 2);
        let out = collect(&mut table);
        assert_eq!(out.get(&0), Some(&12));
        assert_eq!(out.get(&9), Some(&1));
    }

    #[test]
    fn immediate_flush_feeds_the_emitter() {
        let mut emitted = Vec::new();
        {
            let emitter = |partition: usize, item: &(u64, u64)| -> Result<()> {
                emitted.push((partition, *item));
                Ok(())
            };
            let mut table = ReduceProbingHashTable::new(context(small_config()), 2, 2 * 4 * 16, true, ReduceByHash::new(0), sum as Sum, emitter);
            for key in 0 .. 50u64 {
                table.insert((key, 1)).unwrap();
            }
            table.flush_all().unwrap();
            assert!(!table.has_spilled_data());
            assert_eq!(table.num_items(), 0);
        }
        let mut totals = HashMap::new();
        for (partition, (key, value)) in emitted {
            assert_eq!(ReduceByHash::new(0).index(&key, 2).partition_id, partition);
            *totals.entry(key).or_insert(0) += value;
        }
        assert_eq!(totals.len(), 50);
        assert!(totals.values().all(|&v| v == 1));
    }

    #[test]
    fn spill_largest_picks_the_fullest() {
        let mut table = ReduceProbingHashTable::new(context(ReduceConfig::default()), 2, 1 << 20, false, ReduceByHash::new(0), sum as Sum, ());
        let index = ReduceByHash::new(0);
        let mut keys = (1u64 ..).filter(|k| index.index(k, 2).partition_id == 1);
        for key in keys.by_ref().take(5) {
            table.insert((key, 1)).unwrap();
        }
        let other = (1u64 ..).find(|k| index.index(k, 2).partition_id == 0).unwrap();
        table.insert((other, 1)).unwrap();
        table.spill_largest_partition().unwrap();
        assert_eq!(table.partition_file(1).num_items(), 5);
        assert!(table.partition_file(0).is_empty());
        assert_eq!(table.num_items(), 1);
        table.spill_all_partitions().unwrap();
        assert_eq!(table.num_items(), 0);
        assert_eq!(table.partition_file(0).num_items(), 1);
    }

    const SLOT: usize = std::mem::size_of::<Option<(u64, u64)>>();

    #[test]
    fn exceeded_memory_turns_growth_into_spills() {
        // the initial buckets alone are over the limit
        let tracker = MemoryTracker::new(0);
        let mut table = ReduceProbingHashTable::new(tracked_context(small_config(), &tracker), 4, 1 << 20, false, ReduceByHash::new(0), sum as Sum, ());
        assert!(tracker.memory_exceeded());
        for key in 1 .. 200u64 {
            table.insert((key, 2)).unwrap();
        }
        assert!((0 .. 4).all(|p| table.partition_size(p) == 2));
        assert!(table.has_spilled_data());
        let out = collect(&mut table);
        assert_eq!(out.len(), 199);
        assert!(out.values().all(|&v| v == 2));

        assert_eq!(tracker.current(), 4 * 2 * SLOT);
        drop(table);
        assert_eq!(tracker.current(), 0);
    }

    #[test]
    fn immediate_flush_stops_growing_once_memory_is_exceeded() {
        // room for the initial buckets and nothing more: the first growth exceeds the limit
        let tracker = MemoryTracker::new(2 * 2 * SLOT);
        let mut emitted = HashMap::new();
        {
            let emitter = |_: usize, &(key, value): &(u64, u64)| -> Result<()> {
                *emitted.entry(key).or_insert(0) += value;
                Ok(())
            };
            let mut table = ReduceProbingHashTable::new(tracked_context(small_config(), &tracker), 2, 1 << 20, true, ReduceByHash::new(0), sum as Sum, emitter);
            for key in 1 .. 300u64 {
                table.insert((key, 1)).unwrap();
            }
            assert!(tracker.memory_exceeded());
            assert_eq!(table.partition_size(0) + table.partition_size(1), 2 + 4);
            assert!(!table.has_spilled_data());
            table.flush_all().unwrap();
        }
        assert_eq!(tracker.current(), 0);
        assert_eq!(emitted.len(), 299);
        assert!(emitted.values().all(|&v| v == 1));
    }
}
