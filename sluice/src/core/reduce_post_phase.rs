//! The receiving side of a reduction: combine everything that arrived, re-reducing spilled
//! partitions in rounds until all of them fit.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::index_function::{IndexFunction, ReduceByHash};
use crate::core::reduce_probing_hash_table::ReduceProbingHashTable;
use crate::core::reduce_table::TableContext;
use crate::data::{File, FileWriter};
use crate::logging::ReduceAction;
use crate::{Error, Result};

type PostTable<K, V, R, I> = ReduceProbingHashTable<K, V, R, I, ()>;

/// Consecutive re-reduction rounds without progress after which a flush gives up.
const MAX_STALLED_ROUNDS: usize = 16;

/// Size of the spilled data still to be re-reduced.
struct Progress {
    total: usize,
    largest: usize,
}

impl Progress {
    fn of(files: &[File]) -> Self {
        Progress {
            total: files.iter().map(File::num_items).sum(),
            largest: files.iter().map(File::num_items).max().unwrap_or(0),
        }
    }
}

/// Reduces the items a worker received.
///
/// A partition that never spilled holds fully reduced items and is emitted directly. A
/// partition that spilled is reduced again from its file in a new table whose index function
/// is perturbed by the round number, until no partition spills. Rounds only start once the
/// first table has been emptied, so each holds at most one table's worth of memory.
pub struct ReducePostPhase<K, V, R, I = ReduceByHash> {
    table: PostTable<K, V, R, I>,
    /// The output of a flush that had to consume spilled data, kept for later pushes.
    cache: Option<File>,
    rounds: usize,
}

impl<K, V, R, I> ReducePostPhase<K, V, R, I>
where
    K: Eq + Default + Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
    R: Fn(&V, &V) -> V + Clone,
    I: IndexFunction<K>,
{
    /// A post phase with `context.config.post_partitions` partitions.
    pub fn new(context: TableContext, limit_memory_bytes: usize, index_function: I, reduce: R) -> Self {
        let num_partitions = context.config.post_partitions.max(1);
        let table = ReduceProbingHashTable::new(context, num_partitions, limit_memory_bytes, false, index_function, reduce, ());
        ReducePostPhase { table, cache: None, rounds: 0 }
    }

    /// Inserts a received item; returns `true` if its key was new to the table.
    pub fn insert(&mut self, item: (K, V)) -> Result<bool> {
        self.table.insert(item)
    }

    /// Passes every reduced item to `emit`.
    ///
    /// Without spilled data, the items come from memory and stay there unless `consume` is
    /// set. With spilled data, the table is consumed and the output is cached, so that a
    /// later call replays the cache (and releases it if `consume` is set).
    pub fn push_data<F>(&mut self, consume: bool, mut emit: F) -> Result<()>
    where
        F: FnMut(&(K, V)) -> Result<()>,
    {
        if let Some(cache) = &mut self.cache {
            if consume {
                let mut reader = cache.consume_reader();
                while reader.has_next()? {
                    emit(&reader.next()?)?;
                }
                self.cache = None;
            }
            else {
                let mut reader = cache.reader();
                while reader.has_next()? {
                    emit(&reader.next()?)?;
                }
            }
            return Ok(());
        }

        if !self.table.has_spilled_data() {
            return self.flush(consume, None, &mut emit);
        }

        let mut cache = self.table.context().new_file();
        let mut writer = cache.writer();
        self.flush(true, Some(&mut writer), &mut emit)?;
        writer.close()?;
        drop(writer);
        self.cache = Some(cache);
        Ok(())
    }

    fn flush<F>(&mut self, consume: bool, mut writer: Option<&mut FileWriter<'_>>, emit: &mut F) -> Result<()>
    where
        F: FnMut(&(K, V)) -> Result<()>,
    {
        let mut output = |_partition: usize, item: &(K, V)| -> Result<()> {
            if let Some(writer) = writer.as_mut() {
                writer.put(item)?;
            }
            emit(item)
        };

        let mut remaining = Vec::new();
        Self::drain(&mut self.table, consume, &mut remaining, &mut output)?;
        if remaining.is_empty() {
            return Ok(());
        }
        debug_assert!(consume, "flushing spilled data must consume");
        let limit_memory_bytes = self.table.limit_memory_bytes();
        let num_partitions = self.table.num_partitions();
        self.table.dispose();

        let mut iteration = 1;
        let mut progress = Progress::of(&remaining);
        let mut stalled = 0;
        while !remaining.is_empty() {
            self.table.context().log(ReduceAction::Round, iteration, progress.total);
            let mut subtable = ReduceProbingHashTable::new(
                self.table.context().clone(),
                num_partitions,
                limit_memory_bytes,
                false,
                self.table.index_function().for_iteration(iteration),
                self.table.reduce_function().clone(),
                (),
            );
            let mut next_remaining = Vec::new();
            for mut file in remaining {
                let mut reader = file.consume_reader();
                while reader.has_next()? {
                    subtable.insert(reader.next()?)?;
                }
                // keys of different files are disjoint, so the subtable can be emptied per file
                Self::drain(&mut subtable, true, &mut next_remaining, &mut output)?;
            }
            remaining = next_remaining;

            // a round must combine items or split the spilled files into smaller ones
            let next = Progress::of(&remaining);
            if next.total < progress.total || next.largest < progress.largest {
                stalled = 0;
            }
            else {
                stalled += 1;
                if stalled == MAX_STALLED_ROUNDS {
                    return Err(Error::ReduceStalled { rounds: iteration, items: next.total });
                }
            }
            progress = next;
            iteration += 1;
        }
        self.rounds = iteration - 1;
        Ok(())
    }

    /// Emits the partitions of `table` that never spilled, and moves the spilled ones to `remaining`.
    fn drain<F>(table: &mut PostTable<K, V, R, I>, consume: bool, remaining: &mut Vec<File>, output: &mut F) -> Result<()>
    where
        F: FnMut(usize, &(K, V)) -> Result<()>,
    {
        for partition_id in 0 .. table.num_partitions() {
            if table.partition_file(partition_id).is_empty() {
                table.flush_partition_emit(partition_id, consume, false, &mut *output)?;
            }
            else {
                table.spill_partition(partition_id)?;
                remaining.push(table.take_partition_file(partition_id));
            }
        }
        Ok(())
    }

    /// Items in the first table.
    pub fn num_items(&self) -> usize { self.table.num_items() }

    /// Re-reduction rounds the last flush needed.
    pub fn rounds(&self) -> usize { self.rounds }

    /// True once output has been cached.
    pub fn is_cached(&self) -> bool { self.cache.is_some() }

    /// The first table.
    pub fn table(&mut self) -> &mut PostTable<K, V, R, I> { &mut self.table }

    /// Releases the table and the cache.
    pub fn dispose(&mut self) {
        self.table.dispose();
        self.cache = None;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use crate::config::ReduceConfig;
    use crate::data::BlockPool;

    use super::*;

    fn context() -> TableContext {
        context_with_partitions(4)
    }

    fn context_with_partitions(post_partitions: usize) -> TableContext {
        TableContext {
            pool: Arc::new(BlockPool::unlimited(1)),
            local_worker: 0,
            dia_id: 3,
            block_size: 512,
            tracker: None,
            logger: None,
            config: ReduceConfig { initial_items_per_partition: 4, post_partitions, ..Default::default() },
        }
    }

    fn concat(a: &String, b: &String) -> String { format!("{}{}", a, b) }

    #[test]
    fn in_memory_push_can_repeat() {
        let mut phase = ReducePostPhase::new(context(), 1 << 20, ReduceByHash::new(1), concat);
        for (key, value) in [(1u32, "a"), (2, "c"), (1, "b")] {
            phase.insert((key, value.to_string())).unwrap();
        }
        for _ in 0 .. 2 {
            let mut out = Vec::new();
            phase.push_data(false, |item| { out.push(item.clone()); Ok(()) }).unwrap();
            out.sort();
            assert_eq!(out, vec![(1, "ab".to_string()), (2, "c".to_string())]);
        }
        assert!(!phase.is_cached());
    }

    #[test]
    fn spilled_data_is_re_reduced_and_cached() {
        // four partitions of at most sixteen buckets
        let limit = 4 * 16 * std::mem::size_of::<Option<(u64, u64)>>();
        let mut phase = ReducePostPhase::new(context(), limit, ReduceByHash::new(1), |a: &u64, b: &u64| a + b);
        for round in 0 .. 4u64 {
            for key in 0 .. 500u64 {
                phase.insert((key, round + 1)).unwrap();
            }
        }
        assert!(phase.table().has_spilled_data());

        let mut first = HashMap::new();
        phase
            .push_data(false, |&(k, v)| {
                assert!(first.insert(k, v).is_none(), "key {} emitted twice", k);
                Ok(())
            })
            .unwrap();
        assert!(phase.rounds() >= 1);
        assert!(phase.is_cached());
        assert_eq!(first.len(), 500);
        assert!(first.values().all(|&v| v == 10));

        let mut second = HashMap::new();
        phase.push_data(true, |&(k, v)| { second.insert(k, v); Ok(()) }).unwrap();
        assert_eq!(first, second);
        assert!(!phase.is_cached());
    }

    /// Room for two buckets in each of `partitions` partitions.
    fn two_buckets_each(partitions: usize) -> usize {
        partitions * 2 * std::mem::size_of::<Option<(u64, u64)>>()
    }

    #[test]
    fn one_key_fits_the_smallest_table() {
        let mut phase = ReducePostPhase::new(context_with_partitions(2), two_buckets_each(2), ReduceByHash::new(1), |a: &u64, b: &u64| a + b);
        phase.insert((5, 1)).unwrap();
        assert!(!phase.table().has_spilled_data());
        let mut out = Vec::new();
        phase.push_data(true, |item| { out.push(*item); Ok(()) }).unwrap();
        assert_eq!(out, vec![(5, 1)]);
    }

    #[test]
    fn rounds_split_spills_of_tiny_tables() {
        let mut phase = ReducePostPhase::new(context_with_partitions(2), two_buckets_each(2), ReduceByHash::new(1), |a: &u64, b: &u64| a + b);
        for _ in 0 .. 3 {
            for key in 0 .. 64u64 {
                phase.insert((key, 1)).unwrap();
            }
        }
        assert!(phase.table().has_spilled_data());

        let mut out = HashMap::new();
        phase
            .push_data(true, |&(k, v)| {
                assert!(out.insert(k, v).is_none(), "key {} emitted twice", k);
                Ok(())
            })
            .unwrap();
        assert!(phase.rounds() >= 1);
        assert_eq!(out.len(), 64);
        assert!(out.values().all(|&v| v == 3));
    }

    #[test]
    fn rounds_without_progress_fail() {
        // one partition cannot split its spills, and distinct keys never combine
        let mut phase = ReducePostPhase::new(context_with_partitions(1), two_buckets_each(1), ReduceByHash::new(1), |a: &u64, b: &u64| a + b);
        for key in 1 .. 11u64 {
            phase.insert((key, key)).unwrap();
        }
        assert!(phase.table().has_spilled_data());
        let result = phase.push_data(true, |_| Ok(()));
        assert!(matches!(result, Err(Error::ReduceStalled { items: 10, .. })), "{:?}", result);
    }
}
