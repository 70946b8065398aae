//! The sending side of a reduction: combine locally, then route each key to its worker.

use serde::Serialize;

use crate::core::index_function::{IndexFunction, ReduceByHash};
use crate::core::reduce_probing_hash_table::ReduceProbingHashTable;
use crate::core::reduce_table::{Emitter, TableContext};
use crate::data::StreamWriters;
use crate::Result;

/// Writes each flushed item to the worker its partition stands for.
pub struct StreamEmitter {
    writers: StreamWriters,
    emitted: usize,
}

impl StreamEmitter {
    /// An emitter over writers towards every worker.
    pub fn new(writers: StreamWriters) -> Self {
        StreamEmitter { writers, emitted: 0 }
    }

    /// Items written so far.
    pub fn emitted(&self) -> usize { self.emitted }

    /// Closes all writers.
    pub fn close(&mut self) -> Result<()> { self.writers.close() }
}

impl<K: Serialize, V: Serialize> Emitter<K, V> for StreamEmitter {
    fn emit(&mut self, partition_id: usize, item: &(K, V)) -> Result<()> {
        self.emitted += 1;
        self.writers[partition_id].put(item)
    }
}

/// Pre-aggregates a worker's items before the exchange.
///
/// The table has one partition per worker and flushes full partitions straight to the
/// network, so nothing is spilled on this side.
pub struct ReducePrePhase<K, V, R, I = ReduceByHash> {
    table: ReduceProbingHashTable<K, V, R, I, StreamEmitter>,
}

impl<K, V, R, I> ReducePrePhase<K, V, R, I>
where
    K: Eq + Default + Serialize,
    V: Serialize,
    R: Fn(&V, &V) -> V,
    I: IndexFunction<K>,
{
    /// A pre phase routing partition `p` to `writers[p]`.
    pub fn new(context: TableContext, writers: StreamWriters, limit_memory_bytes: usize, index_function: I, reduce: R) -> Self {
        let num_partitions = writers.len();
        let table = ReduceProbingHashTable::new(
            context,
            num_partitions,
            limit_memory_bytes,
            true,
            index_function,
            reduce,
            StreamEmitter::new(writers),
        );
        ReducePrePhase { table }
    }

    /// Inserts an item; returns `true` if its key was new to the table.
    pub fn insert(&mut self, item: (K, V)) -> Result<bool> {
        self.table.insert(item)
    }

    /// Sends everything left in the table, then closes all writers.
    pub fn flush_and_close(&mut self) -> Result<()> {
        self.table.flush_all()?;
        self.table.emitter_mut().close()
    }

    /// Items sent so far.
    pub fn emitted(&self) -> usize {
        self.table.emitter().emitted()
    }

    /// The table, for inspection.
    pub fn table(&mut self) -> &mut ReduceProbingHashTable<K, V, R, I, StreamEmitter> { &mut self.table }

    /// Releases the table's buckets.
    pub fn dispose(&mut self) { self.table.dispose() }
}
