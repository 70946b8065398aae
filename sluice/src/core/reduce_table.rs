//! What reduce tables and their phases share: where output goes and what a table needs to run.

use std::sync::Arc;

use crate::config::ReduceConfig;
use crate::data::{BlockPool, File};
use crate::logging::{ReduceAction, ReduceEvent, SluiceLogger};
use crate::memory::MemoryTracker;
use crate::Result;

/// Receives the items a table flushes, tagged with their partition.
pub trait Emitter<K, V> {
    /// Takes one item of partition `partition_id`.
    fn emit(&mut self, partition_id: usize, item: &(K, V)) -> Result<()>;
}

impl<K, V, F: FnMut(usize, &(K, V)) -> Result<()>> Emitter<K, V> for F {
    fn emit(&mut self, partition_id: usize, item: &(K, V)) -> Result<()> {
        self(partition_id, item)
    }
}

/// The emitter of tables that never flush on their own.
///
/// Tables without `immediate_flush` only hand out items through
/// [`flush_partition_emit`](super::ReduceProbingHashTable::flush_partition_emit); items reaching
/// this emitter through `flush_all` are dropped.
impl<K, V> Emitter<K, V> for () {
    fn emit(&mut self, _partition_id: usize, _item: &(K, V)) -> Result<()> { Ok(()) }
}

/// Resources of the worker a table runs on.
#[derive(Clone)]
pub struct TableContext {
    /// Pool of the spill files' blocks.
    pub pool: Arc<BlockPool>,
    /// The worker owning the table.
    pub local_worker: usize,
    /// Id of the operator the table belongs to; tags its files.
    pub dia_id: usize,
    /// Block size of spill files.
    pub block_size: usize,
    /// Account the table's buckets are charged to.
    pub tracker: Option<Arc<MemoryTracker>>,
    /// Destination of grow, spill and flush events.
    pub logger: Option<SluiceLogger>,
    /// Table tuning.
    pub config: ReduceConfig,
}

impl TableContext {
    /// An empty file for spilled or cached items.
    pub fn new_file(&self) -> File {
        File::new(Arc::clone(&self.pool), self.local_worker, self.dia_id, self.block_size)
    }

    pub(crate) fn memory_exceeded(&self) -> bool {
        self.tracker.as_ref().is_some_and(|tracker| tracker.memory_exceeded())
    }

    pub(crate) fn log(&self, action: ReduceAction, partition: usize, items: usize) {
        if let Some(logger) = &self.logger {
            logger.log(ReduceEvent { action, partition, items });
        }
    }
}
