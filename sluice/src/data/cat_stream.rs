//! Streams whose readers see the items of all senders in sender rank order.

use std::sync::Arc;

use crate::data::block_queue::{BlockQueueReceiver, CatBlockSource};
use crate::data::block_reader::BlockReader;
use crate::data::multiplexer::Multiplexer;
use crate::data::stream::{StreamCore, StreamId, StreamWriters};
use crate::logging::Traffic;
use crate::{Error, Result};

/// Reads a cat stream: all items of worker 0, then all of worker 1, and so on.
pub type CatReader = BlockReader<CatBlockSource>;

/// An all-to-all exchange delivering each receiver's items ordered by sender.
///
/// Every worker creates the stream in the same order relative to its other streams, takes
/// writers towards all workers, and reads what the others wrote to it.
pub struct CatStream {
    core: StreamCore,
    queues: Option<Vec<BlockQueueReceiver>>,
}

impl CatStream {
    pub(crate) fn new(mux: Arc<Multiplexer>, stream_id: StreamId, local_worker: usize, queues: Vec<BlockQueueReceiver>) -> Self {
        CatStream { core: StreamCore::new(mux, stream_id, local_worker, false), queues: Some(queues) }
    }

    /// The stream id.
    pub fn id(&self) -> StreamId { self.core.id() }

    /// Writers towards every worker, indexed by global rank.
    pub fn get_writers(&mut self, block_size: usize) -> StreamWriters {
        self.core.writers(block_size)
    }

    /// The reader of this worker's items. Can be taken once.
    pub fn get_reader(&mut self) -> Result<CatReader> {
        let queues = self
            .queues
            .take()
            .ok_or_else(|| Error::Format(format!("reader of cat stream {} taken twice", self.core.id())))?;
        let source = CatBlockSource::new(queues, self.core.local_worker(), self.core.id(), Arc::clone(self.core.stats()));
        Ok(BlockReader::new(source))
    }

    /// Totals written by this worker.
    pub fn tx(&self) -> Traffic { self.core.stats().tx() }

    /// Totals read by this worker.
    pub fn rx(&self) -> Traffic { self.core.stats().rx() }
}
