//! Streams whose readers see items in arrival order.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;

use crate::data::block::PinnedBlock;
use crate::data::block_queue::{BlockQueueReceiver, BufferedBlocks, QueueItem};
use crate::data::block_reader::{BlockReader, BlockSource};
use crate::data::multiplexer::Multiplexer;
use crate::data::stream::{StreamCore, StreamId, StreamStats, StreamWriters};
use crate::logging::Traffic;
use crate::{Error, Result};

/// Arrived blocks, sorted by sender.
struct MixInbox {
    queue: BlockQueueReceiver,
    buffers: Vec<BufferedBlocks>,
    closed: Vec<bool>,
    open: usize,
    stream_id: StreamId,
    stats: Arc<StreamStats>,
}

impl MixInbox {
    /// Waits for one delivery and files it under its sender.
    fn receive(&mut self) -> Result<()> {
        match self.queue.recv() {
            Ok((sender, QueueItem::Block(block))) => {
                self.stats.received(&block);
                self.buffers[sender].push(block);
                Ok(())
            },
            Ok((sender, QueueItem::Close)) => {
                self.stats.sender_closed(sender);
                self.closed[sender] = true;
                self.open -= 1;
                Ok(())
            },
            Ok((_, QueueItem::Abort(reason))) => Err(Error::StreamAborted { stream_id: self.stream_id, reason }),
            Err(_) => Err(Error::StreamAborted { stream_id: self.stream_id, reason: "block queue dropped".to_owned() }),
        }
    }
}

/// The blocks of one sender, waiting on the shared queue when none are buffered.
pub struct MixBlockSource {
    inbox: Arc<Mutex<MixInbox>>,
    sender: usize,
}

impl MixBlockSource {
    fn lock(&self) -> MutexGuard<'_, MixInbox> {
        self.inbox.lock().expect("mix inbox poisoned")
    }
}

impl BlockSource for MixBlockSource {
    fn next_block(&mut self) -> Result<Option<PinnedBlock>> {
        let mut inbox = self.lock();
        loop {
            if !inbox.buffers[self.sender].is_empty() {
                return inbox.buffers[self.sender].next_block();
            }
            if inbox.closed[self.sender] {
                return Ok(None);
            }
            inbox.receive()?;
        }
    }
}

/// Reads a mix stream.
///
/// Items of one sender keep their order. Items of different senders interleave as their
/// blocks arrive.
pub struct MixReader {
    inbox: Arc<Mutex<MixInbox>>,
    readers: Vec<BlockReader<MixBlockSource>>,
    selected: usize,
}

impl MixReader {
    fn lock(&self) -> MutexGuard<'_, MixInbox> {
        self.inbox.lock().expect("mix inbox poisoned")
    }

    /// True if another item can be read, waiting for blocks if necessary.
    pub fn has_next(&mut self) -> Result<bool> {
        let count = self.readers.len();
        loop {
            for offset in 0 .. count {
                let sender = (self.selected + offset) % count;
                if self.readers[sender].has_buffered_item() {
                    self.selected = sender;
                    return Ok(true);
                }
                let buffered = !self.lock().buffers[sender].is_empty();
                if buffered && self.readers[sender].has_next()? {
                    self.selected = sender;
                    return Ok(true);
                }
            }
            let mut inbox = self.lock();
            if inbox.open == 0 && inbox.buffers.iter().all(BufferedBlocks::is_empty) {
                return Ok(false);
            }
            if inbox.open > 0 {
                inbox.receive()?;
            }
        }
    }

    /// Reads the next item.
    pub fn next<T: DeserializeOwned>(&mut self) -> Result<T> {
        if !self.has_next()? {
            return Err(Error::Format("read past the last item".to_owned()));
        }
        self.readers[self.selected].next()
    }

    /// Reads the next item together with the rank of its sender.
    pub fn next_with_source<T: DeserializeOwned>(&mut self) -> Result<(usize, T)> {
        let item = self.next()?;
        Ok((self.selected, item))
    }

    /// Reads all remaining items.
    pub fn read_all<T: DeserializeOwned>(&mut self) -> Result<Vec<T>> {
        let mut items = Vec::new();
        while self.has_next()? {
            items.push(self.next()?);
        }
        Ok(items)
    }
}

/// An all-to-all exchange delivering items in whatever order they arrive.
pub struct MixStream {
    core: StreamCore,
    queue: Option<BlockQueueReceiver>,
}

impl MixStream {
    pub(crate) fn new(mux: Arc<Multiplexer>, stream_id: StreamId, local_worker: usize, queue: BlockQueueReceiver) -> Self {
        MixStream { core: StreamCore::new(mux, stream_id, local_worker, true), queue: Some(queue) }
    }

    /// The stream id.
    pub fn id(&self) -> StreamId { self.core.id() }

    /// Writers towards every worker, indexed by global rank.
    pub fn get_writers(&mut self, block_size: usize) -> StreamWriters {
        self.core.writers(block_size)
    }

    /// The reader of this worker's items. Can be taken once.
    pub fn get_reader(&mut self) -> Result<MixReader> {
        let queue = self
            .queue
            .take()
            .ok_or_else(|| Error::Format(format!("reader of mix stream {} taken twice", self.core.id())))?;
        let local_worker = self.core.local_worker();
        let num_workers = self.core.num_workers();
        let inbox = Arc::new(Mutex::new(MixInbox {
            queue,
            buffers: (0 .. num_workers).map(|_| BufferedBlocks::new(local_worker)).collect(),
            closed: vec![false; num_workers],
            open: num_workers,
            stream_id: self.core.id(),
            stats: Arc::clone(self.core.stats()),
        }));
        let readers = (0 .. num_workers)
            .map(|sender| BlockReader::new(MixBlockSource { inbox: Arc::clone(&inbox), sender }))
            .collect();
        Ok(MixReader { inbox, readers, selected: 0 })
    }

    /// Totals written by this worker.
    pub fn tx(&self) -> Traffic { self.core.stats().tx() }

    /// Totals read by this worker.
    pub fn rx(&self) -> Traffic { self.core.stats().rx() }
}
