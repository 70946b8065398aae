//! Queues of blocks arriving on a stream, and the block sources readers pull from them.

use std::collections::VecDeque;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use crate::data::block::{Block, PinnedBlock};
use crate::data::block_reader::BlockSource;
use crate::data::stream::StreamStats;
use crate::{Error, Result};

/// What a sender delivers to a receiving worker.
#[derive(Debug)]
pub enum QueueItem {
    /// A block of items.
    Block(Block),
    /// The sender has closed its side.
    Close,
    /// The sender's host is gone without closing.
    Abort(String),
}

/// A queue item together with the global rank of its sender.
pub type Delivery = (usize, QueueItem);

/// The sending half of a block queue.
pub type BlockQueueSender = Sender<Delivery>;

/// The receiving half of a block queue.
pub type BlockQueueReceiver = Receiver<Delivery>;

/// A new block queue.
pub fn block_queue() -> (BlockQueueSender, BlockQueueReceiver) {
    crossbeam_channel::unbounded()
}

/// Pulls the blocks of all senders of a cat stream, one sender after another in rank order.
pub struct CatBlockSource {
    queues: Vec<BlockQueueReceiver>,
    current: usize,
    local_worker: usize,
    stream_id: usize,
    stats: Arc<StreamStats>,
}

impl CatBlockSource {
    /// A source over one queue per sender.
    pub(crate) fn new(queues: Vec<BlockQueueReceiver>, local_worker: usize, stream_id: usize, stats: Arc<StreamStats>) -> Self {
        CatBlockSource { queues, current: 0, local_worker, stream_id, stats }
    }
}

impl BlockSource for CatBlockSource {
    fn next_block(&mut self) -> Result<Option<PinnedBlock>> {
        while let Some(queue) = self.queues.get(self.current) {
            match queue.recv() {
                Ok((_, QueueItem::Block(block))) => {
                    self.stats.received(&block);
                    return block.pin(self.local_worker).map(Some);
                },
                Ok((sender, QueueItem::Close)) => {
                    self.stats.sender_closed(sender);
                    self.current += 1;
                },
                Ok((_, QueueItem::Abort(reason))) => {
                    return Err(Error::StreamAborted { stream_id: self.stream_id, reason });
                },
                Err(_) => {
                    return Err(Error::StreamAborted { stream_id: self.stream_id, reason: "block queue dropped".to_owned() });
                },
            }
        }
        Ok(None)
    }
}

/// Blocks of one sender that have arrived but not been read.
#[derive(Default)]
pub struct BufferedBlocks {
    blocks: VecDeque<Block>,
    local_worker: usize,
}

impl BufferedBlocks {
    /// An empty buffer whose blocks are pinned for `local_worker`.
    pub fn new(local_worker: usize) -> Self {
        BufferedBlocks { blocks: VecDeque::new(), local_worker }
    }

    /// Adds an arrived block.
    pub fn push(&mut self, block: Block) {
        self.blocks.push_back(block);
    }

    /// Number of buffered blocks.
    pub fn len(&self) -> usize { self.blocks.len() }

    /// True if no block is buffered.
    pub fn is_empty(&self) -> bool { self.blocks.is_empty() }
}

impl BlockSource for BufferedBlocks {
    fn next_block(&mut self) -> Result<Option<PinnedBlock>> {
        self.blocks.pop_front().map(|block| block.pin(self.local_worker)).transpose()
    }
}
