//! The sending side of streams, and what cat and mix streams have in common.

use std::ops::{Index, IndexMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::bytes::arc::Bytes;
use crate::communication::Error as CommError;
use crate::data::block::{Block, PinnedBlock};
use crate::data::block_pool::BlockPool;
use crate::data::block_writer::{BlockSink, BlockWriter};
use crate::data::multiplexer::{MuxShared, Multiplexer};
use crate::data::multiplexer_header::{MagicByte, StreamBlockHeader};
use crate::logging::{SluiceEvent, SluiceLogger, StreamAction, StreamEvent, Traffic};
use crate::{Error, Result};

/// Identifies a stream; equal on all workers that take part in it.
pub type StreamId = usize;

/// Counters of one stream on one worker.
pub struct StreamStats {
    stream_id: StreamId,
    mix: bool,
    tx_items: AtomicUsize,
    tx_bytes: AtomicUsize,
    tx_blocks: AtomicUsize,
    rx_items: AtomicUsize,
    rx_bytes: AtomicUsize,
    rx_blocks: AtomicUsize,
    logger: Option<SluiceLogger>,
}

impl StreamStats {
    pub(crate) fn new(stream_id: StreamId, mix: bool, logger: Option<SluiceLogger>) -> Self {
        StreamStats {
            stream_id,
            mix,
            tx_items: AtomicUsize::new(0),
            tx_bytes: AtomicUsize::new(0),
            tx_blocks: AtomicUsize::new(0),
            rx_items: AtomicUsize::new(0),
            rx_bytes: AtomicUsize::new(0),
            rx_blocks: AtomicUsize::new(0),
            logger,
        }
    }

    fn log(&self, action: StreamAction) {
        if let Some(logger) = &self.logger {
            logger.log(StreamEvent { stream_id: self.stream_id, mix: self.mix, action });
        }
    }

    fn log_text(&self, text: String) {
        if let Some(logger) = &self.logger {
            logger.log(SluiceEvent::Text(text));
        }
    }

    fn sent(&self, peer: usize, block: &Block) {
        self.tx_items.fetch_add(block.num_items(), Ordering::Relaxed);
        self.tx_bytes.fetch_add(block.size(), Ordering::Relaxed);
        self.tx_blocks.fetch_add(1, Ordering::Relaxed);
        self.log(StreamAction::Sent { peer, bytes: block.size() });
    }

    pub(crate) fn received(&self, block: &Block) {
        self.rx_items.fetch_add(block.num_items(), Ordering::Relaxed);
        self.rx_bytes.fetch_add(block.size(), Ordering::Relaxed);
        self.rx_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn sender_closed(&self, peer: usize) {
        self.log(StreamAction::SenderClosed { peer });
    }

    /// Totals written by this worker.
    pub fn tx(&self) -> Traffic {
        Traffic {
            items: self.tx_items.load(Ordering::Relaxed),
            bytes: self.tx_bytes.load(Ordering::Relaxed),
            blocks: self.tx_blocks.load(Ordering::Relaxed),
        }
    }

    /// Totals read by this worker.
    pub fn rx(&self) -> Traffic {
        Traffic {
            items: self.rx_items.load(Ordering::Relaxed),
            bytes: self.rx_bytes.load(Ordering::Relaxed),
            blocks: self.rx_blocks.load(Ordering::Relaxed),
        }
    }
}

/// Where a stream sink's blocks go.
enum SinkTarget {
    /// A worker on this host: straight into its queue.
    Loopback(Arc<MuxShared>),
    /// A worker on another host, through the link to that host.
    Network { sender: Sender<Bytes>, host: usize },
}

/// Sends the blocks of one writer to one receiving worker.
pub struct StreamSink {
    target: SinkTarget,
    pool: Arc<BlockPool>,
    header: StreamBlockHeader,
    peer: usize,
    local_worker: usize,
    closed: bool,
    stats: Arc<StreamStats>,
}

impl StreamSink {
    fn send(&mut self, header: StreamBlockHeader, block: Option<PinnedBlock>) -> Result<()> {
        match &self.target {
            SinkTarget::Loopback(shared) => shared.deliver(header, block.map(PinnedBlock::into_block)),
            SinkTarget::Network { sender, host } => {
                // one message per block: the link's sender is shared by all workers of the host
                let mut message = header.to_bytes();
                if let Some(block) = block {
                    message.extend_from_slice(block.data());
                }
                sender.send(Bytes::from(message)).map_err(|_| CommError::Disconnected { peer: *host })?;
                Ok(())
            },
        }
    }

    /// Global rank of the receiving worker.
    pub fn peer(&self) -> usize { self.peer }

    /// True once the close signal was sent.
    pub fn is_closed(&self) -> bool { self.closed }
}

impl BlockSink for StreamSink {
    fn block_pool(&self) -> &Arc<BlockPool> { &self.pool }

    fn local_worker_id(&self) -> usize { self.local_worker }

    fn append_block(&mut self, block: PinnedBlock, is_last: bool) -> Result<()> {
        debug_assert!(!self.closed, "block after close");
        let header = StreamBlockHeader {
            is_last,
            size: block.size(),
            first_item: block.first_item_relative(),
            num_items: block.num_items(),
            ..self.header
        };
        self.header.seq += 1;
        self.stats.sent(self.peer, block.block());
        self.closed = is_last;
        self.send(header, Some(block))
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let header = StreamBlockHeader { is_last: true, size: 0, first_item: 0, num_items: 0, ..self.header };
        self.header.seq += 1;
        self.send(header, None)
    }

    fn close_failed(&self, error: &Error) {
        self.stats.log_text(format!("stream {} failed to close towards worker {}: {}", self.stats.stream_id, self.peer, error));
    }
}

/// One writer per worker of the computation, indexed by global rank.
///
/// Closing closes the writers cyclically, starting after this worker's own rank, so close
/// signals do not all reach worker 0 first. Dropping closes as well.
pub struct StreamWriters {
    writers: Vec<BlockWriter<StreamSink>>,
    my_rank: usize,
}

impl StreamWriters {
    /// Number of writers.
    pub fn len(&self) -> usize { self.writers.len() }

    /// True if there are no writers.
    pub fn is_empty(&self) -> bool { self.writers.is_empty() }

    /// Flushes the current block of every writer.
    pub fn flush(&mut self) -> Result<()> {
        self.writers.iter_mut().try_for_each(|writer| writer.flush())
    }

    /// Closes all writers.
    pub fn close(&mut self) -> Result<()> {
        let count = self.writers.len();
        for offset in 1 ..= count {
            self.writers[(self.my_rank + offset) % count].close()?;
        }
        Ok(())
    }
}

impl Index<usize> for StreamWriters {
    type Output = BlockWriter<StreamSink>;
    fn index(&self, index: usize) -> &Self::Output { &self.writers[index] }
}

impl IndexMut<usize> for StreamWriters {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output { &mut self.writers[index] }
}

impl Drop for StreamWriters {
    fn drop(&mut self) {
        let count = self.writers.len();
        for offset in 1 ..= count {
            let writer = &mut self.writers[(self.my_rank + offset) % count];
            if let Err(error) = writer.close() {
                writer.sink().close_failed(&error);
            }
        }
    }
}

/// State shared by cat and mix streams: identity, statistics, and registration.
pub(crate) struct StreamCore {
    mux: Arc<Multiplexer>,
    stream_id: StreamId,
    local_worker: usize,
    mix: bool,
    stats: Arc<StreamStats>,
    writers_taken: bool,
}

impl StreamCore {
    pub(crate) fn new(mux: Arc<Multiplexer>, stream_id: StreamId, local_worker: usize, mix: bool) -> Self {
        let stats = Arc::new(StreamStats::new(stream_id, mix, mux.logger()));
        StreamCore { mux, stream_id, local_worker, mix, stats, writers_taken: false }
    }

    pub(crate) fn id(&self) -> StreamId { self.stream_id }

    pub(crate) fn local_worker(&self) -> usize { self.local_worker }

    pub(crate) fn stats(&self) -> &Arc<StreamStats> { &self.stats }

    pub(crate) fn num_workers(&self) -> usize { self.mux.num_workers() }

    pub(crate) fn my_rank(&self) -> usize {
        self.mux.host_rank() * self.mux.workers_per_host() + self.local_worker
    }

    /// Writers towards every worker, each producing blocks of `block_size` bytes.
    pub(crate) fn writers(&mut self, block_size: usize) -> StreamWriters {
        debug_assert!(!self.writers_taken, "stream writers requested twice");
        self.writers_taken = true;
        let workers_per_host = self.mux.workers_per_host();
        let my_rank = self.my_rank();
        let writers = (0 .. self.mux.num_workers())
            .map(|peer| {
                let host = peer / workers_per_host;
                let target = match self.mux.sender(host) {
                    Some(sender) => SinkTarget::Network { sender, host },
                    None => SinkTarget::Loopback(self.mux.shared()),
                };
                let sink = StreamSink {
                    target,
                    pool: Arc::clone(self.mux.block_pool()),
                    header: StreamBlockHeader {
                        magic: MagicByte::for_stream(self.mix),
                        stream_id: self.stream_id,
                        sender_worker: my_rank,
                        receiver_local_worker: peer % workers_per_host,
                        seq: 0,
                        is_last: false,
                        size: 0,
                        first_item: 0,
                        num_items: 0,
                    },
                    peer,
                    local_worker: self.local_worker,
                    closed: false,
                    stats: Arc::clone(&self.stats),
                };
                BlockWriter::new(sink, block_size)
            })
            .collect();
        StreamWriters { writers, my_rank }
    }
}

impl Drop for StreamCore {
    fn drop(&mut self) {
        self.mux.shared().release(self.stream_id, self.local_worker);
        self.stats.log(StreamAction::Closed { tx: self.stats.tx(), rx: self.stats.rx() });
    }
}
