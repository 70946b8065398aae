//! Routes the blocks of all streams of a host over its links, and hands out streams.
//!
//! Each host holds one multiplexer. Blocks for workers on the same host are delivered
//! directly into the receiving worker's queues. Blocks for other hosts travel over the link to
//! that host as single messages, a [`StreamBlockHeader`] followed by the block bytes, so that
//! workers sharing a link cannot interleave a header with another worker's block. One
//! dispatcher thread per link decodes them, registers the bytes with the block pool, and
//! delivers them. A link that closes while streams still expect data from its host aborts
//! those streams.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

use crate::bytes::arc::Bytes;
use crate::communication::Link;
use crate::data::block::Block;
use crate::data::block_pool::BlockPool;
use crate::data::block_queue::{block_queue, BlockQueueReceiver, BlockQueueSender, QueueItem};
use crate::data::cat_stream::CatStream;
use crate::data::mix_stream::MixStream;
use crate::data::multiplexer_header::{MagicByte, StreamBlockHeader};
use crate::data::stream::StreamId;
use crate::logging::{SluiceEvent, SluiceLogger};
use crate::{Error, Result};

/// The receiving end of one stream on one worker.
struct Inbox {
    mix: bool,
    /// One queue per sender for cat streams, a single queue for mix streams.
    senders: Vec<BlockQueueSender>,
    /// Held until the stream is created locally.
    receivers: Option<Vec<BlockQueueReceiver>>,
    /// Senders whose close signal has arrived.
    closed: Vec<bool>,
    open: usize,
    /// The local stream has been dropped.
    released: bool,
}

impl Inbox {
    fn new(mix: bool, num_workers: usize) -> Self {
        let queues = if mix { 1 } else { num_workers };
        let (senders, receivers) = (0 .. queues).map(|_| block_queue()).unzip();
        Inbox {
            mix,
            senders,
            receivers: Some(receivers),
            closed: vec![false; num_workers],
            open: num_workers,
            released: false,
        }
    }

    fn queue(&self, sender: usize) -> &BlockQueueSender {
        if self.mix { &self.senders[0] } else { &self.senders[sender] }
    }

    fn abort(&self, senders: std::ops::Range<usize>, reason: &str) {
        for sender in senders {
            if !self.closed[sender] {
                let _ = self.queue(sender).send((sender, QueueItem::Abort(reason.to_owned())));
            }
        }
    }
}

struct MuxState {
    inboxes: HashMap<(StreamId, usize), Inbox>,
    next_stream_id: Vec<StreamId>,
    /// Hosts whose link has closed, and why.
    closed_hosts: Vec<Option<String>>,
}

/// Multiplexer state shared with the dispatcher threads.
pub(crate) struct MuxShared {
    host_rank: usize,
    num_hosts: usize,
    workers_per_host: usize,
    pool: Arc<BlockPool>,
    state: Mutex<MuxState>,
    logger: Option<SluiceLogger>,
}

impl MuxShared {
    fn lock(&self) -> MutexGuard<'_, MuxState> {
        self.state.lock().expect("multiplexer poisoned")
    }

    fn num_workers(&self) -> usize { self.num_hosts * self.workers_per_host }

    /// The inbox of `(stream_id, local_worker)`, created if needed.
    fn inbox<'a>(&self, state: &'a mut MuxState, stream_id: StreamId, local_worker: usize, mix: bool) -> Result<&'a mut Inbox> {
        let num_workers = self.num_workers();
        let workers_per_host = self.workers_per_host;
        let MuxState { inboxes, closed_hosts, .. } = state;
        let inbox = inboxes.entry((stream_id, local_worker)).or_insert_with(|| {
            let inbox = Inbox::new(mix, num_workers);
            for (host, reason) in closed_hosts.iter().enumerate() {
                if let Some(reason) = reason {
                    inbox.abort(host * workers_per_host .. (host + 1) * workers_per_host, reason);
                }
            }
            inbox
        });
        if inbox.mix != mix {
            let (expected, got) = if inbox.mix { ("mix", "cat") } else { ("cat", "mix") };
            return Err(Error::BadHeader(format!("stream {} is a {} stream, used as a {} stream", stream_id, expected, got)));
        }
        Ok(inbox)
    }

    /// Delivers a block, or only a close signal, to the worker named in `header`.
    pub(crate) fn deliver(&self, header: StreamBlockHeader, block: Option<Block>) -> Result<()> {
        if header.receiver_local_worker >= self.workers_per_host || header.sender_worker >= self.num_workers() {
            return Err(Error::BadHeader(format!(
                "block from worker {} for local worker {} on a host with {} of {} workers",
                header.sender_worker, header.receiver_local_worker, self.workers_per_host, self.num_workers(),
            )));
        }
        let mix = header.magic == MagicByte::MixStreamBlock;
        let key = (header.stream_id, header.receiver_local_worker);
        let sender = header.sender_worker;

        let mut state = self.lock();
        let inbox = self.inbox(&mut state, header.stream_id, header.receiver_local_worker, mix)?;
        if inbox.closed[sender] {
            return Err(Error::BadHeader(format!("block from worker {} after it closed stream {}", sender, header.stream_id)));
        }
        // a send fails only if the local reader is gone; its data is not needed then
        if let Some(block) = block {
            let _ = inbox.queue(sender).send((sender, QueueItem::Block(block)));
        }
        if header.is_last {
            inbox.closed[sender] = true;
            inbox.open -= 1;
            let _ = inbox.queue(sender).send((sender, QueueItem::Close));
        }
        if inbox.released && inbox.open == 0 {
            state.inboxes.remove(&key);
        }
        Ok(())
    }

    /// Takes the receiving queues of a stream that is being created locally.
    fn register(&self, stream_id: StreamId, local_worker: usize, mix: bool) -> Result<Vec<BlockQueueReceiver>> {
        let mut state = self.lock();
        let inbox = self.inbox(&mut state, stream_id, local_worker, mix)?;
        inbox
            .receivers
            .take()
            .ok_or_else(|| Error::BadHeader(format!("stream {} opened twice on local worker {}", stream_id, local_worker)))
    }

    /// Forgets a stream once it is dropped locally and all its senders have closed.
    pub(crate) fn release(&self, stream_id: StreamId, local_worker: usize) {
        let mut state = self.lock();
        let key = (stream_id, local_worker);
        if let Some(inbox) = state.inboxes.get_mut(&key) {
            inbox.released = true;
            if inbox.open == 0 {
                state.inboxes.remove(&key);
            }
        }
    }

    /// Aborts every stream still waiting for a worker of `host`.
    fn host_closed(&self, host: usize, reason: String) {
        let mut state = self.lock();
        let senders = host * self.workers_per_host .. (host + 1) * self.workers_per_host;
        for inbox in state.inboxes.values() {
            inbox.abort(senders.clone(), &reason);
        }
        if let Some(slot) = state.closed_hosts.get_mut(host) {
            *slot = Some(reason);
        }
    }

    /// Streams currently registered, for tests and diagnostics.
    fn open_streams(&self) -> usize {
        self.lock().inboxes.len()
    }
}

/// The stream multiplexer of one host.
pub struct Multiplexer {
    shared: Arc<MuxShared>,
    /// Senders towards each other host, `None` for this host.
    senders: Vec<Option<Sender<Bytes>>>,
}

impl Multiplexer {
    /// Takes over `links`, indexed by host, and starts one dispatcher thread per link.
    ///
    /// Dropping the multiplexer closes the sending halves. The returned guard joins the
    /// dispatchers, which exit once the other hosts have dropped theirs; drop it only after
    /// every multiplexer of the process.
    pub fn new(
        host_rank: usize,
        workers_per_host: usize,
        pool: Arc<BlockPool>,
        links: Vec<Option<Link>>,
        logger: Option<SluiceLogger>,
    ) -> Result<(Arc<Multiplexer>, DispatchGuard)> {
        let num_hosts = links.len().max(1);
        let shared = Arc::new(MuxShared {
            host_rank,
            num_hosts,
            workers_per_host,
            pool,
            state: Mutex::new(MuxState {
                inboxes: HashMap::new(),
                next_stream_id: vec![0; workers_per_host],
                closed_hosts: vec![None; num_hosts],
            }),
            logger,
        });

        let mut senders = Vec::with_capacity(num_hosts);
        let mut threads = Vec::new();
        for (host, link) in links.into_iter().enumerate() {
            match link {
                Some(link) => {
                    let (sender, receiver) = link.split();
                    senders.push(Some(sender));
                    let shared = Arc::clone(&shared);
                    let thread = std::thread::Builder::new()
                        .name(format!("sluice:dispatch {}<-{}", host_rank, host))
                        .spawn(move || dispatch(shared, host, receiver))?;
                    threads.push(thread);
                },
                None => senders.push(None),
            }
        }
        if senders.is_empty() {
            senders.push(None);
        }

        Ok((Arc::new(Multiplexer { shared, senders }), DispatchGuard { threads }))
    }

    pub(crate) fn shared(&self) -> Arc<MuxShared> { Arc::clone(&self.shared) }

    pub(crate) fn sender(&self, host: usize) -> Option<Sender<Bytes>> {
        self.senders.get(host).and_then(|sender| sender.clone())
    }

    pub(crate) fn logger(&self) -> Option<SluiceLogger> { self.shared.logger.clone() }

    /// Rank of this host.
    pub fn host_rank(&self) -> usize { self.shared.host_rank }

    /// Number of hosts.
    pub fn num_hosts(&self) -> usize { self.shared.num_hosts }

    /// Worker threads per host.
    pub fn workers_per_host(&self) -> usize { self.shared.workers_per_host }

    /// Workers of the computation.
    pub fn num_workers(&self) -> usize { self.shared.num_workers() }

    /// The host's block pool.
    pub fn block_pool(&self) -> &Arc<BlockPool> { &self.shared.pool }

    /// Streams with registered state on this host.
    pub fn open_streams(&self) -> usize { self.shared.open_streams() }

    /// The next stream id of `local_worker`.
    ///
    /// Ids agree across workers as long as all workers create the same streams in the same order.
    pub fn allocate_stream_id(&self, local_worker: usize) -> StreamId {
        let mut state = self.shared.lock();
        let id = state.next_stream_id[local_worker];
        state.next_stream_id[local_worker] += 1;
        id
    }

    /// A new cat stream for `local_worker`.
    pub fn new_cat_stream(self: &Arc<Self>, local_worker: usize) -> Result<CatStream> {
        let stream_id = self.allocate_stream_id(local_worker);
        let queues = self.shared.register(stream_id, local_worker, false)?;
        Ok(CatStream::new(Arc::clone(self), stream_id, local_worker, queues))
    }

    /// A new mix stream for `local_worker`.
    pub fn new_mix_stream(self: &Arc<Self>, local_worker: usize) -> Result<MixStream> {
        let stream_id = self.allocate_stream_id(local_worker);
        let mut queues = self.shared.register(stream_id, local_worker, true)?;
        let queue = queues.pop().ok_or_else(|| Error::BadHeader("mix stream without queue".to_owned()))?;
        Ok(MixStream::new(Arc::clone(self), stream_id, local_worker, queue))
    }
}

/// Joins the dispatcher threads of a multiplexer when dropped.
#[derive(Default)]
pub struct DispatchGuard {
    threads: Vec<JoinHandle<()>>,
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

/// Receives blocks, each a header followed by its bytes, from `host` until the link closes.
fn dispatch(shared: Arc<MuxShared>, host: usize, receiver: Receiver<Bytes>) {
    let reason = match dispatch_loop(&shared, host, &receiver) {
        Ok(()) => format!("connection to host {} closed", host),
        Err(error) => {
            if let Some(logger) = &shared.logger {
                logger.log(SluiceEvent::Text(format!("dispatch from host {} failed: {}", host, error)));
            }
            error.to_string()
        },
    };
    shared.host_closed(host, reason);
}

fn dispatch_loop(shared: &MuxShared, host: usize, receiver: &Receiver<Bytes>) -> Result<()> {
    while let Ok(message) = receiver.recv() {
        let header = StreamBlockHeader::read_from(&mut &message[..])?;
        if header.sender_worker / shared.workers_per_host != host {
            return Err(Error::BadHeader(format!("worker {} claims to be on host {}", header.sender_worker, host)));
        }
        let payload = message.len() - StreamBlockHeader::BYTES;
        if payload != header.size {
            return Err(Error::BadHeader(format!("block of {} bytes announced as {}", payload, header.size)));
        }
        let block = if header.size > 0 {
            let byte_block = shared.pool.adopt(message.slice(StreamBlockHeader::BYTES .. message.len()));
            Some(Block::new(byte_block, 0, header.size, header.first_item, header.num_items))
        }
        else {
            None
        };
        shared.deliver(header, block)?;
    }
    Ok(())
}
