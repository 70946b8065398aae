//! The host-wide pool that owns all block memory.
//!
//! Every block is registered with the pool, which knows whether its bytes are resident, how
//! many pins each worker holds on it, and in what order unpinned blocks were released. A block
//! with pins is always resident. Once unpinned it joins the eviction order, and a background
//! thread writes it to the swap file whenever resident bytes exceed the soft limit. Allocations
//! that would exceed the hard limit evict synchronously, or wait for pins to be released, and
//! fail with [`Error::OutOfMemory`] only when neither helps in time.
//!
//! Blocks mapped from external files are never written to the swap file. Their loaded copy
//! counts as resident and joins the eviction order like any other unpinned block, but evicting
//! it only drops the copy: the next pin reads the bytes from the external file again, the way
//! the pages of a memory-mapped file come and go.

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::bytes::arc::{Bytes, BytesMut};
use crate::config::MemoryConfig;
use crate::data::byte_block::{ByteBlock, ByteBlockPtr, PinnedByteBlockPtr};
use crate::data::swap::{Extent, SwapFile};
use crate::logging::{BlockPoolEvent, PoolAction, PoolStatsEvent, SluiceEvent, SluiceLogger};
use crate::{Error, Result};

/// Counters describing the pool's contents.
pub type PoolStats = PoolStatsEvent;

/// Where a block's bytes are.
enum Residence {
    Memory(Bytes),
    Swapped(Extent),
    /// A region of a file outside the pool, read on demand and never written.
    External {
        path: PathBuf,
        offset: u64,
        loaded: Option<Bytes>,
    },
}

struct BlockEntry {
    size: usize,
    /// Pins per local worker.
    pins: Vec<usize>,
    total_pins: usize,
    residence: Residence,
    /// Position in the eviction order, while unpinned and resident.
    lru_ticket: Option<u64>,
}

impl BlockEntry {
    fn resident(&self) -> Option<&Bytes> {
        match &self.residence {
            Residence::Memory(bytes) => Some(bytes),
            Residence::External { loaded, .. } => loaded.as_ref(),
            Residence::Swapped(_) => None,
        }
    }
}

struct PoolState {
    blocks: HashMap<u64, BlockEntry>,
    /// Unpinned resident blocks, oldest ticket first.
    lru: BTreeMap<u64, u64>,
    next_id: u64,
    next_ticket: u64,
    /// Resident bytes, including reservations of unfinished buffers.
    total_bytes: usize,
    max_total_bytes: usize,
    pinned_blocks: usize,
    swapped_blocks: usize,
    swap: Option<SwapFile>,
    shutdown: bool,
}

/// Pool state shared with blocks and the evictor thread.
pub(crate) struct PoolInner {
    state: Mutex<PoolState>,
    /// Signaled when bytes are released or blocks are unpinned.
    freed: Condvar,
    /// Wakes the evictor.
    evict_signal: Condvar,
    soft_limit: usize,
    hard_limit: usize,
    hard_limit_wait: Duration,
    swap_dir: Option<PathBuf>,
    logger: Option<SluiceLogger>,
}

/// The pool of block memory of one host, shared by all of its workers.
pub struct BlockPool {
    inner: Arc<PoolInner>,
    evictor: Option<JoinHandle<()>>,
    workers_per_host: usize,
}

impl BlockPool {
    /// A pool with the given limits, evicting to `config.swap_dir`.
    pub fn new(
        soft_limit: usize,
        hard_limit: usize,
        workers_per_host: usize,
        config: &MemoryConfig,
        logger: Option<SluiceLogger>,
    ) -> Self {
        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                blocks: HashMap::new(),
                lru: BTreeMap::new(),
                next_id: 0,
                next_ticket: 0,
                total_bytes: 0,
                max_total_bytes: 0,
                pinned_blocks: 0,
                swapped_blocks: 0,
                swap: None,
                shutdown: false,
            }),
            freed: Condvar::new(),
            evict_signal: Condvar::new(),
            soft_limit,
            hard_limit,
            hard_limit_wait: config.hard_limit_wait,
            swap_dir: config.swap_dir.clone(),
            logger,
        });

        let evictor = {
            let inner = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("sluice:evictor".to_owned())
                .spawn(move || inner.evict_loop())
                .ok()
        };

        BlockPool { inner, evictor, workers_per_host }
    }

    /// A pool sized by `config`'s split of the host's RAM.
    pub fn from_config(
        config: &MemoryConfig,
        workers_per_host: usize,
        logger: Option<SluiceLogger>,
    ) -> Self {
        BlockPool::new(config.ram_block_pool_soft(), config.ram_block_pool_hard(), workers_per_host, config, logger)
    }

    /// An unlimited pool, mostly for tests.
    pub fn unlimited(workers_per_host: usize) -> Self {
        BlockPool::new(usize::MAX, usize::MAX, workers_per_host, &MemoryConfig::default(), None)
    }

    /// Reserves `size` bytes for a buffer that worker `local_worker` fills and then freezes
    /// into a pinned block.
    pub fn allocate(&self, size: usize, local_worker: usize) -> Result<ByteBuffer> {
        let state = self.inner.lock();
        drop(self.inner.reserve(state, size)?);
        Ok(ByteBuffer {
            pool: Arc::clone(&self.inner),
            buffer: BytesMut::with_capacity(size),
            reserved: size,
            local_worker,
        })
    }

    /// Registers bytes that are already in memory, typically received from the network, as an
    /// unpinned block.
    ///
    /// The bytes are charged against the limits without waiting, since refusing them would
    /// stall the connection they arrived on.
    pub fn adopt(&self, bytes: Bytes) -> ByteBlockPtr {
        let size = bytes.len();
        let id = {
            let mut state = self.inner.lock();
            state.charge(size);
            let id = state.next_id;
            state.next_id += 1;
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.lru.insert(ticket, id);
            state.blocks.insert(id, BlockEntry {
                size,
                pins: Vec::new(),
                total_pins: 0,
                residence: Residence::Memory(bytes),
                lru_ticket: Some(ticket),
            });
            self.inner.wake_evictor(&state);
            id
        };
        self.inner.log(PoolAction::Adopt, id, size);
        Arc::new(ByteBlock::new(id, size, Arc::clone(&self.inner)))
    }

    /// A block backed by `size` bytes at `offset` in the file at `path`.
    ///
    /// The bytes are read on first pin and dropped again under memory pressure, never written.
    pub fn map_external<P: Into<PathBuf>>(&self, path: P, offset: u64, size: usize) -> ByteBlockPtr {
        let id = {
            let mut state = self.inner.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.blocks.insert(id, BlockEntry {
                size,
                pins: Vec::new(),
                total_pins: 0,
                residence: Residence::External { path: path.into(), offset, loaded: None },
                lru_ticket: None,
            });
            id
        };
        Arc::new(ByteBlock::new(id, size, Arc::clone(&self.inner)))
    }

    /// Evicts unpinned blocks until resident bytes are at most `target`, or nothing is left to evict.
    ///
    /// Returns the number of blocks evicted.
    pub fn evict_until(&self, target: usize) -> Result<usize> {
        let mut state = self.inner.lock();
        let mut evicted = 0;
        while state.total_bytes > target && self.inner.evict_one(&mut state)? {
            evicted += 1;
        }
        Ok(evicted)
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        self.inner.lock().stats()
    }

    /// Logs `text` to the pool's logger, if it has one.
    pub(crate) fn log_text(&self, text: String) {
        if let Some(logger) = &self.inner.logger {
            logger.log(SluiceEvent::Text(text));
        }
    }

    /// Bytes resident in memory.
    pub fn total_bytes(&self) -> usize { self.inner.lock().total_bytes }

    /// Highest number of bytes that were ever resident at once.
    pub fn max_total_bytes(&self) -> usize { self.inner.lock().max_total_bytes }

    /// Number of pins `local_worker` holds on the block `id`.
    pub fn pin_count(&self, id: u64, local_worker: usize) -> usize {
        self.inner
            .lock()
            .blocks
            .get(&id)
            .and_then(|entry| entry.pins.get(local_worker).copied())
            .unwrap_or(0)
    }

    /// True if the bytes of block `id` are in memory.
    pub fn is_resident(&self, id: u64) -> bool {
        self.inner.lock().blocks.get(&id).is_some_and(|entry| entry.resident().is_some())
    }

    /// The soft limit in bytes.
    pub fn soft_limit(&self) -> usize { self.inner.soft_limit }

    /// The hard limit in bytes.
    pub fn hard_limit(&self) -> usize { self.inner.hard_limit }

    /// Worker threads sharing this pool.
    pub fn workers_per_host(&self) -> usize { self.workers_per_host }
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        let stats = {
            let mut state = self.inner.lock();
            state.shutdown = true;
            self.inner.evict_signal.notify_all();
            state.stats()
        };
        if let Some(evictor) = self.evictor.take() {
            let _ = evictor.join();
        }
        if let Some(logger) = &self.inner.logger {
            logger.log(SluiceEvent::PoolStats(stats));
            logger.flush();
        }
    }
}

impl PoolState {
    fn charge(&mut self, size: usize) {
        self.total_bytes += size;
        self.max_total_bytes = self.max_total_bytes.max(self.total_bytes);
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            total_bytes: self.total_bytes,
            max_total_bytes: self.max_total_bytes,
            total_blocks: self.blocks.len(),
            pinned_blocks: self.pinned_blocks,
            swapped_blocks: self.swapped_blocks,
        }
    }
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().expect("block pool poisoned")
    }

    fn log(&self, action: PoolAction, block: u64, bytes: usize) {
        if let Some(logger) = &self.logger {
            logger.log(BlockPoolEvent { action, block, bytes });
        }
    }

    fn wake_evictor(&self, state: &PoolState) {
        if state.total_bytes > self.soft_limit && !state.lru.is_empty() {
            self.evict_signal.notify_one();
        }
    }

    /// Charges `size` bytes, evicting or waiting as needed to stay below the hard limit.
    ///
    /// A pool holding nothing accepts any size, so a single oversized block can always be made.
    fn reserve<'a>(&'a self, mut state: MutexGuard<'a, PoolState>, size: usize) -> Result<MutexGuard<'a, PoolState>> {
        let deadline = Instant::now() + self.hard_limit_wait;
        loop {
            if state.total_bytes == 0 || state.total_bytes.saturating_add(size) <= self.hard_limit {
                state.charge(size);
                self.wake_evictor(&state);
                return Ok(state);
            }
            if self.evict_one(&mut state)? {
                continue;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::OutOfMemory {
                    requested: size,
                    hard_limit: self.hard_limit,
                    in_use: state.total_bytes,
                });
            }
            state = self.freed.wait_timeout(state, deadline - now).expect("block pool poisoned").0;
        }
    }

    /// Returns `size` reserved bytes that were never turned into a block.
    fn release_reservation(&self, size: usize) {
        let mut state = self.lock();
        state.total_bytes -= size;
        self.freed.notify_all();
        drop(state);
    }

    /// Evicts the least recently unpinned block; false if there is none.
    fn evict_one(&self, state: &mut PoolState) -> Result<bool> {
        let Some((&ticket, &id)) = state.lru.iter().next() else { return Ok(false) };
        let Some(entry) = state.blocks.get_mut(&id) else { return Ok(false) };
        debug_assert_eq!(entry.total_pins, 0);
        let size = entry.size;
        match &mut entry.residence {
            Residence::Memory(bytes) => {
                if state.swap.is_none() {
                    let dir = self.swap_dir.clone().unwrap_or_else(std::env::temp_dir);
                    state.swap = Some(SwapFile::create(&dir)?);
                }
                let Some(swap) = state.swap.as_mut() else { return Ok(false) };
                let extent = swap.write(bytes)?;
                entry.residence = Residence::Swapped(extent);
                state.swapped_blocks += 1;
            },
            Residence::External { loaded, .. } => {
                *loaded = None;
            },
            Residence::Swapped(_) => {
                entry.lru_ticket = None;
                state.lru.remove(&ticket);
                return Ok(true);
            },
        }
        entry.lru_ticket = None;
        state.lru.remove(&ticket);
        state.total_bytes -= size;
        self.freed.notify_all();
        self.log(PoolAction::Evict, id, size);
        Ok(true)
    }

    fn evict_loop(&self) {
        let mut state = self.lock();
        loop {
            while !state.shutdown && (state.total_bytes <= self.soft_limit || state.lru.is_empty()) {
                state = self.evict_signal.wait(state).expect("block pool poisoned");
            }
            if state.shutdown {
                return;
            }
            while state.total_bytes > self.soft_limit {
                match self.evict_one(&mut state) {
                    Ok(true) => {},
                    Ok(false) => break,
                    Err(error) => {
                        if let Some(logger) = &self.logger {
                            logger.log(SluiceEvent::Text(format!("eviction failed: {}", error)));
                        }
                        break;
                    },
                }
            }
        }
    }

    /// Turns a filled buffer into a block pinned once by `local_worker`.
    fn register(self: &Arc<Self>, bytes: Bytes, reserved: usize, local_worker: usize) -> PinnedByteBlockPtr {
        let size = bytes.len();
        let id = {
            let mut state = self.lock();
            state.total_bytes -= reserved - size;
            let id = state.next_id;
            state.next_id += 1;
            let mut pins = vec![0; local_worker + 1];
            pins[local_worker] = 1;
            state.blocks.insert(id, BlockEntry {
                size,
                pins,
                total_pins: 1,
                residence: Residence::Memory(bytes.clone()),
                lru_ticket: None,
            });
            state.pinned_blocks += 1;
            self.freed.notify_all();
            id
        };
        self.log(PoolAction::Allocate, id, size);
        let block = Arc::new(ByteBlock::new(id, size, Arc::clone(self)));
        PinnedByteBlockPtr::from_parts(block, bytes, local_worker)
    }

    /// Adds a pin for `local_worker`, loading the bytes first if they are not resident.
    pub(crate) fn pin(&self, id: u64, local_worker: usize) -> Result<Bytes> {
        let mut state = self.lock();
        let (size, resident) = {
            let state = &mut *state;
            let entry = state.blocks.get_mut(&id).ok_or_else(|| Error::Format(format!("pin of unknown block {}", id)))?;
            if let Some(ticket) = entry.lru_ticket.take() {
                state.lru.remove(&ticket);
            }
            (entry.size, entry.resident().cloned())
        };

        let bytes = match resident {
            Some(bytes) => bytes,
            None => {
                state = self.reserve(state, size)?;
                match self.load(&mut state, id) {
                    Ok(Some(bytes)) => {
                        self.log(PoolAction::Load, id, size);
                        bytes
                    },
                    // another worker loaded it while this one waited for memory
                    Ok(None) => {
                        state.total_bytes -= size;
                        state
                            .blocks
                            .get(&id)
                            .and_then(|entry| entry.resident().cloned())
                            .ok_or_else(|| Error::Format(format!("block {} vanished while loading", id)))?
                    },
                    Err(error) => {
                        state.total_bytes -= size;
                        return Err(error);
                    },
                }
            },
        };

        let state = &mut *state;
        let entry = state.blocks.get_mut(&id).ok_or_else(|| Error::Format(format!("pin of unknown block {}", id)))?;
        if entry.pins.len() <= local_worker {
            entry.pins.resize(local_worker + 1, 0);
        }
        entry.pins[local_worker] += 1;
        entry.total_pins += 1;
        if entry.total_pins == 1 {
            state.pinned_blocks += 1;
        }
        Ok(bytes)
    }

    /// Reads the bytes of a non-resident block into memory; `None` if it is resident already.
    fn load(&self, state: &mut PoolState, id: u64) -> Result<Option<Bytes>> {
        let entry = state.blocks.get_mut(&id).ok_or_else(|| Error::Format(format!("load of unknown block {}", id)))?;
        // an unpin by another worker may have made it evictable again
        if let Some(ticket) = entry.lru_ticket.take() {
            state.lru.remove(&ticket);
        }
        let size = entry.size;
        match &mut entry.residence {
            Residence::Memory(_) | Residence::External { loaded: Some(_), .. } => Ok(None),
            Residence::External { path, offset, loaded } => {
                let mut file = std::fs::File::open(&*path)?;
                file.seek(SeekFrom::Start(*offset))?;
                let mut data = vec![0u8; size];
                file.read_exact(&mut data)?;
                let bytes = Bytes::from(data);
                *loaded = Some(bytes.clone());
                Ok(Some(bytes))
            },
            Residence::Swapped(extent) => {
                let extent = *extent;
                let swap = state.swap.as_mut().ok_or_else(|| Error::Format("swapped block without swap file".to_owned()))?;
                let bytes = Bytes::from(swap.read(extent)?);
                swap.release(extent);
                state.swapped_blocks -= 1;
                entry.residence = Residence::Memory(bytes.clone());
                Ok(Some(bytes))
            },
        }
    }

    /// Adds a pin to a block that `local_worker` knows to be resident.
    pub(crate) fn inc_pin(&self, id: u64, local_worker: usize) {
        let mut state = self.lock();
        if let Some(entry) = state.blocks.get_mut(&id) {
            debug_assert!(entry.total_pins > 0);
            if entry.pins.len() <= local_worker {
                entry.pins.resize(local_worker + 1, 0);
            }
            entry.pins[local_worker] += 1;
            entry.total_pins += 1;
        }
    }

    /// Removes a pin; the last one makes the block eligible for eviction.
    pub(crate) fn dec_pin(&self, id: u64, local_worker: usize) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let ticket = state.next_ticket;
        let Some(entry) = state.blocks.get_mut(&id) else { return };
        debug_assert!(entry.pins.get(local_worker).copied().unwrap_or(0) > 0, "unpin without pin");
        if let Some(pins) = entry.pins.get_mut(local_worker) {
            *pins = pins.saturating_sub(1);
        }
        entry.total_pins = entry.total_pins.saturating_sub(1);
        if entry.total_pins == 0 {
            if entry.resident().is_some() {
                entry.lru_ticket = Some(ticket);
                state.lru.insert(ticket, id);
                state.next_ticket += 1;
            }
            state.pinned_blocks -= 1;
            self.freed.notify_all();
            self.wake_evictor(state);
        }
    }

    /// Forgets block `id`, releasing its memory or swap space.
    pub(crate) fn free(&self, id: u64) {
        let mut state = self.lock();
        let Some(entry) = state.blocks.remove(&id) else { return };
        debug_assert_eq!(entry.total_pins, 0);
        if let Some(ticket) = entry.lru_ticket {
            state.lru.remove(&ticket);
        }
        let resident = entry.resident().is_some();
        if let Residence::Swapped(extent) = entry.residence {
            if let Some(swap) = state.swap.as_mut() {
                swap.release(extent);
            }
            state.swapped_blocks -= 1;
        }
        if resident {
            state.total_bytes -= entry.size;
            self.freed.notify_all();
        }
        drop(state);
        self.log(PoolAction::Free, id, entry.size);
    }
}

/// A writable buffer whose memory is reserved in the pool.
///
/// Freezing turns it into a block pinned by the worker that allocated it; dropping it unfrozen
/// returns the reservation.
pub struct ByteBuffer {
    pool: Arc<PoolInner>,
    buffer: BytesMut,
    reserved: usize,
    local_worker: usize,
}

impl ByteBuffer {
    /// Appends as much of `bytes` as fits, returning the number of bytes taken.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> usize {
        self.buffer.extend_from_slice(bytes)
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize { self.buffer.len() }

    /// True if nothing has been written.
    pub fn is_empty(&self) -> bool { self.buffer.is_empty() }

    /// Bytes still writable.
    pub fn remaining(&self) -> usize { self.buffer.remaining() }

    /// Registers the written bytes as a block, pinned by the allocating worker.
    pub fn freeze(mut self) -> PinnedByteBlockPtr {
        let buffer = std::mem::replace(&mut self.buffer, BytesMut::with_capacity(0));
        let reserved = std::mem::take(&mut self.reserved);
        self.pool.register(buffer.freeze(), reserved, self.local_worker)
    }
}

impl Drop for ByteBuffer {
    fn drop(&mut self) {
        if self.reserved > 0 {
            self.pool.release_reservation(self.reserved);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool(soft: usize, hard: usize) -> BlockPool {
        let config = MemoryConfig { hard_limit_wait: Duration::from_millis(50), ..MemoryConfig::default() };
        BlockPool::new(soft, hard, 2, &config, None)
    }

    fn filled(pool: &BlockPool, size: usize, value: u8) -> PinnedByteBlockPtr {
        let mut buffer = pool.allocate(size, 0).unwrap();
        assert_eq!(buffer.extend_from_slice(&vec![value; size]), size);
        buffer.freeze()
    }

    #[test]
    fn unpinned_blocks_are_evicted_and_reloaded() {
        let pool = small_pool(100, 200);
        let first = filled(&pool, 100, 1);
        let block = Arc::clone(first.byte_block());
        drop(first);

        // the evictor runs asynchronously; force the outcome.
        let second = filled(&pool, 100, 2);
        pool.evict_until(100).unwrap();
        assert!(!pool.is_resident(block.id()));
        assert_eq!(pool.stats().swapped_blocks, 1);

        let again = block.pin(1).unwrap();
        assert!(again.iter().all(|&b| b == 1));
        assert_eq!(pool.pin_count(block.id(), 1), 1);
        assert_eq!(pool.stats().swapped_blocks, 0);
        drop(second);
        drop(again);
    }

    #[test]
    fn hard_limit_fails_when_everything_is_pinned() {
        let pool = small_pool(50, 100);
        let _a = filled(&pool, 60, 0);
        match pool.allocate(60, 1) {
            Err(Error::OutOfMemory { requested, hard_limit, in_use }) => {
                assert_eq!((requested, hard_limit, in_use), (60, 100, 60));
            },
            _ => panic!("expected out of memory"),
        }
    }

    #[test]
    fn waiting_allocation_proceeds_once_a_pin_is_released() {
        let config = MemoryConfig { hard_limit_wait: Duration::from_secs(10), ..MemoryConfig::default() };
        let pool = Arc::new(BlockPool::new(1000, 100, 2, &config, None));
        let held = filled(&pool, 80, 7);
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            drop(held);
        });
        let buffer = pool.allocate(80, 1).unwrap();
        releaser.join().unwrap();
        drop(buffer);
        assert_eq!(pool.total_bytes(), 0);
    }

    #[test]
    fn dropping_blocks_returns_memory() {
        let pool = small_pool(1000, 1000);
        let a = filled(&pool, 10, 0);
        let b = pool.allocate(30, 1).unwrap();
        assert_eq!(pool.total_bytes(), 40);
        drop(b);
        assert_eq!(pool.total_bytes(), 10);
        drop(a);
        let stats = pool.stats();
        assert_eq!((stats.total_bytes, stats.total_blocks, stats.pinned_blocks), (0, 0, 0));
        assert_eq!(stats.max_total_bytes, 40);
    }

    #[test]
    fn adopted_and_external_blocks() {
        let pool = small_pool(1000, 1000);
        let adopted = pool.adopt(Bytes::from(vec![5u8; 16]));
        assert_eq!(pool.total_bytes(), 16);
        let pinned = adopted.pin(0).unwrap();
        assert_eq!(&pinned[..], &[5u8; 16]);
        drop(pinned);

        let path = std::env::temp_dir().join(format!("sluice-external-{}", std::process::id()));
        std::fs::write(&path, (0u8 .. 64).collect::<Vec<_>>()).unwrap();
        let external = pool.map_external(&path, 10, 4);
        assert!(!pool.is_resident(external.id()));
        let pinned = external.pin(0).unwrap();
        assert_eq!(&pinned[..], &[10, 11, 12, 13]);
        drop(pinned);
        pool.evict_until(0).unwrap();
        assert!(!pool.is_resident(external.id()));
        // dropped, not swapped: only the adopted block went to the swap file
        assert_eq!(pool.stats().swapped_blocks, 1);
        assert_eq!(&external.pin(1).unwrap()[..], &[10, 11, 12, 13]);
        std::fs::remove_file(&path).unwrap();
    }
}
