//! Handles on pool blocks: shared ownership, and pins that keep the bytes resident.
//!
//! A [`ByteBlockPtr`] keeps a block alive; the block is forgotten by the pool when the last
//! pointer is dropped. It says nothing about residency. A [`PinnedByteBlockPtr`] additionally
//! holds one pin of one worker, during which the bytes stay in memory and can be read.

use std::ops::Deref;
use std::sync::Arc;

use crate::bytes::arc::Bytes;
use crate::data::block_pool::PoolInner;
use crate::Result;

/// A block of bytes owned by a [`BlockPool`](crate::data::BlockPool).
pub struct ByteBlock {
    id: u64,
    size: usize,
    pool: Arc<PoolInner>,
}

/// Shared ownership of a [`ByteBlock`].
pub type ByteBlockPtr = Arc<ByteBlock>;

impl ByteBlock {
    pub(crate) fn new(id: u64, size: usize, pool: Arc<PoolInner>) -> Self {
        ByteBlock { id, size, pool }
    }

    /// Pool-unique id of the block.
    pub fn id(&self) -> u64 { self.id }

    /// Size of the block in bytes.
    pub fn size(&self) -> usize { self.size }

    /// Acquires a pin for `local_worker`, reading the bytes back in if they were evicted.
    pub fn pin(self: &Arc<Self>, local_worker: usize) -> Result<PinnedByteBlockPtr> {
        let data = self.pool.pin(self.id, local_worker)?;
        Ok(PinnedByteBlockPtr { byte_block: Arc::clone(self), data, local_worker })
    }
}

impl Drop for ByteBlock {
    fn drop(&mut self) {
        self.pool.free(self.id);
    }
}

impl std::fmt::Debug for ByteBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteBlock").field("id", &self.id).field("size", &self.size).finish()
    }
}

/// A pinned block: its bytes are resident for as long as this value lives.
///
/// Cloning acquires another pin for the same worker.
pub struct PinnedByteBlockPtr {
    byte_block: ByteBlockPtr,
    data: Bytes,
    local_worker: usize,
}

impl PinnedByteBlockPtr {
    pub(crate) fn from_parts(byte_block: ByteBlockPtr, data: Bytes, local_worker: usize) -> Self {
        PinnedByteBlockPtr { byte_block, data, local_worker }
    }

    /// The underlying block.
    pub fn byte_block(&self) -> &ByteBlockPtr { &self.byte_block }

    /// The worker holding this pin.
    pub fn local_worker(&self) -> usize { self.local_worker }

    /// The resident bytes, sharing their allocation.
    pub fn bytes(&self) -> &Bytes { &self.data }

    /// Releases the pin, keeping the block.
    pub fn into_unpinned(self) -> ByteBlockPtr {
        Arc::clone(&self.byte_block)
    }
}

impl Clone for PinnedByteBlockPtr {
    fn clone(&self) -> Self {
        self.byte_block.pool.inc_pin(self.byte_block.id, self.local_worker);
        PinnedByteBlockPtr {
            byte_block: Arc::clone(&self.byte_block),
            data: self.data.clone(),
            local_worker: self.local_worker,
        }
    }
}

impl Deref for PinnedByteBlockPtr {
    type Target = [u8];
    fn deref(&self) -> &[u8] { &self.data }
}

impl Drop for PinnedByteBlockPtr {
    fn drop(&mut self) {
        // release our view of the bytes before the pool may evict them
        self.data = Bytes::empty();
        self.byte_block.pool.dec_pin(self.byte_block.id, self.local_worker);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::data::BlockPool;

    #[test]
    fn pins_from_many_workers_keep_the_block_resident() {
        let pool = Arc::new(BlockPool::new(0, usize::MAX, 4, &Default::default(), None));
        let mut buffer = pool.allocate(64, 0).unwrap();
        buffer.extend_from_slice(&[9u8; 64]);
        let pinned = buffer.freeze();
        let block = Arc::clone(pinned.byte_block());
        let id = block.id();

        let handles: Vec<_> = (1 .. 4).map(|worker| {
            let block = Arc::clone(&block);
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                for _ in 0 .. 200 {
                    let pin = block.pin(worker).unwrap();
                    let again = pin.clone();
                    assert!(pool.is_resident(id));
                    assert_eq!(pool.pin_count(id, worker), 2);
                    assert!(again.iter().all(|&b| b == 9));
                }
            })
        }).collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(pool.pin_count(id, 0), 1);
        drop(pinned);
        assert_eq!(pool.stats().pinned_blocks, 0);
        // the soft limit of zero makes every unpinned block an eviction candidate
        pool.evict_until(0).unwrap();
        assert!(!pool.is_resident(id));
        assert!(block.pin(2).unwrap().iter().all(|&b| b == 9));
    }
}
