//! Blocks: item-aware slices of byte blocks.

use std::fmt;

use crate::data::byte_block::{ByteBlockPtr, PinnedByteBlockPtr};
use crate::Result;

/// A slice `[begin, end)` of a byte block, with the positions of the items in it.
///
/// Items may span blocks. `first_item` is the offset of the first item that starts in this
/// block, and `num_items` counts the items that start here; bytes before `first_item` finish
/// an item begun in an earlier block. A block in which no item starts has `first_item == end`.
#[derive(Clone)]
pub struct Block {
    byte_block: ByteBlockPtr,
    begin: usize,
    end: usize,
    first_item: usize,
    num_items: usize,
}

impl Block {
    /// A block over `[begin, end)` of `byte_block`.
    pub fn new(byte_block: ByteBlockPtr, begin: usize, end: usize, first_item: usize, num_items: usize) -> Self {
        debug_assert!(begin <= first_item && first_item <= end && end <= byte_block.size());
        Block { byte_block, begin, end, first_item, num_items }
    }

    /// The underlying byte block.
    pub fn byte_block(&self) -> &ByteBlockPtr { &self.byte_block }

    /// Start of the slice.
    pub fn begin(&self) -> usize { self.begin }

    /// End of the slice.
    pub fn end(&self) -> usize { self.end }

    /// Length of the slice in bytes.
    pub fn size(&self) -> usize { self.end - self.begin }

    /// Offset of the first item starting in the block, within the byte block.
    pub fn first_item_absolute(&self) -> usize { self.first_item }

    /// Offset of the first item starting in the block, relative to `begin`.
    pub fn first_item_relative(&self) -> usize { self.first_item - self.begin }

    /// Number of items starting in the block.
    pub fn num_items(&self) -> usize { self.num_items }

    /// Pins the block for `local_worker`.
    pub fn pin(&self, local_worker: usize) -> Result<PinnedBlock> {
        let pin = self.byte_block.pin(local_worker)?;
        Ok(PinnedBlock { block: self.clone(), pin })
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("byte_block", &self.byte_block.id())
            .field("begin", &self.begin)
            .field("end", &self.end)
            .field("first_item", &self.first_item)
            .field("num_items", &self.num_items)
            .finish()
    }
}

/// A [`Block`] whose bytes are resident while this value lives.
#[derive(Clone)]
pub struct PinnedBlock {
    block: Block,
    pin: PinnedByteBlockPtr,
}

impl PinnedBlock {
    /// Wraps a pinned byte block; the block covers `[begin, end)` of it.
    pub fn new(pin: PinnedByteBlockPtr, begin: usize, end: usize, first_item: usize, num_items: usize) -> Self {
        let block = Block::new(std::sync::Arc::clone(pin.byte_block()), begin, end, first_item, num_items);
        PinnedBlock { block, pin }
    }

    /// The block's bytes.
    pub fn data(&self) -> &[u8] {
        &self.pin[self.block.begin .. self.block.end]
    }

    /// The block's bytes as a shared slice.
    pub fn bytes(&self) -> crate::bytes::arc::Bytes {
        self.pin.bytes().slice(self.block.begin .. self.block.end)
    }

    /// The block's description.
    pub fn block(&self) -> &Block { &self.block }

    /// The worker holding the pin.
    pub fn local_worker(&self) -> usize { self.pin.local_worker() }

    /// Releases the pin.
    pub fn into_block(self) -> Block { self.block }
}

impl std::ops::Deref for PinnedBlock {
    type Target = Block;
    fn deref(&self) -> &Block { &self.block }
}

impl fmt::Debug for PinnedBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedBlock").field("block", &self.block).field("worker", &self.local_worker()).finish()
    }
}
