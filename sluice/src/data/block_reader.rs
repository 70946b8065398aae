//! Deserializes items from a sequence of blocks.

use std::io::Read;

use serde::de::DeserializeOwned;

use crate::data::block::PinnedBlock;
use crate::{Error, Result};

/// A source of pinned blocks, in order.
pub trait BlockSource {
    /// The next block, or `None` once the source is exhausted.
    fn next_block(&mut self) -> Result<Option<PinnedBlock>>;
}

impl<S: BlockSource + ?Sized> BlockSource for Box<S> {
    fn next_block(&mut self) -> Result<Option<PinnedBlock>> {
        (**self).next_block()
    }
}

/// Reads items from the blocks of a [`BlockSource`].
///
/// Only the current block is pinned by the reader. Items spanning blocks pull the
/// continuation blocks in as they are decoded.
pub struct BlockReader<S: BlockSource> {
    source: S,
    current: Option<PinnedBlock>,
    /// Read position within the current block's data.
    position: usize,
    /// Items starting in the current block that have not been read.
    items_left: usize,
}

impl<S: BlockSource> BlockReader<S> {
    /// A reader over `source`.
    pub fn new(source: S) -> Self {
        BlockReader { source, current: None, position: 0, items_left: 0 }
    }

    /// True if another item can be read.
    pub fn has_next(&mut self) -> Result<bool> {
        while self.items_left == 0 {
            match self.source.next_block()? {
                Some(block) => {
                    self.position = block.first_item_relative();
                    self.items_left = block.num_items();
                    self.current = Some(block);
                },
                None => {
                    self.current = None;
                    return Ok(false);
                },
            }
        }
        Ok(true)
    }

    /// True if an item is known to be available without pulling another block.
    pub(crate) fn has_buffered_item(&self) -> bool { self.items_left > 0 }

    /// Reads the next item.
    pub fn next<T: DeserializeOwned>(&mut self) -> Result<T> {
        if !self.has_next()? {
            return Err(Error::Format("read past the last item".to_owned()));
        }
        self.items_left -= 1;
        let item = bincode::deserialize_from(ItemBytes { reader: self })?;
        Ok(item)
    }

    /// Skips `count` items of type `T`.
    pub fn skip<T: DeserializeOwned>(&mut self, count: usize) -> Result<()> {
        for _ in 0 .. count {
            self.next::<T>()?;
        }
        Ok(())
    }

    /// Reads all remaining items.
    pub fn read_all<T: DeserializeOwned>(&mut self) -> Result<Vec<T>> {
        let mut items = Vec::new();
        while self.has_next()? {
            items.push(self.next()?);
        }
        Ok(items)
    }

    /// An iterator over the remaining items.
    pub fn items<T: DeserializeOwned>(&mut self) -> Items<'_, S, T> {
        Items { reader: self, marker: std::marker::PhantomData }
    }

    /// Moves to the next block in the middle of an item.
    fn continue_item(&mut self) -> std::io::Result<bool> {
        match self.source.next_block() {
            Ok(Some(block)) => {
                self.position = 0;
                self.items_left = block.num_items();
                self.current = Some(block);
                Ok(true)
            },
            Ok(None) => Ok(false),
            Err(error) => Err(std::io::Error::other(error.to_string())),
        }
    }
}

/// The bytes of one item, continuing across blocks.
struct ItemBytes<'a, S: BlockSource> {
    reader: &'a mut BlockReader<S>,
}

impl<S: BlockSource> Read for ItemBytes<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if let Some(block) = &self.reader.current {
                let data = &block.data()[self.reader.position ..];
                if !data.is_empty() {
                    let count = data.len().min(buf.len());
                    buf[.. count].copy_from_slice(&data[.. count]);
                    self.reader.position += count;
                    return Ok(count);
                }
            }
            if buf.is_empty() || !self.reader.continue_item()? {
                return Ok(0);
            }
        }
    }
}

/// Iterator over the items of a [`BlockReader`].
pub struct Items<'a, S: BlockSource, T> {
    reader: &'a mut BlockReader<S>,
    marker: std::marker::PhantomData<T>,
}

impl<S: BlockSource, T: DeserializeOwned> Iterator for Items<'_, S, T> {
    type Item = Result<T>;
    fn next(&mut self) -> Option<Result<T>> {
        match self.reader.has_next() {
            Ok(true) => Some(self.reader.next()),
            Ok(false) => None,
            Err(error) => Some(Err(error)),
        }
    }
}

/// A source over a fixed list of blocks.
pub struct VecBlockSource {
    blocks: std::vec::IntoIter<crate::data::Block>,
    local_worker: usize,
}

impl VecBlockSource {
    /// Pins `blocks` one at a time for `local_worker`.
    pub fn new(blocks: Vec<crate::data::Block>, local_worker: usize) -> Self {
        VecBlockSource { blocks: blocks.into_iter(), local_worker }
    }
}

impl BlockSource for VecBlockSource {
    fn next_block(&mut self) -> Result<Option<PinnedBlock>> {
        self.blocks.next().map(|block| block.pin(self.local_worker)).transpose()
    }
}
