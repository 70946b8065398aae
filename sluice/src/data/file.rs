//! Files: append-only sequences of blocks holding one dataset partition.

use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::data::block::{Block, PinnedBlock};
use crate::data::block_pool::BlockPool;
use crate::data::block_reader::{BlockReader, BlockSource, VecBlockSource};
use crate::data::block_writer::{BlockSink, BlockWriter};
use crate::{Error, Result};

/// An ordered list of blocks and the number of items in them.
///
/// Blocks are kept unpinned, so the pool may evict them while nobody reads.
pub struct File {
    pool: Arc<BlockPool>,
    local_worker: usize,
    dia_id: usize,
    block_size: usize,
    blocks: Vec<Block>,
    /// Inclusive running sum of `num_items` over `blocks`.
    num_items_sum: Vec<usize>,
    size_bytes: usize,
}

/// Writes items to the end of a [`File`].
pub type FileWriter<'a> = BlockWriter<&'a mut File>;

/// Reads a [`File`], leaving it intact.
pub type KeepFileReader<'a> = BlockReader<KeepFileBlockSource<'a>>;

/// Reads a [`File`] while taking its blocks away.
pub type ConsumeFileReader = BlockReader<VecBlockSource>;

impl File {
    /// An empty file owned by `local_worker`, tagged with the id of the operator that made it.
    pub fn new(pool: Arc<BlockPool>, local_worker: usize, dia_id: usize, block_size: usize) -> Self {
        File {
            pool,
            local_worker,
            dia_id,
            block_size,
            blocks: Vec::new(),
            num_items_sum: Vec::new(),
            size_bytes: 0,
        }
    }

    /// A writer appending to this file.
    pub fn writer(&mut self) -> FileWriter<'_> {
        let block_size = self.block_size;
        BlockWriter::new(self, block_size)
    }

    /// A writer appending to this file with a specific block size.
    pub fn writer_with_block_size(&mut self, block_size: usize) -> FileWriter<'_> {
        BlockWriter::new(self, block_size)
    }

    /// Appends a block.
    pub fn append_block(&mut self, block: Block) {
        if block.size() == 0 {
            return;
        }
        self.size_bytes += block.size();
        self.num_items_sum.push(self.num_items() + block.num_items());
        self.blocks.push(block);
    }

    /// Number of items.
    pub fn num_items(&self) -> usize {
        self.num_items_sum.last().copied().unwrap_or(0)
    }

    /// True if the file holds no items.
    pub fn is_empty(&self) -> bool { self.num_items() == 0 }

    /// Number of blocks.
    pub fn num_blocks(&self) -> usize { self.blocks.len() }

    /// Total bytes in the blocks.
    pub fn size_bytes(&self) -> usize { self.size_bytes }

    /// The blocks.
    pub fn blocks(&self) -> &[Block] { &self.blocks }

    /// The id of the operator that made the file.
    pub fn dia_id(&self) -> usize { self.dia_id }

    /// The worker reading and writing the file.
    pub fn local_worker(&self) -> usize { self.local_worker }

    /// Number of items starting before block `index`.
    pub fn items_before_block(&self, index: usize) -> usize {
        if index == 0 { 0 } else { self.num_items_sum[index - 1] }
    }

    /// A reader that leaves the file intact, so it can be read again.
    pub fn reader(&self) -> KeepFileReader<'_> {
        BlockReader::new(KeepFileBlockSource { file: self, next: 0 })
    }

    /// A reader that takes the blocks out of the file, releasing each as soon as it is read.
    ///
    /// The file is empty afterwards.
    pub fn consume_reader(&mut self) -> ConsumeFileReader {
        let blocks = std::mem::take(&mut self.blocks);
        self.num_items_sum.clear();
        self.size_bytes = 0;
        BlockReader::new(VecBlockSource::new(blocks, self.local_worker))
    }

    /// Reads the item at `index`, scanning from the start of the block it begins in.
    pub fn get_item_at<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        if index >= self.num_items() {
            return Err(Error::Format(format!("item {} requested from a file of {} items", index, self.num_items())));
        }
        // the block holding `index` is the first whose running sum exceeds it
        let block = self.num_items_sum.partition_point(|&sum| sum <= index);
        let mut reader = BlockReader::new(KeepFileBlockSource { file: self, next: block });
        reader.skip::<T>(index - self.items_before_block(block))?;
        reader.next()
    }

    /// Drops all blocks.
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.num_items_sum.clear();
        self.size_bytes = 0;
    }
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("dia_id", &self.dia_id)
            .field("blocks", &self.blocks.len())
            .field("items", &self.num_items())
            .field("bytes", &self.size_bytes)
            .finish()
    }
}

impl BlockSink for &mut File {
    fn block_pool(&self) -> &Arc<BlockPool> { &self.pool }
    fn local_worker_id(&self) -> usize { self.local_worker }
    fn append_block(&mut self, block: PinnedBlock, _is_last: bool) -> Result<()> {
        File::append_block(self, block.into_block());
        Ok(())
    }
    fn close(&mut self) -> Result<()> { Ok(()) }
}

/// Pins the blocks of a file one after another, from a starting block.
pub struct KeepFileBlockSource<'a> {
    file: &'a File,
    next: usize,
}

impl BlockSource for KeepFileBlockSource<'_> {
    fn next_block(&mut self) -> Result<Option<PinnedBlock>> {
        match self.file.blocks.get(self.next) {
            Some(block) => {
                self.next += 1;
                block.pin(self.file.local_worker).map(Some)
            },
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Arc<BlockPool> {
        Arc::new(BlockPool::unlimited(1))
    }

    #[test]
    fn items_spanning_blocks_read_back() {
        let mut file = File::new(pool(), 0, 0, 7);
        let items: Vec<String> = (0 .. 50).map(|i| "x".repeat(i % 13)).collect();
        let mut writer = file.writer();
        writer.put_all(&items).unwrap();
        writer.close().unwrap();
        drop(writer);

        assert_eq!(file.num_items(), 50);
        assert!(file.num_blocks() > 10);
        assert_eq!(file.reader().read_all::<String>().unwrap(), items);
        for index in [0, 1, 12, 13, 37, 49] {
            assert_eq!(file.get_item_at::<String>(index).unwrap(), items[index]);
        }
        assert!(file.get_item_at::<String>(50).is_err());
    }

    #[test]
    fn consume_reader_empties_the_file() {
        let pool = pool();
        let mut file = File::new(Arc::clone(&pool), 0, 0, 64);
        {
            let mut writer = file.writer();
            for i in 0u32 .. 100 {
                writer.put(&i).unwrap();
            }
        }
        let mut reader = file.consume_reader();
        assert!(file.is_empty());
        let mut expected = 0u32;
        while reader.has_next().unwrap() {
            assert_eq!(reader.next::<u32>().unwrap(), expected);
            expected += 1;
            // sixteen items per block; blocks behind the current one are gone
            assert_eq!(pool.stats().total_blocks, 7 - (expected as usize - 1) / 16);
        }
        assert_eq!(expected, 100);
        drop(reader);
        assert_eq!(pool.stats().total_blocks, 0);
    }

    #[test]
    fn empty_writer_produces_an_empty_file() {
        let mut file = File::new(pool(), 0, 0, 64);
        file.writer().close().unwrap();
        assert!(file.is_empty());
        assert!(!file.reader().has_next().unwrap());
    }
}
