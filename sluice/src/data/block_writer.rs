//! Serializes items into blocks and hands full blocks to a sink.

use std::sync::Arc;

use serde::Serialize;

use crate::data::block::PinnedBlock;
use crate::data::block_pool::{BlockPool, ByteBuffer};
use crate::{Error, Result};

/// A destination of the blocks a [`BlockWriter`] produces.
pub trait BlockSink {
    /// The pool new blocks are allocated from.
    fn block_pool(&self) -> &Arc<BlockPool>;
    /// The worker that pins the blocks.
    fn local_worker_id(&self) -> usize;
    /// Accepts a finished block; `is_last` marks the final block of this writer.
    fn append_block(&mut self, block: PinnedBlock, is_last: bool) -> Result<()>;
    /// Called once, when the writer closes without a final block to mark.
    fn close(&mut self) -> Result<()>;
    /// Reports a close that failed while the writer was dropped.
    fn close_failed(&self, error: &Error) {
        self.block_pool().log_text(format!("writer of worker {} failed to close: {}", self.local_worker_id(), error));
    }
}

/// Writes items into blocks of `block_size` bytes.
///
/// Items are encoded with bincode; an item that does not fit the rest of a block continues in
/// the next one. The writer closes on drop if not closed before, reporting errors to the sink.
pub struct BlockWriter<S: BlockSink> {
    sink: S,
    block_size: usize,
    buffer: Option<ByteBuffer>,
    /// Offset of the first item starting in the current buffer.
    first_item: Option<usize>,
    /// Items starting in the current buffer.
    num_items: usize,
    scratch: Vec<u8>,
    closed: bool,
}

impl<S: BlockSink> BlockWriter<S> {
    /// A writer into `sink`.
    pub fn new(sink: S, block_size: usize) -> Self {
        BlockWriter {
            sink,
            block_size: block_size.max(1),
            buffer: None,
            first_item: None,
            num_items: 0,
            scratch: Vec::new(),
            closed: false,
        }
    }

    /// Appends one item.
    pub fn put<T: Serialize + ?Sized>(&mut self, item: &T) -> Result<()> {
        debug_assert!(!self.closed, "put into closed writer");
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        bincode::serialize_into(&mut scratch, item)?;
        let result = self.put_encoded(&scratch);
        self.scratch = scratch;
        result
    }

    /// Appends one item already encoded by bincode.
    pub fn put_encoded(&mut self, mut bytes: &[u8]) -> Result<()> {
        let buffer = self.writable()?;
        let start = buffer.len();
        if self.first_item.is_none() {
            self.first_item = Some(start);
        }
        self.num_items += 1;
        loop {
            let buffer = self.writable()?;
            let taken = buffer.extend_from_slice(bytes);
            bytes = &bytes[taken ..];
            if bytes.is_empty() {
                return Ok(());
            }
            self.flush_block(false)?;
        }
    }

    /// Appends every item of `items`.
    pub fn put_all<'a, T: Serialize + 'a, I: IntoIterator<Item = &'a T>>(&mut self, items: I) -> Result<()> {
        for item in items {
            self.put(item)?;
        }
        Ok(())
    }

    /// The current buffer, after making sure it has room for at least one byte.
    fn writable(&mut self) -> Result<&mut ByteBuffer> {
        if self.buffer.as_ref().is_some_and(|buffer| buffer.remaining() == 0) {
            self.flush_block(false)?;
        }
        if self.buffer.is_none() {
            let pool = Arc::clone(self.sink.block_pool());
            self.buffer = Some(pool.allocate(self.block_size, self.sink.local_worker_id())?);
        }
        Ok(self.buffer.as_mut().expect("buffer allocated above"))
    }

    fn flush_block(&mut self, is_last: bool) -> Result<bool> {
        match self.buffer.take() {
            Some(buffer) if !buffer.is_empty() => {
                let end = buffer.len();
                let first_item = self.first_item.take().unwrap_or(end);
                let num_items = std::mem::take(&mut self.num_items);
                let block = PinnedBlock::new(buffer.freeze(), 0, end, first_item, num_items);
                self.sink.append_block(block, is_last)?;
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    /// Hands the partially filled block to the sink now.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_block(false).map(|_| ())
    }

    /// Flushes the last block, marking it as last, and closes the sink.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if !self.flush_block(true)? {
            self.sink.close()?;
        }
        Ok(())
    }

    /// True once closed.
    pub fn is_closed(&self) -> bool { self.closed }

    /// The sink.
    pub fn sink(&self) -> &S { &self.sink }
}

impl<S: BlockSink> Drop for BlockWriter<S> {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            self.sink.close_failed(&error);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use crate::data::block::PinnedBlock;
    use crate::data::BlockPool;
    use crate::{Error, Result};

    use super::{BlockSink, BlockWriter};

    /// Collects blocks, and fails to close once told to.
    struct Recorder {
        pool: Arc<BlockPool>,
        blocks: Vec<(usize, usize, bool)>,
        refuse_close: bool,
        failures: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn new(refuse_close: bool) -> (Self, Arc<Mutex<Vec<String>>>) {
            let failures = Arc::new(Mutex::new(Vec::new()));
            let recorder = Recorder { pool: Arc::new(BlockPool::unlimited(1)), blocks: Vec::new(), refuse_close, failures: Arc::clone(&failures) };
            (recorder, failures)
        }
    }

    impl BlockSink for Recorder {
        fn block_pool(&self) -> &Arc<BlockPool> { &self.pool }
        fn local_worker_id(&self) -> usize { 0 }
        fn append_block(&mut self, block: PinnedBlock, is_last: bool) -> Result<()> {
            self.blocks.push((block.size(), block.num_items(), is_last));
            Ok(())
        }
        fn close(&mut self) -> Result<()> {
            if self.refuse_close {
                return Err(Error::Format("peer went away".to_owned()));
            }
            Ok(())
        }
        fn close_failed(&self, error: &Error) {
            self.failures.lock().unwrap().push(error.to_string());
        }
    }

    #[test]
    fn items_span_blocks_and_the_last_is_marked() {
        let (recorder, failures) = Recorder::new(false);
        let mut writer = BlockWriter::new(recorder, 10);
        // each u64 encodes to eight bytes
        for item in 0 .. 3u64 {
            writer.put(&item).unwrap();
        }
        writer.close().unwrap();
        assert_eq!(writer.sink().blocks, vec![(10, 2, false), (10, 1, false), (4, 0, true)]);
        drop(writer);
        assert!(failures.lock().unwrap().is_empty());
    }

    #[test]
    fn dropping_reports_a_failed_close() {
        let (recorder, failures) = Recorder::new(true);
        let writer = BlockWriter::new(recorder, 64);
        drop(writer);
        let failures = failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("peer went away"));
    }
}
