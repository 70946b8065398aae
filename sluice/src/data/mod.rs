//! The data layer: memory-managed blocks, files of serialized items, and streams between workers.
//!
//! Every host owns one [`BlockPool`], which accounts for the bytes of all blocks, evicts
//! unpinned blocks to swap under memory pressure, and makes allocations wait at the hard limit.
//! Items are serialized into blocks by a [`BlockWriter`] and read back by a [`BlockReader`].
//! A [`File`] keeps blocks for later, while [`CatStream`]s and [`MixStream`]s move them to other
//! workers through the host's [`Multiplexer`].

pub mod block;
pub mod block_pool;
pub mod block_queue;
pub mod block_reader;
pub mod block_writer;
pub mod byte_block;
pub mod cat_stream;
pub mod file;
pub mod mix_stream;
pub mod multiplexer;
pub mod multiplexer_header;
pub mod stream;
mod swap;

pub use block::{Block, PinnedBlock};
pub use block_pool::{BlockPool, ByteBuffer, PoolStats};
pub use block_reader::{BlockReader, BlockSource, VecBlockSource};
pub use block_writer::{BlockSink, BlockWriter};
pub use byte_block::{ByteBlock, ByteBlockPtr, PinnedByteBlockPtr};
pub use cat_stream::{CatReader, CatStream};
pub use file::{ConsumeFileReader, File, FileWriter, KeepFileReader};
pub use mix_stream::{MixReader, MixStream};
pub use multiplexer::{DispatchGuard, Multiplexer};
pub use multiplexer_header::{MagicByte, StreamBlockHeader};
pub use stream::{StreamId, StreamStats, StreamWriters};
