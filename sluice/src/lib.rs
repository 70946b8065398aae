//! Sluice moves and reduces data for bulk-synchronous dataflow computations.
//!
//! The code is organized in crates and modules that are meant to depend as little as possible on each other.
//!
//! **Communication**: The [`sluice_communication`] crate connects hosts, and provides the
//! collectives that workers use to agree on sizes, offsets and partitioning decisions.
//!
//! **Data**: The [`data`] module stores serialized items in blocks drawn from a host-wide
//! [`BlockPool`](data::BlockPool) that pins, evicts and reloads them under a memory budget.
//! Blocks form [`File`](data::File)s, which are written and read item by item, and travel
//! between workers on [`CatStream`](data::CatStream)s and [`MixStream`](data::MixStream)s.
//!
//! **Reduction**: The [`core`] module holds the partitioned, open-addressing hash table that
//! combines items by key, spilling partitions to files when memory runs out, and the pre and
//! post phases that run it on both sides of an all-to-all exchange.
//!
//! **Execution**: [`execute`] starts hosts and worker threads and hands each worker a
//! [`Context`](api::Context) through which all of the above is reached.
//!
//! # Examples
//!
//! Counting words across two simulated hosts with two workers each.
//!
//! ```
//! use sluice::Config;
//!
//! let guards = sluice::execute(Config::mock(2, 2), |ctx| {
//!     let words = ["apple", "pear", "apple", "fig"];
//!     let mine: Vec<(String, u64)> = words
//!         .iter()
//!         .skip(ctx.my_rank())
//!         .step_by(ctx.num_workers())
//!         .map(|w| (w.to_string(), 1))
//!         .collect();
//!     ctx.reduce_pair(mine, |a, b| a + b)
//! }).unwrap();
//!
//! let mut counts: Vec<(String, u64)> = guards
//!     .join()
//!     .into_iter()
//!     .flat_map(|result| result.unwrap().unwrap())
//!     .collect();
//! counts.sort();
//! assert_eq!(counts, vec![("apple".to_string(), 2), ("fig".to_string(), 1), ("pear".to_string(), 1)]);
//! ```

#![forbid(missing_docs)]

pub use execute::{execute, execute_single, Config};
#[cfg(feature = "getopts")]
pub use execute::execute_from_args;

pub use sluice_communication::Config as CommunicationConfig;
pub use config::{MemoryConfig, ReduceConfig};
pub use api::Context;

/// Re-export of the `sluice_communication` crate.
pub mod communication {
    pub use sluice_communication::*;
}

/// Re-export of the `sluice_bytes` crate.
pub mod bytes {
    pub use sluice_bytes::*;
}

/// Re-export of the `sluice_logging` crate.
pub mod logging_core {
    pub use sluice_logging::*;
}

pub mod api;
pub mod config;
pub mod core;
pub mod data;
pub mod execute;
pub mod logging;
pub mod memory;

/// Failures of data movement and reduction.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The block pool could not stay below its hard limit.
    #[error("out of memory: {requested} bytes requested with {in_use} of {hard_limit} bytes in use")]
    OutOfMemory {
        /// Bytes asked for.
        requested: usize,
        /// The pool's hard limit.
        hard_limit: usize,
        /// Bytes resident when the request failed.
        in_use: usize,
    },
    /// A host link failed.
    #[error(transparent)]
    Communication(#[from] sluice_communication::Error),
    /// A received block header was malformed or addressed to nobody.
    #[error("bad stream block header: {0}")]
    BadHeader(String),
    /// The connection behind a stream dropped before all of its senders closed.
    #[error("stream {stream_id} aborted: {reason}")]
    StreamAborted {
        /// The stream that cannot complete.
        stream_id: usize,
        /// What went wrong.
        reason: String,
    },
    /// An item or value could not be encoded or decoded.
    #[error("serialization failed: {0}")]
    Serialization(#[from] bincode::Error),
    /// Reading or writing swap storage failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// Data ended in the middle of an item, or an index was past the end.
    #[error("data format error: {0}")]
    Format(String),
    /// Re-reducing spilled items stopped combining or splitting them, so the table is too
    /// small for the keys of one partition.
    #[error("reduction stalled after {rounds} rounds with {items} items left")]
    ReduceStalled {
        /// Rounds run.
        rounds: usize,
        /// Items still spilled.
        items: usize,
    },
    /// An auxiliary thread panicked.
    #[error("thread failed: {0}")]
    Thread(String),
}

/// Result type of data movement and reduction.
pub type Result<T> = std::result::Result<T, Error>;
