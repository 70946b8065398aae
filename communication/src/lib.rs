//! Host-to-host communication for sluice: message links, host collectives, and flow control.
//!
//! Every host in a computation holds one [`Link`] to every other host for each communication
//! group it participates in. A link carries whole messages as [`Bytes`], in order, and is
//! backed either by a TCP connection (driven by a pair of send and receive threads) or, for
//! single-process testing, by in-memory channels.
//!
//! A [`Group`] wraps the links of one communication group and implements the collective
//! operations hosts use to agree on things: broadcast, reduce, prefix sums and barriers.
//! Within a host, worker threads combine through a [`ThreadBarrier`] so that each collective
//! issues exactly one network operation per host. [`FlowControlChannel`] packages both levels
//! behind a per-worker handle.
//!
//! # Examples
//! ```
//! use std::sync::Arc;
//! use sluice_communication::{Config, FlowControlChannel, FlowControlShared, initialize_networks};
//!
//! // two hosts with two worker threads each, all in this process.
//! let config = Config::Mock { hosts: 2, threads: 2 };
//! let networks = initialize_networks(&config, 1, None).unwrap();
//!
//! let mut handles = Vec::new();
//! for mut network in networks {
//!     let group = Arc::new(network.take_group(0).unwrap());
//!     let shared = Arc::new(FlowControlShared::new(group, 2));
//!     for local in 0 .. 2 {
//!         let flow = FlowControlChannel::new(Arc::clone(&shared), local);
//!         handles.push(std::thread::spawn(move || {
//!             flow.ex_prefix_sum(1usize, |x, y| x + y, 0).unwrap()
//!         }));
//!     }
//! }
//!
//! let mut results: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
//! results.sort();
//! assert_eq!(results, vec![0, 1, 2, 3]);
//! ```

#![forbid(missing_docs)]

pub mod barrier;
pub mod flow_control;
pub mod group;
pub mod initialize;
pub mod link;
pub mod logging;
pub mod networking;
pub mod tcp;

pub use sluice_bytes::arc::Bytes;

pub use barrier::ThreadBarrier;
pub use flow_control::{FlowControlChannel, FlowControlShared};
pub use group::Group;
pub use initialize::{initialize_networks, CommsGuard, Config, HostNetwork, WorkerGuards};
pub use link::Link;

/// Failures of host communication.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An operating system level I/O failure, typically while connecting.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The link to `peer` has no connection behind it any more.
    #[error("connection to host {peer} is closed")]
    Disconnected {
        /// The host on the other end of the link.
        peer: usize,
    },
    /// There is no link to `peer` in this group.
    #[error("no link to host {peer}")]
    NoLink {
        /// The requested host.
        peer: usize,
    },
    /// A value could not be encoded or decoded.
    #[error("serialization failed: {0}")]
    Serialization(#[from] bincode::Error),
    /// The connection handshake saw unexpected data.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// A collective failed on the thread that performed it for the host.
    #[error("collective operation failed: {0}")]
    Collective(String),
    /// Configuration could not be parsed or is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type of host communication.
pub type Result<T> = std::result::Result<T, Error>;
