//! Events of the data layer and the reduce core, and the file sink selected by `SLUICE_LOG`.

use std::fs::File;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::communication::logging::{CollectiveEvent, CommunicationEvent, CommunicationSetup, FlowLogger, LogFn};
use crate::logging_core::{into_action, line_writer, Logger, Registry};

/// Who logged an event: a host, and a worker on it for worker-level events.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct WorkerIdentifier {
    /// Rank of the host.
    pub host: usize,
    /// Global rank of the worker, `None` for host-wide structures like the block pool.
    pub worker: Option<usize>,
}

/// Logger for sluice events.
pub type SluiceLogger = Logger<SluiceEvent, WorkerIdentifier>;

/// Collective events are logged by the communication crate under this type.
pub type FlowEvent = CollectiveEvent;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Hash, Eq, PartialEq)]
/// Something the block pool did to a block.
pub enum PoolAction {
    /// A fresh block was allocated.
    Allocate,
    /// A received buffer became a block.
    Adopt,
    /// An unpinned block was written to swap and its memory released.
    Evict,
    /// A swapped or external block was read back on pin.
    Load,
    /// The last handle to a block was dropped.
    Free,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Hash, Eq, PartialEq)]
/// A block pool event.
pub struct BlockPoolEvent {
    /// What happened.
    pub action: PoolAction,
    /// Pool-unique block id.
    pub block: u64,
    /// Size of the block in bytes.
    pub bytes: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Hash, Eq, PartialEq, Default)]
/// Block pool counters.
pub struct PoolStatsEvent {
    /// Bytes resident in memory.
    pub total_bytes: usize,
    /// Highest value `total_bytes` reached.
    pub max_total_bytes: usize,
    /// Live blocks, resident or not.
    pub total_blocks: usize,
    /// Blocks with at least one pin.
    pub pinned_blocks: usize,
    /// Blocks whose bytes are only in the swap file.
    pub swapped_blocks: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Hash, Eq, PartialEq, Default)]
/// Items, bytes and blocks moved in one direction.
pub struct Traffic {
    /// Items.
    pub items: usize,
    /// Payload bytes.
    pub bytes: usize,
    /// Blocks, not counting close sentinels.
    pub blocks: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Hash, Eq, PartialEq)]
/// What happened on a stream.
pub enum StreamAction {
    /// A block left for `peer`.
    Sent {
        /// Receiving worker.
        peer: usize,
        /// Payload bytes.
        bytes: usize,
    },
    /// A sender's close sentinel arrived.
    SenderClosed {
        /// The sending worker.
        peer: usize,
    },
    /// The stream was dropped by its worker.
    Closed {
        /// Totals written.
        tx: Traffic,
        /// Totals received.
        rx: Traffic,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Hash, Eq, PartialEq)]
/// A stream event.
pub struct StreamEvent {
    /// Stream id, equal on all workers.
    pub stream_id: usize,
    /// True for a mix stream.
    pub mix: bool,
    /// What happened.
    pub action: StreamAction,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Hash, Eq, PartialEq)]
/// What a reduce table did.
pub enum ReduceAction {
    /// A partition doubled its buckets.
    Grow,
    /// A partition was written out and cleared.
    Spill,
    /// A partition was emitted.
    Flush,
    /// The post phase started another round on spilled data.
    Round,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Hash, Eq, PartialEq)]
/// A reduce table event.
pub struct ReduceEvent {
    /// What happened.
    pub action: ReduceAction,
    /// Partition concerned, or the round number for `Round`.
    pub partition: usize,
    /// Items involved.
    pub items: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, Hash, Eq, PartialEq)]
/// An event of the data layer or reduce core.
pub enum SluiceEvent {
    /// Block pool activity.
    BlockPool(BlockPoolEvent),
    /// Block pool counters.
    PoolStats(PoolStatsEvent),
    /// Stream activity.
    Stream(StreamEvent),
    /// Reduce table activity.
    Reduce(ReduceEvent),
    /// Unstructured text.
    Text(String),
}

impl From<BlockPoolEvent> for SluiceEvent { fn from(v: BlockPoolEvent) -> Self { SluiceEvent::BlockPool(v) } }
impl From<PoolStatsEvent> for SluiceEvent { fn from(v: PoolStatsEvent) -> Self { SluiceEvent::PoolStats(v) } }
impl From<StreamEvent> for SluiceEvent { fn from(v: StreamEvent) -> Self { SluiceEvent::Stream(v) } }
impl From<ReduceEvent> for SluiceEvent { fn from(v: ReduceEvent) -> Self { SluiceEvent::Reduce(v) } }
impl From<String> for SluiceEvent { fn from(v: String) -> Self { SluiceEvent::Text(v) } }

/// A file shared by all loggers of a process.
#[derive(Clone)]
struct SharedFile(Arc<Mutex<File>>);

impl Write for SharedFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().map_err(|_| std::io::Error::other("log file poisoned"))?.write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().map_err(|_| std::io::Error::other("log file poisoned"))?.flush()
    }
}

/// The destination of all events when logging is enabled.
#[derive(Clone)]
pub struct LogSink {
    time: Instant,
    file: SharedFile,
}

impl LogSink {
    /// Opens the file named by `SLUICE_LOG`, or returns `None` if it is unset.
    pub fn from_env() -> std::io::Result<Option<LogSink>> {
        match std::env::var_os("SLUICE_LOG") {
            Some(path) => LogSink::create(path).map(Some),
            None => Ok(None),
        }
    }

    /// Creates (truncating) the file at `path`.
    pub fn create<P: AsRef<std::path::Path>>(path: P) -> std::io::Result<LogSink> {
        let file = File::create(path)?;
        Ok(LogSink { time: Instant::now(), file: SharedFile(Arc::new(Mutex::new(file))) })
    }

    /// Binds the `"sluice"` log of `registry` to this sink.
    pub fn install(&self, registry: &mut Registry<WorkerIdentifier>) {
        registry.insert::<SluiceEvent, _>("sluice", line_writer(self.file.clone()));
    }

    /// A logger for host-wide structures of `host`.
    pub fn host_logger(&self, host: usize) -> SluiceLogger {
        let action = into_action(line_writer::<SluiceEvent, WorkerIdentifier, _>(self.file.clone()));
        Logger::new(self.time, WorkerIdentifier { host, worker: None }, action)
    }

    /// A logger for the collectives of worker `rank`.
    pub fn flow_logger(&self, rank: usize) -> FlowLogger {
        let action = into_action(line_writer::<CollectiveEvent, usize, _>(self.file.clone()));
        Logger::new(self.time, rank, action)
    }

    /// Produces loggers for the threads that drive TCP links.
    pub fn communication_log_fn(&self) -> LogFn {
        let sink = self.clone();
        Arc::new(move |setup: CommunicationSetup| {
            let action = into_action(line_writer::<CommunicationEvent, CommunicationSetup, _>(sink.file.clone()));
            Some(Logger::new(sink.time, setup, action))
        })
    }

    /// The instant all timestamps are relative to.
    pub fn time(&self) -> Instant { self.time }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_writes_identified_lines() {
        let path = std::env::temp_dir().join(format!("sluice-log-test-{}", std::process::id()));
        let sink = LogSink::create(&path).unwrap();
        let mut registry = Registry::new(sink.time(), WorkerIdentifier { host: 1, worker: Some(3) });
        sink.install(&mut registry);

        let logger = registry.get::<SluiceEvent>("sluice").unwrap();
        logger.log(ReduceEvent { action: ReduceAction::Spill, partition: 2, items: 17 });
        drop(logger);
        let host = sink.host_logger(1);
        host.log(BlockPoolEvent { action: PoolAction::Evict, block: 5, bytes: 64 });
        drop(host);

        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("worker: Some(3)") && lines[0].contains("Spill"));
        assert!(lines[1].contains("worker: None") && lines[1].contains("Evict"));
    }
}
