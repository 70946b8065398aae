//! What a worker reaches the data layer, the collectives and the reduce core through.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::api::reduce_node::ReduceNode;
use crate::api::stage::Stage;
use crate::communication::{FlowControlChannel, FlowControlShared, HostNetwork};
use crate::config::{MemoryConfig, ReduceConfig};
use crate::core::TableContext;
use crate::data::{BlockPool, CatStream, DispatchGuard, File, MixStream, Multiplexer};
use crate::logging::{LogSink, SluiceEvent, SluiceLogger, WorkerIdentifier};
use crate::logging_core::Registry;
use crate::memory::MemoryTracker;
use crate::{Error, Result};

/// Index of the links the flow control collectives use.
pub(crate) const FLOW_GROUP: usize = 0;
/// Index of the links the stream multiplexer uses.
pub(crate) const DATA_GROUP: usize = 1;
/// Number of link groups each host network must provide.
pub(crate) const NUM_GROUPS: usize = 2;

/// Resources shared by the workers of one host.
pub struct HostContext {
    host_rank: usize,
    num_hosts: usize,
    workers_per_host: usize,
    memory: MemoryConfig,
    reduce: ReduceConfig,
    tracker: Arc<MemoryTracker>,
    pool: Arc<BlockPool>,
    multiplexer: Arc<Multiplexer>,
    flow: Arc<FlowControlShared>,
    sink: Option<LogSink>,
    start: Instant,
}

impl HostContext {
    /// Builds the block pool, multiplexer and collectives of the host behind `network`.
    ///
    /// The returned guard joins the multiplexer's dispatchers; drop it after every host context
    /// of the process.
    pub fn new(
        network: &mut HostNetwork,
        workers_per_host: usize,
        memory: MemoryConfig,
        reduce: ReduceConfig,
        sink: Option<LogSink>,
    ) -> Result<(Arc<HostContext>, DispatchGuard)> {
        let host_rank = network.host_rank;
        let missing = |group: usize| Error::Format(format!("links of group {} already taken", group));
        let group = network.take_group(FLOW_GROUP).ok_or_else(|| missing(FLOW_GROUP))?;
        let links = network.take_links(DATA_GROUP).ok_or_else(|| missing(DATA_GROUP))?;

        let logger = sink.as_ref().map(|sink| sink.host_logger(host_rank));
        // block memory has its own limits in the pool; the tracker covers what workers hold besides
        let tracker = MemoryTracker::new(memory.ram_floating() + memory.ram_workers());
        let pool = Arc::new(BlockPool::from_config(&memory, workers_per_host, logger.clone()));
        let (multiplexer, dispatch) = Multiplexer::new(host_rank, workers_per_host, Arc::clone(&pool), links, logger)?;
        let flow = Arc::new(FlowControlShared::new(Arc::new(group), workers_per_host));

        let host = HostContext {
            host_rank,
            num_hosts: network.num_hosts,
            workers_per_host,
            memory,
            reduce,
            tracker,
            pool,
            multiplexer,
            flow,
            start: sink.as_ref().map_or_else(Instant::now, LogSink::time),
            sink,
        };
        Ok((Arc::new(host), dispatch))
    }

    /// Rank of this host.
    pub fn host_rank(&self) -> usize { self.host_rank }

    /// Number of hosts.
    pub fn num_hosts(&self) -> usize { self.num_hosts }

    /// Worker threads per host.
    pub fn workers_per_host(&self) -> usize { self.workers_per_host }

    /// The host's block pool.
    pub fn block_pool(&self) -> &Arc<BlockPool> { &self.pool }

    /// The host's stream multiplexer.
    pub fn multiplexer(&self) -> &Arc<Multiplexer> { &self.multiplexer }
}

/// The handle of one worker.
///
/// Streams and nodes must be created in the same order on every worker, as that order is
/// what matches them up across workers.
pub struct Context {
    host: Arc<HostContext>,
    local_worker: usize,
    flow: FlowControlChannel,
    registry: Registry<WorkerIdentifier>,
    logger: Option<SluiceLogger>,
    next_dia_id: usize,
}

impl Context {
    /// The context of worker `local_worker` of `host`.
    pub fn new(host: Arc<HostContext>, local_worker: usize) -> Self {
        let identifier = WorkerIdentifier { host: host.host_rank, worker: Some(local_worker) };
        let mut registry = Registry::new(host.start, identifier);
        let mut flow = FlowControlChannel::new(Arc::clone(&host.flow), local_worker);
        if let Some(sink) = &host.sink {
            sink.install(&mut registry);
            flow.set_logger(Some(sink.flow_logger(host.host_rank * host.workers_per_host + local_worker)));
        }
        let logger = registry.get::<SluiceEvent>("sluice");
        Context { host, local_worker, flow, registry, logger, next_dia_id: 0 }
    }

    /// Global rank of this worker.
    pub fn my_rank(&self) -> usize { self.host.host_rank * self.host.workers_per_host + self.local_worker }

    /// Number of workers in the computation.
    pub fn num_workers(&self) -> usize { self.host.num_hosts * self.host.workers_per_host }

    /// Index of this worker on its host.
    pub fn local_worker(&self) -> usize { self.local_worker }

    /// Rank of this worker's host.
    pub fn host_rank(&self) -> usize { self.host.host_rank }

    /// Number of hosts.
    pub fn num_hosts(&self) -> usize { self.host.num_hosts }

    /// Worker threads per host.
    pub fn workers_per_host(&self) -> usize { self.host.workers_per_host }

    /// The host's resources.
    pub fn host(&self) -> &Arc<HostContext> { &self.host }

    /// The host's block pool.
    pub fn block_pool(&self) -> &Arc<BlockPool> { &self.host.pool }

    /// The host's memory account.
    pub fn tracker(&self) -> &Arc<MemoryTracker> { &self.host.tracker }

    /// Memory configuration.
    pub fn memory_config(&self) -> &MemoryConfig { &self.host.memory }

    /// Reduce table configuration.
    pub fn reduce_config(&self) -> &ReduceConfig { &self.host.reduce }

    /// Bytes this worker may spend on its own data structures.
    pub fn mem_limit(&self) -> usize { self.host.memory.ram_per_worker(self.host.workers_per_host) }

    /// Block size of files and streams.
    pub fn block_size(&self) -> usize { self.host.memory.block_size }

    /// The collectives among all workers.
    pub fn flow(&self) -> &FlowControlChannel { &self.flow }

    /// The logger of data layer and reduce events, if logging is enabled.
    pub fn logger(&self) -> Option<SluiceLogger> { self.logger.clone() }

    /// The worker's log registry.
    pub fn log_register(&mut self) -> &mut Registry<WorkerIdentifier> { &mut self.registry }

    /// A fresh operator id, equal on all workers that call this in the same order.
    pub fn next_dia_id(&mut self) -> usize {
        self.next_dia_id += 1;
        self.next_dia_id
    }

    /// An empty file of this worker.
    pub fn new_file(&self, dia_id: usize) -> File {
        File::new(Arc::clone(&self.host.pool), self.local_worker, dia_id, self.block_size())
    }

    /// A new cat stream among all workers.
    pub fn new_cat_stream(&self) -> Result<CatStream> {
        self.host.multiplexer.new_cat_stream(self.local_worker)
    }

    /// A new mix stream among all workers.
    pub fn new_mix_stream(&self) -> Result<MixStream> {
        self.host.multiplexer.new_mix_stream(self.local_worker)
    }

    /// What a reduce table of operator `dia_id` runs with.
    pub fn table_context(&self, dia_id: usize) -> TableContext {
        TableContext {
            pool: Arc::clone(&self.host.pool),
            local_worker: self.local_worker,
            dia_id,
            block_size: self.block_size(),
            tracker: Some(Arc::clone(&self.host.tracker)),
            logger: self.logger(),
            config: self.host.reduce.clone(),
        }
    }

    /// Reduces `items` of all workers by `key`, combining items with equal keys using `reduce`.
    ///
    /// Each worker returns the reduced items whose keys hash to it.
    pub fn reduce_by_key<T, K, KF, R>(&mut self, items: Vec<T>, key: KF, reduce: R) -> Result<Vec<T>>
    where
        T: Serialize + DeserializeOwned + Clone + Send + 'static,
        K: Eq + Hash + Default + Clone + Serialize + DeserializeOwned + Send + 'static,
        KF: Fn(&T) -> K,
        R: Fn(&T, &T) -> T + Clone + Send + 'static,
    {
        let pairs = items.into_iter().map(|item| (key(&item), item)).collect();
        let reduced = self.reduce_pair(pairs, reduce)?;
        Ok(reduced.into_iter().map(|(_, item)| item).collect())
    }

    /// Reduces key-value pairs of all workers, combining values of equal keys using `reduce`.
    ///
    /// Each worker returns the pairs whose keys hash to it.
    pub fn reduce_pair<K, V, R>(&mut self, pairs: Vec<(K, V)>, reduce: R) -> Result<Vec<(K, V)>>
    where
        K: Eq + Hash + Default + Clone + Serialize + DeserializeOwned + Send + 'static,
        V: Clone + Serialize + DeserializeOwned + Send + 'static,
        R: Fn(&V, &V) -> V + Clone + Send + 'static,
    {
        let mut node = ReduceNode::new(self, reduce)?;
        node.start_pre_op()?;
        for pair in pairs {
            node.pre_op(pair)?;
        }
        node.stop_pre_op()?;
        node.execute()?;
        let mut output = Vec::new();
        node.push_data(true, &mut |pair: &(K, V)| {
            output.push(pair.clone());
            Ok(())
        })?;
        node.dispose();
        Ok(output)
    }
}
