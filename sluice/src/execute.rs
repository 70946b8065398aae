//! Starts a computation from configuration information and per-worker logic.

use std::any::Any;
use std::sync::Arc;

use crate::api::context::{Context, HostContext, NUM_GROUPS};
use crate::communication::{initialize_networks, WorkerGuards};
use crate::CommunicationConfig;
use crate::config::{workers_per_host_from_env, MemoryConfig, ReduceConfig};
use crate::logging::LogSink;
use crate::Result;

/// Configures the execution of a computation.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Hosts, threads, and how hosts are connected.
    pub communication: CommunicationConfig,
    /// RAM budget and block sizes of each host.
    pub memory: MemoryConfig,
    /// Reduce table tuning.
    pub reduce: ReduceConfig,
}

impl Config {
    /// One worker thread, with default memory and reduce settings.
    pub fn thread() -> Config {
        Config::from_communication(CommunicationConfig::Thread)
    }

    /// `n` worker threads in this process.
    pub fn process(n: usize) -> Config {
        Config::from_communication(CommunicationConfig::Process(n))
    }

    /// `hosts` simulated hosts of `threads` worker threads each, all in this process.
    pub fn mock(hosts: usize, threads: usize) -> Config {
        Config::from_communication(CommunicationConfig::Mock { hosts, threads })
    }

    /// `communication` with default memory and reduce settings.
    pub fn from_communication(communication: CommunicationConfig) -> Config {
        Config { communication, memory: MemoryConfig::default(), reduce: ReduceConfig::default() }
    }

    /// `communication` with memory settings from the environment, and its thread count
    /// replaced by `SLUICE_WORKERS_PER_HOST` if that is set.
    pub fn from_env(communication: CommunicationConfig) -> Result<Config> {
        let communication = match workers_per_host_from_env()? {
            Some(threads) => with_threads(communication, threads),
            None => communication,
        };
        Ok(Config { communication, memory: MemoryConfig::from_env()?, reduce: ReduceConfig::default() })
    }

    /// Replaces the memory configuration.
    pub fn with_memory(mut self, memory: MemoryConfig) -> Config {
        self.memory = memory;
        self
    }

    /// Replaces the reduce configuration.
    pub fn with_reduce(mut self, reduce: ReduceConfig) -> Config {
        self.reduce = reduce;
        self
    }
}

fn with_threads(config: CommunicationConfig, threads: usize) -> CommunicationConfig {
    match config {
        CommunicationConfig::Thread | CommunicationConfig::Process(_) if threads == 1 => CommunicationConfig::Thread,
        CommunicationConfig::Thread | CommunicationConfig::Process(_) => CommunicationConfig::Process(threads),
        CommunicationConfig::Mock { hosts, .. } => CommunicationConfig::Mock { hosts, threads },
        CommunicationConfig::Cluster { process, addresses, report, .. } => {
            CommunicationConfig::Cluster { threads, process, addresses, report }
        },
    }
}

/// Runs `func` on a single worker on the current thread and returns its result.
///
/// # Examples
/// ```rust
/// let total = sluice::execute_single(|ctx| {
///     let reduced = ctx.reduce_pair(vec![(1u32, 2u64), (1, 3), (2, 4)], |a, b| a + b).unwrap();
///     reduced.iter().map(|(_, v)| v).sum::<u64>()
/// }).unwrap();
/// assert_eq!(total, 9);
/// ```
pub fn execute_single<T, F>(func: F) -> Result<T>
where
    F: FnOnce(&mut Context) -> T,
{
    let config = Config::thread();
    let sink = LogSink::from_env()?;
    let log_fn = sink.as_ref().map(LogSink::communication_log_fn);
    let mut networks = initialize_networks(&config.communication, NUM_GROUPS, log_fn)?;
    let mut network = networks.remove(0);
    let (host, dispatch) = HostContext::new(&mut network, 1, config.memory, config.reduce, sink)?;
    let result = {
        let mut context = Context::new(host, 0);
        func(&mut context)
    };
    drop(dispatch);
    drop(network.into_guard());
    Ok(result)
}

/// Executes a computation from a configuration and per-worker logic.
///
/// Spins up all hosts of `config` that live in this process, each with its block pool,
/// stream multiplexer and collectives, and the configured number of worker threads per host,
/// each of which runs `func` on its own [`Context`].
///
/// Returns immediately with the [`WorkerGuards`] of the worker threads, which can be joined
/// to recover the values `func` returned. Dropping the guards also waits for the workers.
///
/// If `SLUICE_LOG` names a file, events of all hosts are written to it.
///
/// # Examples
/// ```rust
/// let guards = sluice::execute(sluice::Config::process(3), |ctx| {
///     ctx.flow().all_reduce(ctx.my_rank(), |a, b| a + b).unwrap()
/// }).unwrap();
///
/// for result in guards.join() {
///     assert_eq!(result.unwrap(), 3);
/// }
/// ```
pub fn execute<T, F>(config: Config, func: F) -> Result<WorkerGuards<T>>
where
    T: Send + 'static,
    F: Fn(&mut Context) -> T + Send + Sync + 'static,
{
    let sink = LogSink::from_env()?;
    let log_fn = sink.as_ref().map(LogSink::communication_log_fn);
    let workers_per_host = config.communication.threads();
    let networks = initialize_networks(&config.communication, NUM_GROUPS, log_fn)?;

    let func = Arc::new(func);
    let mut workers = Vec::new();
    let mut hosts: Vec<Box<dyn Any + Send>> = Vec::new();
    let mut guards: Vec<Box<dyn Any + Send>> = Vec::new();
    for mut network in networks {
        let (host, dispatch) = HostContext::new(
            &mut network,
            workers_per_host,
            config.memory.clone(),
            config.reduce.clone(),
            sink.clone(),
        )?;
        for local_worker in 0 .. workers_per_host {
            let host = Arc::clone(&host);
            let func = Arc::clone(&func);
            let rank = host.host_rank() * workers_per_host + local_worker;
            let worker = std::thread::Builder::new()
                .name(format!("sluice:work-{}", rank))
                .spawn(move || {
                    let mut context = Context::new(host, local_worker);
                    (*func)(&mut context)
                })?;
            workers.push(worker);
        }
        hosts.push(Box::new(host));
        guards.push(Box::new(dispatch));
        guards.push(Box::new(network.into_guard()));
    }

    // Host contexts hold the sending halves of all links; they go first so that the
    // dispatcher and communication threads see their links close before being joined.
    hosts.extend(guards);
    Ok(WorkerGuards::new(workers, hosts))
}

/// Executes a computation configured by command line arguments and the environment.
///
/// Understands the arguments of [`CommunicationConfig::from_args`]: `-w, --threads`,
/// `-n, --processes`, `-p, --process`, `-h, --hostfile`, `-r, --report` and `--mock-hosts`.
/// Memory settings come from `SLUICE_RAM`, `SLUICE_BLOCK_SIZE` and `SLUICE_SWAP_DIR`.
///
/// # Examples
///
/// ```rust
/// let guards = sluice::execute_from_args(std::env::args().take(1), |ctx| ctx.num_workers()).unwrap();
/// assert_eq!(guards.join().into_iter().map(Result::unwrap).collect::<Vec<_>>(), vec![1]);
/// ```
/// ```ignore
/// host0% cargo run -- -w 2 -n 2 -h hosts.txt -p 0
/// host1% cargo run -- -w 2 -n 2 -h hosts.txt -p 1
/// ```
#[cfg(feature = "getopts")]
pub fn execute_from_args<I, T, F>(args: I, func: F) -> Result<WorkerGuards<T>>
where
    I: Iterator<Item = String>,
    T: Send + 'static,
    F: Fn(&mut Context) -> T + Send + Sync + 'static,
{
    // the first argument is the program name
    let communication = CommunicationConfig::from_args(args.skip(1))?;
    execute(Config::from_env(communication)?, func)
}
