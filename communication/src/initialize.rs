//! Configuration of hosts and threads, and construction of the links between hosts.

#[cfg(feature = "getopts")]
use std::io::BufRead;
use std::thread::JoinHandle;

use crate::group::Group;
use crate::link::{mesh, Link};
use crate::logging::LogFn;
use crate::networking::create_sockets;
use crate::tcp::spawn_links;
use crate::{Error, Result};

/// Possible configurations for the communication infrastructure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Config {
    /// Use one thread.
    Thread,
    /// Use one process with an indicated number of threads.
    Process(usize),
    /// Simulate several hosts within this process, linked by in-memory channels.
    Mock {
        /// Number of simulated hosts.
        hosts: usize,
        /// Number of worker threads per host.
        threads: usize,
    },
    /// Expect multiple processes connected by TCP.
    Cluster {
        /// Number of per-process worker threads
        threads: usize,
        /// Identity of this process
        process: usize,
        /// Addresses of all processes
        addresses: Vec<String>,
        /// Verbosely report connection process
        report: bool,
    },
}

impl Config {
    /// Worker threads per host.
    pub fn threads(&self) -> usize {
        match self {
            Config::Thread => 1,
            Config::Process(threads) => *threads,
            Config::Mock { threads, .. } => *threads,
            Config::Cluster { threads, .. } => *threads,
        }
    }

    /// Number of hosts in the computation.
    pub fn hosts(&self) -> usize {
        match self {
            Config::Thread | Config::Process(_) => 1,
            Config::Mock { hosts, .. } => *hosts,
            Config::Cluster { addresses, .. } => addresses.len(),
        }
    }

    /// Installs options into a [`getopts::Options`] struct that corresponds
    /// to the parameters in the configuration.
    ///
    /// It is the caller's responsibility to ensure that the installed options
    /// do not conflict with any other options that may exist in `opts`, or
    /// that may be installed into `opts` in the future.
    ///
    /// This method is only available if the `getopts` feature is enabled, which
    /// it is by default.
    #[cfg(feature = "getopts")]
    pub fn install_options(opts: &mut getopts::Options) {
        opts.optopt("w", "threads", "number of per-process worker threads", "NUM");
        opts.optopt("p", "process", "identity of this process", "IDX");
        opts.optopt("n", "processes", "number of processes", "NUM");
        opts.optopt("h", "hostfile", "text file whose lines are process addresses", "FILE");
        opts.optopt("", "mock-hosts", "simulate this many hosts in one process", "NUM");
        opts.optflag("r", "report", "reports connection progress");
    }

    /// Instantiates a configuration based upon the parsed options in `matches`.
    ///
    /// The `matches` object must have been constructed from a
    /// [`getopts::Options`] which contained at least the options installed by
    /// [`Self::install_options`].
    ///
    /// This method is only available if the `getopts` feature is enabled, which
    /// it is by default.
    #[cfg(feature = "getopts")]
    pub fn from_matches(matches: &getopts::Matches) -> Result<Config> {
        let parse = |name: &str, default: usize| -> Result<usize> {
            match matches.opt_str(name) {
                Some(text) => text.parse().map_err(|e| Error::Config(format!("--{}: {}", name, e))),
                None => Ok(default),
            }
        };
        let threads = parse("threads", 1)?;
        let process = parse("process", 0)?;
        let processes = parse("processes", 1)?;
        let mock_hosts = parse("mock-hosts", 0)?;
        let report = matches.opt_present("report");

        if process >= processes {
            return Err(Error::Config(format!("process index {} out of range for {} processes", process, processes)));
        }

        if mock_hosts > 0 {
            Ok(Config::Mock { hosts: mock_hosts, threads })
        }
        else if processes > 1 {
            let mut addresses = Vec::new();
            if let Some(hosts) = matches.opt_str("h") {
                let file = std::fs::File::open(&hosts)?;
                let reader = std::io::BufReader::new(file);
                for line in reader.lines().take(processes) {
                    addresses.push(line?);
                }
                if addresses.len() < processes {
                    return Err(Error::Config(format!("could only read {} addresses from {}, but -n: {}", addresses.len(), hosts, processes)));
                }
            }
            else {
                for index in 0 .. processes {
                    addresses.push(format!("localhost:{}", 2101 + index));
                }
            }
            Ok(Config::Cluster { threads, process, addresses, report })
        }
        else if threads > 1 {
            Ok(Config::Process(threads))
        }
        else {
            Ok(Config::Thread)
        }
    }

    /// Constructs a new configuration by parsing the supplied text arguments.
    ///
    /// Most commonly, callers supply `std::env::args()` as the iterator.
    ///
    /// This method is only available if the `getopts` feature is enabled, which
    /// it is by default.
    #[cfg(feature = "getopts")]
    pub fn from_args<I: IntoIterator<Item = String>>(args: I) -> Result<Config> {
        let mut opts = getopts::Options::new();
        Config::install_options(&mut opts);
        let matches = opts.parse(args).map_err(|e| Error::Config(e.to_string()))?;
        Config::from_matches(&matches)
    }
}

/// The links of one host, per communication group, and the threads that drive them.
pub struct HostNetwork {
    /// Index of this host.
    pub host_rank: usize,
    /// Number of hosts.
    pub num_hosts: usize,
    groups: Vec<Option<Vec<Option<Link>>>>,
    guard: CommsGuard,
}

impl HostNetwork {
    /// Takes the links of group `index` as a [`Group`]; `None` if already taken.
    pub fn take_group(&mut self, index: usize) -> Option<Group> {
        let links = self.groups.get_mut(index)?.take()?;
        Some(Group::new(self.host_rank, links))
    }

    /// Takes the raw links of group `index`; `None` if already taken.
    pub fn take_links(&mut self, index: usize) -> Option<Vec<Option<Link>>> {
        self.groups.get_mut(index)?.take()
    }

    /// Detaches the threads driving the links, to be joined after the links are dropped.
    pub fn into_guard(self) -> CommsGuard {
        self.guard
    }
}

/// Joins communication threads when dropped.
///
/// Send threads exit once the last handle to their link is dropped, so this guard must outlive
/// every `Group` and multiplexer built from the network.
#[derive(Default)]
pub struct CommsGuard {
    threads: Vec<JoinHandle<()>>,
}

impl Drop for CommsGuard {
    fn drop(&mut self) {
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                eprintln!("communication thread panicked");
            }
        }
    }
}

/// Establishes `groups` independent sets of links between the hosts of `config`.
///
/// Returns one `HostNetwork` per host run by this process: many for `Config::Mock`, otherwise one.
pub fn initialize_networks(config: &Config, groups: usize, log_fn: Option<LogFn>) -> Result<Vec<HostNetwork>> {
    match config {
        Config::Thread | Config::Process(_) => {
            Ok(vec![HostNetwork {
                host_rank: 0,
                num_hosts: 1,
                groups: (0 .. groups).map(|_| Some(vec![None])).collect(),
                guard: CommsGuard::default(),
            }])
        },
        Config::Mock { hosts, .. } => {
            let hosts = *hosts;
            if hosts == 0 {
                return Err(Error::Config("a mock cluster needs at least one host".to_owned()));
            }
            let mut per_host: Vec<HostNetwork> = (0 .. hosts).map(|host_rank| HostNetwork {
                host_rank,
                num_hosts: hosts,
                groups: Vec::with_capacity(groups),
                guard: CommsGuard::default(),
            }).collect();
            for _ in 0 .. groups {
                for (network, links) in per_host.iter_mut().zip(mesh(hosts)) {
                    network.groups.push(Some(links));
                }
            }
            Ok(per_host)
        },
        Config::Cluster { process, addresses, report, .. } => {
            let sockets = create_sockets(addresses.clone(), *process, groups, *report)?;
            let mut network = HostNetwork {
                host_rank: *process,
                num_hosts: addresses.len(),
                groups: Vec::with_capacity(groups),
                guard: CommsGuard::default(),
            };
            for group_sockets in sockets {
                let (links, threads) = spawn_links(group_sockets, *process, log_fn.clone())?;
                network.groups.push(Some(links));
                network.guard.threads.extend(threads);
            }
            Ok(vec![network])
        },
    }
}

/// Maintains `JoinHandle`s for worker threads.
pub struct WorkerGuards<T: Send + 'static> {
    guards: Vec<JoinHandle<T>>,
    others: Vec<Box<dyn std::any::Any + Send>>,
}

impl<T: Send + 'static> WorkerGuards<T> {
    /// Wraps worker threads; `others` are dropped only after all workers have been joined.
    pub fn new(guards: Vec<JoinHandle<T>>, others: Vec<Box<dyn std::any::Any + Send>>) -> Self {
        WorkerGuards { guards, others }
    }

    /// Returns a reference to the indexed guard.
    pub fn guards(&self) -> &[JoinHandle<T>] {
        &self.guards[..]
    }

    /// Waits on the worker threads and returns the results they produce.
    pub fn join(mut self) -> Vec<std::result::Result<T, String>> {
        self.guards
            .drain(..)
            .map(|guard| guard.join().map_err(|e| format!("{:?}", e)))
            .collect()
    }
}

impl<T: Send + 'static> Drop for WorkerGuards<T> {
    fn drop(&mut self) {
        for guard in self.guards.drain(..) {
            if guard.join().is_err() {
                eprintln!("worker thread panicked");
            }
        }
        // Host resources go only after all workers are done with them.
        self.others.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "getopts")]
    #[test]
    fn parses_arguments() {
        let args = |s: &str| s.split_whitespace().map(|x| x.to_owned()).collect::<Vec<_>>();
        assert_eq!(Config::from_args(args("-w 1")).unwrap(), Config::Thread);
        assert_eq!(Config::from_args(args("-w 4")).unwrap(), Config::Process(4));
        assert_eq!(Config::from_args(args("-w 2 --mock-hosts 3")).unwrap(), Config::Mock { hosts: 3, threads: 2 });
        match Config::from_args(args("-w 2 -n 2 -p 1")).unwrap() {
            Config::Cluster { threads, process, addresses, report } => {
                assert_eq!((threads, process, report), (2, 1, false));
                assert_eq!(addresses, vec!["localhost:2101".to_owned(), "localhost:2102".to_owned()]);
            },
            other => panic!("unexpected {:?}", other),
        }
        assert!(Config::from_args(args("-n 2 -p 2")).is_err());
        assert!(Config::from_args(args("-w many")).is_err());
    }

    #[test]
    fn mock_networks_have_independent_groups() {
        let mut networks = initialize_networks(&Config::Mock { hosts: 2, threads: 1 }, 2, None).unwrap();
        let mut second = networks.pop().unwrap();
        let mut first = networks.pop().unwrap();

        let a0 = first.take_group(0).unwrap();
        let a1 = first.take_group(1).unwrap();
        let b0 = second.take_group(0).unwrap();
        let b1 = second.take_group(1).unwrap();
        assert!(first.take_group(0).is_none());

        a1.send_value(1, &"data").unwrap();
        a0.send_value(1, &"flow").unwrap();
        assert_eq!(b0.receive_value::<String>(0).unwrap(), "flow");
        assert_eq!(b1.receive_value::<String>(0).unwrap(), "data");
    }
}
