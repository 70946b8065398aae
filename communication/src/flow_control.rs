//! Collectives across all workers of a computation, combining threads first and hosts second.
//!
//! Each collective has the worker threads of a host meet at a [`ThreadBarrier`]. The last thread
//! to arrive folds the host's contributions, performs the single host-level [`Group`] operation,
//! and writes each thread's result back before the barrier opens. Workers must issue the same
//! collectives in the same order; a worker that skips one leaves the others waiting forever.

use std::any::Any;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::barrier::ThreadBarrier;
use crate::group::Group;
use crate::logging::{CollectiveEvent, CollectiveKind, FlowLogger};
use crate::{Error, Result};

type Parcel = Box<dyn Any + Send>;

/// A point-to-point mailbox between neighboring threads of a host.
struct Mailbox {
    send: Sender<Parcel>,
    recv: Receiver<Parcel>,
}

impl Mailbox {
    fn new() -> Self {
        let (send, recv) = crossbeam_channel::unbounded();
        Mailbox { send, recv }
    }
}

/// State shared by the worker threads of one host.
pub struct FlowControlShared {
    group: Arc<Group>,
    barrier: ThreadBarrier,
    /// One deposit slot per local thread, holding inputs before and results after a collective.
    slots: Mutex<Vec<Option<Parcel>>>,
    /// `from_predecessor[i]` receives what local thread `i - 1` forwards.
    from_predecessor: Vec<Mailbox>,
    /// `from_successor[i]` receives what local thread `i + 1` forwards.
    from_successor: Vec<Mailbox>,
}

impl FlowControlShared {
    /// Shared state for `threads` workers on the host that owns `group`.
    pub fn new(group: Arc<Group>, threads: usize) -> Self {
        FlowControlShared {
            group,
            barrier: ThreadBarrier::new(threads),
            slots: Mutex::new((0 .. threads).map(|_| None).collect()),
            from_predecessor: (0 .. threads).map(|_| Mailbox::new()).collect(),
            from_successor: (0 .. threads).map(|_| Mailbox::new()).collect(),
        }
    }

    /// The host-level group.
    pub fn group(&self) -> &Group { &self.group }
}

/// A worker's handle for collectives over all workers.
pub struct FlowControlChannel {
    shared: Arc<FlowControlShared>,
    local_id: usize,
    logger: Option<FlowLogger>,
}

impl FlowControlChannel {
    /// The handle of local worker `local_id`.
    pub fn new(shared: Arc<FlowControlShared>, local_id: usize) -> Self {
        assert!(local_id < shared.barrier.threads());
        FlowControlChannel { shared, local_id, logger: None }
    }

    /// Attaches a logger recording collective entry and exit.
    pub fn set_logger(&mut self, logger: Option<FlowLogger>) {
        self.logger = logger;
    }

    /// Index of this worker among the threads of its host.
    #[inline] pub fn local_id(&self) -> usize { self.local_id }
    /// Number of worker threads per host.
    #[inline] pub fn workers_per_host(&self) -> usize { self.shared.barrier.threads() }
    /// Index of this worker's host.
    #[inline] pub fn my_host_rank(&self) -> usize { self.shared.group.my_host_rank() }
    /// Number of hosts.
    #[inline] pub fn num_hosts(&self) -> usize { self.shared.group.num_hosts() }
    /// Global index of this worker.
    #[inline] pub fn my_rank(&self) -> usize { self.my_host_rank() * self.workers_per_host() + self.local_id }
    /// Total number of workers.
    #[inline] pub fn num_workers(&self) -> usize { self.num_hosts() * self.workers_per_host() }

    fn log(&self, kind: CollectiveKind, start: bool) {
        if let Some(logger) = &self.logger {
            logger.log(CollectiveEvent { kind, worker: self.my_rank(), start });
        }
    }

    /// Deposits `value`, lets the last thread turn all local values into per-thread results,
    /// and returns this thread's result.
    fn collective<T, R, F>(&self, kind: CollectiveKind, value: T, combine: F) -> Result<R>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: FnOnce(&Group, Vec<T>) -> Result<Vec<R>>,
    {
        self.log(kind, true);
        self.shared.slots.lock().expect("flow control slots poisoned")[self.local_id] = Some(Box::new(value));

        self.shared.barrier.wait(|| {
            let mut slots = self.shared.slots.lock().expect("flow control slots poisoned");
            let values: Option<Vec<T>> = slots
                .iter_mut()
                .map(|slot| slot.take().and_then(|parcel| parcel.downcast::<T>().ok()).map(|boxed| *boxed))
                .collect();
            let outcome = match values {
                Some(values) => combine(&self.shared.group, values),
                None => Err(Error::Collective(format!("threads disagree on collective {:?}", kind))),
            };
            match outcome {
                Ok(results) => {
                    for (slot, result) in slots.iter_mut().zip(results) {
                        *slot = Some(Box::new(Ok::<R, String>(result)));
                    }
                },
                Err(error) => {
                    let message = error.to_string();
                    for slot in slots.iter_mut() {
                        *slot = Some(Box::new(Err::<R, String>(message.clone())));
                    }
                },
            }
        });

        let parcel = self.shared.slots.lock().expect("flow control slots poisoned")[self.local_id].take();
        self.log(kind, false);
        match parcel.and_then(|p| p.downcast::<std::result::Result<R, String>>().ok()) {
            Some(result) => (*result).map_err(Error::Collective),
            None => Err(Error::Collective(format!("no result for collective {:?}", kind))),
        }
    }

    /// Folds the values of one host with `op`, returning the running prefixes and the total.
    fn local_scan<T: Clone, F: Fn(T, T) -> T>(values: &[T], op: &F) -> (Vec<T>, T) {
        let mut prefixes = Vec::with_capacity(values.len());
        let mut running = values[0].clone();
        prefixes.push(running.clone());
        for value in &values[1..] {
            running = op(running, value.clone());
            prefixes.push(running.clone());
        }
        (prefixes, running)
    }

    /// Inclusive prefix sum: worker `i` receives `initial op v_0 op ... op v_i`.
    pub fn prefix_sum<T, F>(&self, value: T, op: F, initial: T) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + 'static,
        F: Fn(T, T) -> T,
    {
        self.collective(CollectiveKind::PrefixSum, value, |group, values| {
            let (prefixes, total) = Self::local_scan(&values, &op);
            let offset = group.ex_prefix_sum(total, &op, initial)?;
            Ok(prefixes.into_iter().map(|p| op(offset.clone(), p)).collect())
        })
    }

    /// Exclusive prefix sum: worker `i` receives `initial op v_0 op ... op v_{i-1}`.
    pub fn ex_prefix_sum<T, F>(&self, value: T, op: F, initial: T) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + 'static,
        F: Fn(T, T) -> T,
    {
        Ok(self.ex_prefix_sum_total(value, op, initial)?.0)
    }

    /// Exclusive prefix sum together with the total `initial op v_0 op ... op v_{n-1}`.
    pub fn ex_prefix_sum_total<T, F>(&self, value: T, op: F, initial: T) -> Result<(T, T)>
    where
        T: Serialize + DeserializeOwned + Clone + Send + 'static,
        F: Fn(T, T) -> T,
    {
        self.collective(CollectiveKind::PrefixSum, value, |group, values| {
            let (prefixes, host_total) = Self::local_scan(&values, &op);
            let offset = group.ex_prefix_sum(host_total.clone(), &op, initial.clone())?;
            let total = op(initial, group.all_reduce(host_total, &op)?);
            let mut results = Vec::with_capacity(values.len());
            results.push((offset.clone(), total.clone()));
            for prefix in prefixes.into_iter().take(values.len() - 1) {
                results.push((op(offset.clone(), prefix), total.clone()));
            }
            Ok(results)
        })
    }

    /// Delivers the value of worker `origin` to every worker.
    ///
    /// Every worker passes a value; only the origin's is used.
    pub fn broadcast<T>(&self, value: T, origin: usize) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + 'static,
    {
        let threads = self.workers_per_host();
        self.collective(CollectiveKind::Broadcast, value, |group, mut values| {
            let origin_host = origin / threads;
            let chosen = if group.my_host_rank() == origin_host {
                values.swap_remove(origin % threads)
            }
            else {
                values.swap_remove(0)
            };
            let value = group.broadcast(chosen, origin_host)?;
            Ok(vec![value; threads])
        })
    }

    /// Collects every worker's value, in rank order, at every worker.
    pub fn all_gather<T>(&self, value: T) -> Result<Vec<T>>
    where
        T: Serialize + DeserializeOwned + Clone + Send + 'static,
    {
        let threads = self.workers_per_host();
        self.collective(CollectiveKind::AllGather, value, |group, values| {
            let gathered: Vec<T> = group.all_gather(values)?.into_iter().flatten().collect();
            Ok(vec![gathered; threads])
        })
    }

    /// Combines all values with `op` in rank order at worker `root`.
    ///
    /// Workers other than `root` receive an unspecified partial value.
    pub fn reduce<T, F>(&self, value: T, op: F, root: usize) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + 'static,
        F: Fn(T, T) -> T,
    {
        let threads = self.workers_per_host();
        self.collective(CollectiveKind::Reduce, value, |group, values| {
            let (_, host_total) = Self::local_scan(&values, &op);
            let value = group.reduce(host_total, root / threads, &op)?;
            Ok(vec![value; threads])
        })
    }

    /// Combines all values with `op` and delivers the total to every worker.
    pub fn all_reduce<T, F>(&self, value: T, op: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + 'static,
        F: Fn(T, T) -> T,
    {
        let threads = self.workers_per_host();
        self.collective(CollectiveKind::AllReduce, value, |group, values| {
            let (_, host_total) = Self::local_scan(&values, &op);
            let value = group.all_reduce(host_total, &op)?;
            Ok(vec![value; threads])
        })
    }

    /// Returns once every worker of every host has entered the barrier.
    pub fn barrier(&self) -> Result<()> {
        let threads = self.workers_per_host();
        self.collective(CollectiveKind::Barrier, (), |group, _| {
            group.barrier()?;
            Ok(vec![(); threads])
        })
    }

    /// Returns once every worker of this host has entered the barrier.
    pub fn local_barrier(&self) {
        self.shared.barrier.wait(|| ());
    }

    /// Forwards a parcel to the next worker in rank order, across hosts if necessary.
    fn forward<T: Serialize + Send + 'static>(&self, outgoing: Vec<T>) -> Result<()> {
        let group = &self.shared.group;
        if self.local_id + 1 < self.workers_per_host() {
            self.shared.from_predecessor[self.local_id + 1].send.send(Box::new(outgoing)).map_err(|_| Error::Collective("mailbox closed".to_owned()))
        }
        else if group.my_host_rank() + 1 < group.num_hosts() {
            group.send_value(group.my_host_rank() + 1, &outgoing)
        }
        else {
            Ok(())
        }
    }

    /// Forwards a parcel to the previous worker in rank order, across hosts if necessary.
    fn backward<T: Serialize + Send + 'static>(&self, outgoing: Vec<T>) -> Result<()> {
        let group = &self.shared.group;
        if self.local_id > 0 {
            self.shared.from_successor[self.local_id - 1].send.send(Box::new(outgoing)).map_err(|_| Error::Collective("mailbox closed".to_owned()))
        }
        else if group.my_host_rank() > 0 {
            group.send_value(group.my_host_rank() - 1, &outgoing)
        }
        else {
            Ok(())
        }
    }

    fn receive_parcel<T: DeserializeOwned + Send + 'static>(&self, mailbox: &Mailbox, host: Option<usize>, local: bool) -> Result<Vec<T>> {
        if local {
            let parcel = mailbox.recv.recv().map_err(|_| Error::Collective("mailbox closed".to_owned()))?;
            parcel.downcast::<Vec<T>>().map(|b| *b).map_err(|_| Error::Collective("neighbor sent a different type".to_owned()))
        }
        else if let Some(host) = host {
            self.shared.group.receive_value(host)
        }
        else {
            Ok(Vec::new())
        }
    }

    /// Obtains up to `k` items from the workers preceding this one in rank order.
    ///
    /// The result holds the last `k` items of the concatenation of all preceding workers'
    /// `items`, or all of them if there are fewer. A worker holding at least `k` items forwards
    /// immediately; one holding fewer first waits for its predecessor and tops up from it.
    pub fn predecessor<T>(&self, k: usize, items: &[T]) -> Result<Vec<T>>
    where
        T: Serialize + DeserializeOwned + Clone + Send + 'static,
    {
        self.log(CollectiveKind::Predecessor, true);
        let host = self.my_host_rank();
        let receive = || self.receive_parcel::<T>(
            &self.shared.from_predecessor[self.local_id],
            if host > 0 { Some(host - 1) } else { None },
            self.local_id > 0,
        );

        let received = if items.len() >= k {
            self.forward(items[items.len() - k ..].to_vec())?;
            receive()?
        }
        else {
            let received = receive()?;
            let mut outgoing = Vec::with_capacity(received.len() + items.len());
            outgoing.extend_from_slice(&received);
            outgoing.extend_from_slice(items);
            let surplus = outgoing.len().saturating_sub(k);
            outgoing.drain(.. surplus);
            self.forward(outgoing)?;
            received
        };

        self.shared.barrier.wait(|| ());
        self.log(CollectiveKind::Predecessor, false);
        Ok(received)
    }

    /// Obtains up to `k` items from the workers following this one in rank order.
    ///
    /// The result holds the first `k` items of the concatenation of all following workers'
    /// `items`, or all of them if there are fewer.
    pub fn successor<T>(&self, k: usize, items: &[T]) -> Result<Vec<T>>
    where
        T: Serialize + DeserializeOwned + Clone + Send + 'static,
    {
        self.log(CollectiveKind::Successor, true);
        let host = self.my_host_rank();
        let last_local = self.local_id + 1 == self.workers_per_host();
        let receive = || self.receive_parcel::<T>(
            &self.shared.from_successor[self.local_id],
            if host + 1 < self.num_hosts() { Some(host + 1) } else { None },
            !last_local,
        );

        let received = if items.len() >= k {
            self.backward(items[.. k].to_vec())?;
            receive()?
        }
        else {
            let received = receive()?;
            let mut outgoing = Vec::with_capacity(received.len() + items.len());
            outgoing.extend_from_slice(items);
            outgoing.extend_from_slice(&received);
            outgoing.truncate(k);
            self.backward(outgoing)?;
            received
        };

        self.shared.barrier.wait(|| ());
        self.log(CollectiveKind::Successor, false);
        Ok(received)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mesh;

    /// Runs `logic` on every worker of `hosts` hosts with `threads` threads each, in rank order.
    fn run_workers<T, F>(hosts: usize, threads: usize, logic: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Fn(FlowControlChannel) -> T + Send + Sync + 'static,
    {
        let logic = Arc::new(logic);
        let mut handles = Vec::new();
        for (rank, links) in mesh(hosts).into_iter().enumerate() {
            let shared = Arc::new(FlowControlShared::new(Arc::new(Group::new(rank, links)), threads));
            for local in 0 .. threads {
                let flow = FlowControlChannel::new(Arc::clone(&shared), local);
                let logic = Arc::clone(&logic);
                handles.push(std::thread::spawn(move || logic(flow)));
            }
        }
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn prefix_sums_follow_rank_order() {
        let results = run_workers(3, 2, |flow| {
            let rank = flow.my_rank();
            let inclusive = flow.prefix_sum(rank.to_string(), |a, b| a + &b, String::new()).unwrap();
            let (exclusive, total) = flow.ex_prefix_sum_total(rank + 1, |a, b| a + b, 0).unwrap();
            (inclusive, exclusive, total)
        });
        for (rank, (inclusive, exclusive, total)) in results.into_iter().enumerate() {
            let expected: String = (0 ..= rank).map(|r| r.to_string()).collect();
            assert_eq!(inclusive, expected);
            assert_eq!(exclusive, rank * (rank + 1) / 2);
            assert_eq!(total, 21);
        }
    }

    #[test]
    fn broadcast_reduce_gather_barrier() {
        let results = run_workers(2, 3, |flow| {
            let rank = flow.my_rank();
            let from_four = flow.broadcast(rank * 100, 4).unwrap();
            flow.barrier().unwrap();
            let sum = flow.reduce(rank, |a, b| a + b, 0).unwrap();
            let max = flow.all_reduce(rank, std::cmp::max).unwrap();
            let gathered = flow.all_gather(rank as u32).unwrap();
            flow.local_barrier();
            (rank, from_four, sum, max, gathered)
        });
        for (rank, from_four, sum, max, gathered) in results {
            assert_eq!(from_four, 400);
            if rank == 0 { assert_eq!(sum, 15); }
            assert_eq!(max, 5);
            assert_eq!(gathered, vec![0, 1, 2, 3, 4, 5]);
        }
    }

    #[test]
    fn predecessor_borrows_through_short_workers() {
        // worker 0 holds one item, worker 1 none, workers 2 and 3 five each.
        let results = run_workers(2, 2, |flow| {
            let items: Vec<String> = match flow.my_rank() {
                0 => vec!["a0".to_owned()],
                1 => vec![],
                r => (0 .. 5).map(|i| format!("w{}-{}", r, i)).collect(),
            };
            flow.predecessor(3, &items).unwrap()
        });
        assert_eq!(results[0], Vec::<String>::new());
        assert_eq!(results[1], vec!["a0".to_owned()]);
        assert_eq!(results[2], vec!["a0".to_owned()]);
        assert_eq!(results[3], vec!["w2-2".to_owned(), "w2-3".to_owned(), "w2-4".to_owned()]);
    }

    #[test]
    fn successor_borrows_through_short_workers() {
        let results = run_workers(3, 2, |flow| {
            let rank = flow.my_rank() as u64;
            let items: Vec<u64> = if rank % 2 == 0 { vec![] } else { vec![rank * 10, rank * 10 + 1] };
            flow.successor(3, &items).unwrap()
        });
        assert_eq!(results[0], vec![10, 11, 30]);
        assert_eq!(results[1], vec![30, 31, 50]);
        assert_eq!(results[2], vec![30, 31, 50]);
        assert_eq!(results[3], vec![50, 51]);
        assert_eq!(results[4], vec![50, 51]);
        assert_eq!(results[5], Vec::<u64>::new());
    }
}
