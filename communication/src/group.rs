//! Host-level collective operations over the links of one communication group.

use serde::de::DeserializeOwned;
use serde::Serialize;

use sluice_bytes::arc::Bytes;

use crate::link::Link;
use crate::{Error, Result};

/// The links of one host to all other hosts, with collectives built on them.
///
/// All methods take `&self`: a `Group` is shared by the threads of a host. Point-to-point
/// messages between two hosts are delivered in order, so collectives are correct as long as
/// every host issues the same collectives in the same order, one at a time.
pub struct Group {
    my_rank: usize,
    links: Vec<Option<Link>>,
}

impl Group {
    /// Wraps the links of host `my_rank`; `links[my_rank]` must be `None`.
    pub fn new(my_rank: usize, links: Vec<Option<Link>>) -> Self {
        debug_assert!(links.get(my_rank).map(|l| l.is_none()).unwrap_or(true));
        Group { my_rank, links }
    }

    /// A group consisting of just this host.
    pub fn single() -> Self {
        Group { my_rank: 0, links: vec![None] }
    }

    /// The index of this host.
    #[inline] pub fn my_host_rank(&self) -> usize { self.my_rank }
    /// The number of hosts.
    #[inline] pub fn num_hosts(&self) -> usize { self.links.len() }

    fn link(&self, peer: usize) -> Result<&Link> {
        self.links.get(peer).and_then(|l| l.as_ref()).ok_or(Error::NoLink { peer })
    }

    /// Sends a raw message to `peer`.
    pub fn send_to(&self, peer: usize, message: Bytes) -> Result<()> {
        self.link(peer)?.send(message).map_err(|_| Error::Disconnected { peer })
    }

    /// Receives the next raw message from `peer`.
    pub fn receive_from(&self, peer: usize) -> Result<Bytes> {
        self.link(peer)?.recv().ok_or(Error::Disconnected { peer })
    }

    /// Serializes and sends a value to `peer`.
    pub fn send_value<T: Serialize>(&self, peer: usize, value: &T) -> Result<()> {
        let encoded = bincode::serialize(value)?;
        self.send_to(peer, Bytes::from(encoded))
    }

    /// Receives and deserializes a value from `peer`.
    pub fn receive_value<T: DeserializeOwned>(&self, peer: usize) -> Result<T> {
        let message = self.receive_from(peer)?;
        Ok(bincode::deserialize(&message[..])?)
    }

    /// Distributes `value` from host `origin` to all hosts, along a binomial tree.
    pub fn broadcast<T: Serialize + DeserializeOwned>(&self, mut value: T, origin: usize) -> Result<T> {
        let hosts = self.num_hosts();
        let relative = (self.my_rank + hosts - origin) % hosts;
        let absolute = |r: usize| (r + origin) % hosts;

        // In round `d`, the hosts [0, d) hold the value and pass it to [d, 2d).
        let mut d = 1;
        while d < hosts {
            if relative < d {
                if relative + d < hosts {
                    self.send_value(absolute(relative + d), &value)?;
                }
            }
            else if relative < 2 * d {
                value = self.receive_value(absolute(relative - d))?;
            }
            d <<= 1;
        }
        Ok(value)
    }

    /// Combines all values with `op` at host `root`, along a binomial tree.
    ///
    /// Values are combined in rank order relative to `root`. Only the root's result is the
    /// total; other hosts receive a partial value.
    pub fn reduce<T, F>(&self, mut value: T, root: usize, op: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(T, T) -> T,
    {
        let hosts = self.num_hosts();
        let relative = (self.my_rank + hosts - root) % hosts;
        let absolute = |r: usize| (r + root) % hosts;

        let mut d = 1;
        while d < hosts {
            if relative & d != 0 {
                self.send_value(absolute(relative - d), &value)?;
                break;
            }
            else if relative + d < hosts {
                let theirs: T = self.receive_value(absolute(relative + d))?;
                value = op(value, theirs);
            }
            d <<= 1;
        }
        Ok(value)
    }

    /// Combines all values with `op` and delivers the total to every host.
    pub fn all_reduce<T, F>(&self, value: T, op: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(T, T) -> T,
    {
        let total = self.reduce(value, 0, op)?;
        self.broadcast(total, 0)
    }

    /// Inclusive prefix sum over host ranks: host `i` receives `v_0 op ... op v_i`.
    pub fn prefix_sum<T, F>(&self, value: T, op: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Clone,
        F: Fn(T, T) -> T,
    {
        Ok(self.scan(value, &op)?.0)
    }

    /// Exclusive prefix sum over host ranks: host `i` receives `initial op v_0 op ... op v_{i-1}`.
    pub fn ex_prefix_sum<T, F>(&self, value: T, op: F, initial: T) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Clone,
        F: Fn(T, T) -> T,
    {
        Ok(match self.scan(value, &op)?.1 {
            Some(before) => op(initial, before),
            None => initial,
        })
    }

    /// Hillis-Steele scan returning the inclusive and the exclusive prefix.
    fn scan<T, F>(&self, value: T, op: &F) -> Result<(T, Option<T>)>
    where
        T: Serialize + DeserializeOwned + Clone,
        F: Fn(T, T) -> T,
    {
        let hosts = self.num_hosts();
        let mut inclusive = value;
        let mut exclusive: Option<T> = None;

        let mut d = 1;
        while d < hosts {
            if self.my_rank + d < hosts {
                self.send_value(self.my_rank + d, &inclusive)?;
            }
            if self.my_rank >= d {
                let theirs: T = self.receive_value(self.my_rank - d)?;
                exclusive = Some(match exclusive {
                    Some(mine) => op(theirs.clone(), mine),
                    None => theirs.clone(),
                });
                inclusive = op(theirs, inclusive);
            }
            d <<= 1;
        }
        Ok((inclusive, exclusive))
    }

    /// Gathers every host's value at every host, in rank order.
    pub fn all_gather<T: Serialize + DeserializeOwned>(&self, value: T) -> Result<Vec<T>> {
        let gathered = self.reduce(vec![value], 0, |mut a, b| { a.extend(b); a })?;
        self.broadcast(gathered, 0)
    }

    /// Returns once every host has entered the barrier.
    pub fn barrier(&self) -> Result<()> {
        self.all_reduce((), |_, _| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mesh;

    /// Runs `logic` on `hosts` groups connected in memory, one thread each.
    fn run_hosts<T, F>(hosts: usize, logic: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Fn(Group) -> T + Send + Sync + 'static,
    {
        let logic = std::sync::Arc::new(logic);
        let handles: Vec<_> = mesh(hosts)
            .into_iter()
            .enumerate()
            .map(|(rank, links)| {
                let logic = std::sync::Arc::clone(&logic);
                std::thread::spawn(move || logic(Group::new(rank, links)))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn broadcast_from_every_origin() {
        for hosts in 1 .. 6 {
            for origin in 0 .. hosts {
                let results = run_hosts(hosts, move |group| {
                    group.broadcast(group.my_host_rank() * 10, origin).unwrap()
                });
                assert!(results.iter().all(|&r| r == origin * 10));
            }
        }
    }

    #[test]
    fn reduce_keeps_rank_order_at_root() {
        let results = run_hosts(5, |group| {
            let mine = group.my_host_rank().to_string();
            group.reduce(mine, 0, |a, b| a + &b).unwrap()
        });
        assert_eq!(results[0], "01234");
    }

    #[test]
    fn prefix_sums() {
        let results = run_hosts(7, |group| {
            let rank = group.my_host_rank() as u64;
            let inclusive = group.prefix_sum(rank + 1, |a, b| a + b).unwrap();
            let exclusive = group.ex_prefix_sum(rank + 1, |a, b| a + b, 100).unwrap();
            let concatenated = group.ex_prefix_sum(format!("{}", rank), |a, b| a + &b, String::from(">")).unwrap();
            (inclusive, exclusive, concatenated)
        });
        for (rank, (inclusive, exclusive, concatenated)) in results.into_iter().enumerate() {
            let rank = rank as u64;
            assert_eq!(inclusive, (rank + 1) * (rank + 2) / 2);
            assert_eq!(exclusive, 100 + rank * (rank + 1) / 2);
            let expected: String = std::iter::once(">".to_owned()).chain((0 .. rank).map(|r| r.to_string())).collect();
            assert_eq!(concatenated, expected);
        }
    }

    #[test]
    fn all_reduce_all_gather_and_barrier() {
        let results = run_hosts(4, |group| {
            let rank = group.my_host_rank();
            group.barrier().unwrap();
            let max = group.all_reduce(rank, std::cmp::max).unwrap();
            let all = group.all_gather(rank * rank).unwrap();
            (max, all)
        });
        for (max, all) in results {
            assert_eq!(max, 3);
            assert_eq!(all, vec![0, 1, 4, 9]);
        }
    }

    #[test]
    fn missing_link_is_an_error() {
        let group = Group::single();
        assert!(matches!(group.send_value(0, &1u8), Err(Error::NoLink { peer: 0 })));
        assert_eq!(group.all_reduce(5, |a, b| a + b).unwrap(), 5);
    }
}
