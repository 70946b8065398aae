//! Ordered, message-oriented connections between two hosts.

use crossbeam_channel::{Receiver, Sender, TryRecvError};

use sluice_bytes::arc::Bytes;

/// One host's end of a bidirectional connection to a peer host.
///
/// Messages arrive whole and in the order they were sent. A link whose remote end has gone away
/// reports `None` from `recv`, and `send` returns the message that could not be delivered.
pub struct Link {
    /// Host on the other end.
    peer: usize,
    sender: Sender<Bytes>,
    receiver: Receiver<Bytes>,
}

impl Link {
    /// Assembles a link from a channel towards `peer` and a channel from it.
    pub fn from_parts(peer: usize, sender: Sender<Bytes>, receiver: Receiver<Bytes>) -> Self {
        Link { peer, sender, receiver }
    }

    /// The host on the other end of this link.
    pub fn peer(&self) -> usize { self.peer }

    /// Enqueues a message for the peer.
    pub fn send(&self, message: Bytes) -> Result<(), Bytes> {
        self.sender.send(message).map_err(|e| e.into_inner())
    }

    /// Blocks until the next message from the peer arrives, or the link closes.
    pub fn recv(&self) -> Option<Bytes> {
        self.receiver.recv().ok()
    }

    /// Returns the next message if one is waiting.
    ///
    /// `Err(())` indicates the link is closed and drained.
    pub fn try_recv(&self) -> Result<Option<Bytes>, ()> {
        match self.receiver.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(()),
        }
    }

    /// Separates the sending and receiving halves, for use by different threads.
    pub fn split(self) -> (Sender<Bytes>, Receiver<Bytes>) {
        (self.sender, self.receiver)
    }
}

/// Connects `hosts` hosts pairwise with in-memory channels.
///
/// Entry `[i][j]` is host `i`'s link to host `j`, and `None` when `i == j`.
pub fn mesh(hosts: usize) -> Vec<Vec<Option<Link>>> {

    // channels[i][j] carries messages from i to j.
    let mut senders: Vec<Vec<Option<Sender<Bytes>>>> = (0 .. hosts).map(|_| (0 .. hosts).map(|_| None).collect()).collect();
    let mut receivers: Vec<Vec<Option<Receiver<Bytes>>>> = (0 .. hosts).map(|_| (0 .. hosts).map(|_| None).collect()).collect();
    for source in 0 .. hosts {
        for target in 0 .. hosts {
            if source != target {
                let (send, recv) = crossbeam_channel::unbounded();
                senders[source][target] = Some(send);
                receivers[target][source] = Some(recv);
            }
        }
    }

    senders
        .into_iter()
        .zip(receivers)
        .map(|(sends, recvs)| {
            sends
                .into_iter()
                .zip(recvs)
                .enumerate()
                .map(|(peer, pair)| match pair {
                    (Some(send), Some(recv)) => Some(Link::from_parts(peer, send, recv)),
                    _ => None,
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mesh_delivers_in_order_between_each_pair() {
        let mut links = mesh(3);
        assert!(links[1][1].is_none());

        let from0 = links[0][2].take().unwrap();
        let at2 = links[2][0].take().unwrap();
        for round in 0u8 .. 5 {
            from0.send(Bytes::from(vec![round])).unwrap();
        }
        for round in 0u8 .. 5 {
            assert_eq!(&at2.recv().unwrap()[..], &[round]);
        }
        assert!(matches!(at2.try_recv(), Ok(None)));
    }

    #[test]
    fn dropped_peer_closes_link() {
        let mut links = mesh(2);
        let at0 = links[0][1].take().unwrap();
        drop(links);
        assert!(at0.recv().is_none());
        assert!(at0.send(Bytes::from(vec![1])).is_err());
    }
}
