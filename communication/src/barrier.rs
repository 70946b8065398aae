//! A reusable barrier for the worker threads of one host.

use std::sync::{Condvar, Mutex};

/// A barrier for a fixed number of threads, reusable across generations.
///
/// The last thread to arrive runs a closure before anyone is released, which is how the threads
/// of a host fold their contributions into a single participant of a host collective.
pub struct ThreadBarrier {
    threads: usize,
    state: Mutex<BarrierState>,
    released: Condvar,
}

struct BarrierState {
    /// Threads waiting in the current generation.
    arrived: usize,
    /// Generation counter; bumped each time the barrier opens.
    step: usize,
}

impl ThreadBarrier {
    /// A barrier for `threads` threads.
    pub fn new(threads: usize) -> Self {
        assert!(threads > 0);
        ThreadBarrier {
            threads,
            state: Mutex::new(BarrierState { arrived: 0, step: 0 }),
            released: Condvar::new(),
        }
    }

    /// The number of participating threads.
    pub fn threads(&self) -> usize { self.threads }

    /// Blocks until all threads have arrived; the last to arrive runs `last` first.
    ///
    /// Returns the generation that was completed.
    pub fn wait<F: FnOnce()>(&self, last: F) -> usize {
        let mut state = self.state.lock().expect("thread barrier poisoned");
        let step = state.step;
        state.arrived += 1;
        if state.arrived == self.threads {
            last();
            state.arrived = 0;
            state.step = step.wrapping_add(1);
            self.released.notify_all();
        }
        else {
            while state.step == step {
                state = self.released.wait(state).expect("thread barrier poisoned");
            }
        }
        step
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn closure_runs_once_per_generation_after_all_arrive() {
        let threads = 4;
        let barrier = Arc::new(ThreadBarrier::new(threads));
        let arrivals = Arc::new(AtomicUsize::new(0));
        let closures = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0 .. threads).map(|_| {
            let barrier = Arc::clone(&barrier);
            let arrivals = Arc::clone(&arrivals);
            let closures = Arc::clone(&closures);
            std::thread::spawn(move || {
                for round in 0 .. 10 {
                    arrivals.fetch_add(1, Ordering::SeqCst);
                    let step = barrier.wait(|| {
                        assert_eq!(arrivals.load(Ordering::SeqCst), (round + 1) * threads);
                        closures.fetch_add(1, Ordering::SeqCst);
                    });
                    assert_eq!(step, 2 * round);
                    assert_eq!(closures.load(Ordering::SeqCst), round + 1);
                    // keep the next round from starting before everyone has checked.
                    barrier.wait(|| ());
                }
            })
        }).collect();

        for handle in handles { handle.join().unwrap(); }
        assert_eq!(closures.load(Ordering::SeqCst), 10);
    }
}
