//! A shared account of bytes held by worker data structures, read as a backpressure signal.
//!
//! Block memory is not counted here: the block pool enforces its own limits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counts bytes in use against a limit.
///
/// Producers that can shed memory voluntarily, like reduce tables, check
/// [`memory_exceeded`](Self::memory_exceeded) and spill when it is set. Nothing blocks on it.
#[derive(Debug)]
pub struct MemoryTracker {
    limit: usize,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl MemoryTracker {
    /// A tracker with `limit` bytes.
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(MemoryTracker {
            limit,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    /// Records `bytes` newly in use.
    pub fn add(&self, bytes: usize) {
        let now = self.current.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.peak.fetch_max(now, Ordering::Relaxed);
    }

    /// Records `bytes` released.
    pub fn sub(&self, bytes: usize) {
        let _ = self.current.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| Some(c.saturating_sub(bytes)));
    }

    /// True while more bytes are in use than the limit allows.
    #[inline]
    pub fn memory_exceeded(&self) -> bool {
        self.current.load(Ordering::Relaxed) > self.limit
    }

    /// Bytes currently in use.
    pub fn current(&self) -> usize { self.current.load(Ordering::Relaxed) }

    /// Highest number of bytes in use so far.
    pub fn peak(&self) -> usize { self.peak.load(Ordering::Relaxed) }

    /// The limit.
    pub fn limit(&self) -> usize { self.limit }
}

#[cfg(test)]
mod tests {
    use super::MemoryTracker;

    #[test]
    fn exceeded_follows_the_balance() {
        let tracker = MemoryTracker::new(100);
        tracker.add(60);
        assert!(!tracker.memory_exceeded());
        tracker.add(60);
        assert!(tracker.memory_exceeded());
        tracker.sub(30);
        assert!(!tracker.memory_exceeded());
        tracker.sub(500);
        assert_eq!(tracker.current(), 0);
        assert_eq!(tracker.peak(), 120);
    }
}
