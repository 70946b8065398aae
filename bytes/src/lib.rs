//! Shared byte slices carved from a common allocation, and the writable buffers they are frozen from.
//!
//! A `BytesMut` is written exactly once, front to back, and then frozen into a `Bytes`. A `Bytes`
//! is cheap to clone and to split, and every piece keeps the whole allocation alive. Block
//! storage and network messages are both expressed this way, which lets a received message
//! become the backing store of a block without a copy.
//!
//! # Examples
//!
//! ```
//! use sluice_bytes::arc::BytesMut;
//!
//! let mut buffer = BytesMut::with_capacity(1024);
//! buffer.extend_from_slice(&[7u8; 300]);
//! assert_eq!(buffer.remaining(), 724);
//!
//! let shared = buffer.freeze();
//! assert_eq!(shared.len(), 300);
//!
//! // slices share the allocation and index relative to their parent.
//! let middle = shared.slice(100 .. 200);
//! let tail = middle.slice(50 .. 100);
//! assert_eq!(tail.len(), 50);
//! assert!(tail.iter().all(|&b| b == 7));
//! ```
#![forbid(missing_docs)]

/// An `Arc`-backed byte slice and its writable precursor.
pub mod arc {

    use std::ops::{Deref, Range};
    use std::sync::Arc;

    /// A writable, fixed-capacity byte buffer.
    ///
    /// Bytes are appended until the capacity is reached. The buffer never reallocates, so its
    /// capacity is the amount of memory charged for it by whoever handed it out.
    pub struct BytesMut {
        buffer: Vec<u8>,
        capacity: usize,
    }

    impl BytesMut {
        /// Allocates an empty buffer able to hold `capacity` bytes.
        pub fn with_capacity(capacity: usize) -> Self {
            BytesMut {
                buffer: Vec::with_capacity(capacity),
                capacity,
            }
        }

        /// The number of bytes still writable.
        #[inline(always)]
        pub fn remaining(&self) -> usize { self.capacity - self.buffer.len() }

        /// Appends as much of `bytes` as fits, returning the number of bytes taken.
        pub fn extend_from_slice(&mut self, bytes: &[u8]) -> usize {
            let take = std::cmp::min(bytes.len(), self.remaining());
            self.buffer.extend_from_slice(&bytes[..take]);
            take
        }

        /// Converts the written prefix to a shareable byte slice.
        pub fn freeze(self) -> Bytes {
            Bytes::from(self.buffer)
        }
    }

    impl Deref for BytesMut {
        type Target = [u8];
        #[inline(always)]
        fn deref(&self) -> &[u8] {
            &self.buffer[..]
        }
    }

    /// A thread-safe, immutable byte slice backed by a shared allocation.
    #[derive(Clone)]
    pub struct Bytes {
        /// The common allocation.
        sequestered: Arc<[u8]>,
        /// Start of this slice within `sequestered`.
        offset: usize,
        /// Length of this slice.
        len: usize,
    }

    impl Bytes {

        /// An empty slice, sharing no allocation with anything.
        pub fn empty() -> Self {
            Bytes::from(Vec::new())
        }

        /// A sub-slice sharing the allocation; `range` is relative to `self`.
        pub fn slice(&self, range: Range<usize>) -> Bytes {
            assert!(range.start <= range.end && range.end <= self.len);
            Bytes {
                sequestered: Arc::clone(&self.sequestered),
                offset: self.offset + range.start,
                len: range.end - range.start,
            }
        }
    }

    impl From<Vec<u8>> for Bytes {
        fn from(vec: Vec<u8>) -> Self {
            let len = vec.len();
            Bytes {
                sequestered: Arc::from(vec.into_boxed_slice()),
                offset: 0,
                len,
            }
        }
    }

    impl Deref for Bytes {
        type Target = [u8];
        #[inline(always)]
        fn deref(&self) -> &[u8] {
            &self.sequestered[self.offset .. self.offset + self.len]
        }
    }

    impl std::fmt::Debug for Bytes {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("Bytes")
                .field("offset", &self.offset)
                .field("len", &self.len)
                .finish()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::{Bytes, BytesMut};

        #[test]
        fn capacity_is_never_exceeded() {
            let mut buffer = BytesMut::with_capacity(10);
            assert_eq!(buffer.extend_from_slice(&[1u8; 6]), 6);
            assert_eq!(buffer.extend_from_slice(&[2u8; 6]), 4);
            assert_eq!(buffer.remaining(), 0);
            assert_eq!(&buffer[..], &[1, 1, 1, 1, 1, 1, 2, 2, 2, 2]);
        }

        #[test]
        fn slice_shares_allocation() {
            let bytes = Bytes::from((0u8 .. 20).collect::<Vec<_>>());
            let middle = bytes.slice(5 .. 10);
            assert_eq!(&middle[..], &[5, 6, 7, 8, 9]);
            drop(bytes);
            // the slice keeps the allocation alive
            let inner = middle.slice(1 .. 3);
            assert_eq!(&inner[..], &[6, 7]);
            assert!(Bytes::empty().is_empty());
        }
    }
}
