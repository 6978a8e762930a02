use std::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::buffers::fixed_buffer::FixedBuf;

/// A fixed-capacity pool of equally sized buffers, fully allocated up front
///  so the hot path never allocates.
///
/// The free list is a stack: the most recently released buffer is handed out
///  first to maximize cache reuse. The pool is strictly bounded - `acquire`
///  returns `None` once all blocks are in flight, and a release that would
///  exceed the original capacity (or returns a buffer of a foreign size) is
///  ignored.
pub struct MemoryPool {
    block_size: usize,
    block_count: usize,
    free_blocks: Mutex<Vec<FixedBuf>>,
}

impl MemoryPool {
    pub fn new(block_size: usize, block_count: usize) -> MemoryPool {
        let free_blocks = (0..block_count)
            .map(|_| FixedBuf::new(block_size))
            .collect::<Vec<_>>();

        MemoryPool {
            block_size,
            block_count,
            free_blocks: Mutex::new(free_blocks),
        }
    }

    /// The reserved buffer, or `None` if all blocks are in flight.
    pub fn acquire(&self) -> Option<FixedBuf> {
        let mut free_blocks = self.free_blocks.lock().unwrap();
        match free_blocks.pop() {
            Some(buffer) => {
                trace!("acquired block from pool, {} remaining", free_blocks.len());
                Some(buffer)
            }
            None => {
                debug!("no free block of {} bytes in pool", self.block_size);
                None
            }
        }
    }

    /// Return a buffer to the pool. The contents are not zeroed, only the
    ///  length marker is reset.
    pub fn release(&self, mut buffer: FixedBuf) {
        if buffer.capacity() != self.block_size {
            warn!(
                "released buffer of {} bytes into a pool of {} byte blocks - discarding",
                buffer.capacity(),
                self.block_size
            );
            return;
        }

        buffer.clear();

        let mut free_blocks = self.free_blocks.lock().unwrap();
        if free_blocks.len() < self.block_count {
            trace!("released block to pool, {} free", free_blocks.len() + 1);
            free_blocks.push(buffer);
        }
        else {
            warn!("pool is already full - discarding released buffer");
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of blocks currently on the free stack. This is back at
    ///  `block_count` whenever no caller holds a block.
    pub fn free_blocks(&self) -> usize {
        self.free_blocks.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;
    use super::*;

    #[test]
    fn test_acquire_until_exhausted() {
        let pool = MemoryPool::new(16, 3);
        assert_eq!(pool.free_blocks(), 3);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        assert_eq!(pool.free_blocks(), 0);
        assert!(pool.acquire().is_none());

        pool.release(a);
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.free_blocks(), 3);
    }

    #[test]
    fn test_lifo_reuse() {
        let pool = MemoryPool::new(4, 2);

        let mut first = pool.acquire().unwrap();
        first.put_slice(b"mark");
        let _second = pool.acquire().unwrap();

        pool.release(first);

        // the block released last comes back first, with its bytes intact
        let mut reused = pool.acquire().unwrap();
        assert!(reused.is_empty());
        reused.maximize_len();
        assert_eq!(reused.as_ref(), b"mark");
    }

    #[test]
    fn test_release_clears_length() {
        let pool = MemoryPool::new(8, 1);

        let mut buf = pool.acquire().unwrap();
        buf.put_slice(b"abc");
        pool.release(buf);

        assert!(pool.acquire().unwrap().is_empty());
    }

    #[test]
    fn test_release_foreign_buffer_is_ignored() {
        let pool = MemoryPool::new(8, 1);
        let _held = pool.acquire().unwrap();

        pool.release(FixedBuf::new(99));
        assert_eq!(pool.free_blocks(), 0);
    }

    #[test]
    fn test_release_beyond_capacity_is_ignored() {
        let pool = MemoryPool::new(8, 1);

        pool.release(FixedBuf::new(8));
        assert_eq!(pool.free_blocks(), 1);
    }

    #[test]
    fn test_block_size() {
        assert_eq!(MemoryPool::new(1454, 10).block_size(), 1454);
    }
}
