//! Size-classed relay buffer pool
//!
//! Buffers are handed out as [`PooledBuffer`] guards and go back to their
//! class free list on drop. Requests above the largest class are allocated
//! directly and never pooled.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const SIZE_CLASSES: [usize; 4] = [4 * 1024, 16 * 1024, 32 * 1024, 64 * 1024];
const MAX_FREE_PER_CLASS: usize = 64;

#[derive(Debug, Default)]
pub struct BufferPool {
    free: [Mutex<Vec<Vec<u8>>>; SIZE_CLASSES.len()],
    allocations: AtomicU64,
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get a buffer of exactly `size` bytes
    pub fn get(self: &Arc<Self>, size: usize) -> PooledBuffer {
        let class = SIZE_CLASSES.iter().position(|&c| size <= c);

        let reused = class.and_then(|idx| match self.free[idx].lock() {
            Ok(mut free) => free.pop(),
            Err(poisoned) => poisoned.into_inner().pop(),
        });

        let mut buf = reused.unwrap_or_else(|| {
            self.allocations.fetch_add(1, Ordering::Relaxed);
            let capacity = class.map_or(size, |idx| SIZE_CLASSES[idx]);
            Vec::with_capacity(capacity)
        });
        buf.resize(size, 0);

        PooledBuffer {
            buf,
            class,
            pool: Arc::clone(self),
        }
    }

    /// Number of buffers allocated instead of reused
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Number of idle buffers across all classes
    pub fn idle(&self) -> usize {
        self.free
            .iter()
            .map(|free| match free.lock() {
                Ok(free) => free.len(),
                Err(poisoned) => poisoned.into_inner().len(),
            })
            .sum()
    }

    fn put(&self, class: usize, mut buf: Vec<u8>) {
        buf.clear();
        let mut free = match self.free[class].lock() {
            Ok(free) => free,
            Err(poisoned) => poisoned.into_inner(),
        };
        if free.len() < MAX_FREE_PER_CLASS {
            free.push(buf);
        }
    }
}

/// A buffer borrowed from a [`BufferPool`]
pub struct PooledBuffer {
    buf: Vec<u8>,
    class: Option<usize>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(class) = self.class {
            self.pool.put(class, std::mem::take(&mut self.buf));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_has_requested_len() {
        let pool = BufferPool::new();
        assert_eq!(pool.get(100).len(), 100);
        assert_eq!(pool.get(16 * 1024).len(), 16 * 1024);
        assert_eq!(pool.get(65535).len(), 65535);
    }

    #[test]
    fn test_buffers_are_reused() {
        let pool = BufferPool::new();
        drop(pool.get(16 * 1024));
        assert_eq!(pool.idle(), 1);

        let buf = pool.get(10 * 1024);
        assert_eq!(buf.len(), 10 * 1024);
        assert_eq!(pool.allocations(), 1);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_reused_buffer_is_zeroed() {
        let pool = BufferPool::new();
        let mut buf = pool.get(4096);
        buf.fill(0xaa);
        drop(buf);

        let buf = pool.get(4096);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_oversized_buffers_are_not_pooled() {
        let pool = BufferPool::new();
        drop(pool.get(128 * 1024));
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_free_list_is_bounded() {
        let pool = BufferPool::new();
        let bufs: Vec<_> = (0..MAX_FREE_PER_CLASS + 10).map(|_| pool.get(4096)).collect();
        drop(bufs);
        assert_eq!(pool.idle(), MAX_FREE_PER_CLASS);
    }

    #[test]
    fn test_classes_are_separate() {
        let pool = BufferPool::new();
        drop(pool.get(64 * 1024));
        let _small = pool.get(1024);
        assert_eq!(pool.allocations(), 2);
        assert_eq!(pool.idle(), 1);
    }
}
