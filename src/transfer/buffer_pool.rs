use std::sync::Mutex;
use tracing::trace;

/// Snapshot of pool behavior since construction.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferPoolStats {
    pub reuses: u64,
    pub misses: u64,
    pub discarded: u64,
    pub available: usize,
}

impl BufferPoolStats {
    /// Fraction of acquires served from the pool, in [0, 1].
    pub fn hit_rate(&self) -> f64 {
        let total = self.reuses + self.misses;
        if total == 0 {
            0.0
        } else {
            self.reuses as f64 / total as f64
        }
    }
}

#[derive(Debug)]
struct PoolInner {
    buffers: Vec<Vec<u8>>,
    reuses: u64,
    misses: u64,
    discarded: u64,
}

/// Fixed-size LIFO buffer recycler bounding allocator pressure on the
/// chunk write path. Buffers are plain `Vec<u8>` of exactly `buffer_size`
/// bytes; anything else handed to `release` is dropped on the floor.
#[derive(Debug)]
pub struct BufferPool {
    buffer_size: usize,
    max_pooled: usize,
    inner: Mutex<PoolInner>,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_pooled: usize) -> Self {
        Self {
            buffer_size,
            max_pooled,
            inner: Mutex::new(PoolInner {
                buffers: Vec::new(),
                reuses: 0,
                misses: 0,
                discarded: 0,
            }),
        }
    }

    /// Create the pool with `max_pooled` buffers allocated up front.
    pub fn pre_allocated(buffer_size: usize, max_pooled: usize) -> Self {
        let pool = Self::new(buffer_size, max_pooled);
        {
            let mut inner = pool.inner.lock().unwrap();
            for _ in 0..max_pooled {
                inner.buffers.push(vec![0u8; buffer_size]);
            }
        }
        pool
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Get a buffer of exactly `buffer_size` bytes, reusing a pooled one
    /// when available.
    pub fn acquire(&self) -> Vec<u8> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(mut buf) = inner.buffers.pop() {
            inner.reuses += 1;
            buf.clear();
            buf.resize(self.buffer_size, 0);
            buf
        } else {
            inner.misses += 1;
            vec![0u8; self.buffer_size]
        }
    }

    /// Get a buffer of at least `requested` bytes. Requests at or below the
    /// pool size are served from the pool; larger ones get a one-shot
    /// allocation that `release` will not retain.
    pub fn acquire_for(&self, requested: usize) -> Vec<u8> {
        if requested <= self.buffer_size {
            self.acquire()
        } else {
            trace!(
                "Buffer request of {} bytes exceeds pool size {}, one-shot allocation",
                requested, self.buffer_size
            );
            let mut inner = self.inner.lock().unwrap();
            inner.misses += 1;
            drop(inner);
            vec![0u8; requested]
        }
    }

    /// Return a buffer to the pool. Buffers of the wrong size and buffers
    /// arriving while the pool is full are discarded.
    pub fn release(&self, buf: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        if buf.len() != self.buffer_size || inner.buffers.len() >= self.max_pooled {
            inner.discarded += 1;
            return;
        }
        inner.buffers.push(buf);
    }

    pub fn stats(&self) -> BufferPoolStats {
        let inner = self.inner.lock().unwrap();
        BufferPoolStats {
            reuses: inner.reuses,
            misses: inner.misses,
            discarded: inner.discarded,
            available: inner.buffers.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_reuse() {
        let pool = BufferPool::new(1024, 4);

        let buf = pool.acquire();
        assert_eq!(buf.len(), 1024);
        assert_eq!(pool.stats().misses, 1);

        pool.release(buf);
        assert_eq!(pool.stats().available, 1);

        let buf = pool.acquire();
        assert_eq!(buf.len(), 1024);
        let stats = pool.stats();
        assert_eq!(stats.reuses, 1);
        assert_eq!(stats.available, 0);
    }

    #[test]
    fn test_acquire_for_oversize_is_one_shot() {
        let pool = BufferPool::new(1024, 4);

        let big = pool.acquire_for(4096);
        assert_eq!(big.len(), 4096);

        // Wrong-size buffers never enter the pool
        pool.release(big);
        assert_eq!(pool.stats().available, 0);
        assert_eq!(pool.stats().discarded, 1);
    }

    #[test]
    fn test_acquire_for_small_uses_pool() {
        let pool = BufferPool::new(1024, 4);
        let buf = pool.acquire_for(100);
        assert_eq!(buf.len(), 1024);
        pool.release(buf);
        assert_eq!(pool.stats().available, 1);
    }

    #[test]
    fn test_pool_cap() {
        let pool = BufferPool::new(64, 2);
        let a = pool.acquire();
        let b = pool.acquire();
        let c = pool.acquire();

        pool.release(a);
        pool.release(b);
        pool.release(c);

        // Third release exceeds max_pooled and is discarded
        assert_eq!(pool.stats().available, 2);
        assert_eq!(pool.stats().discarded, 1);
    }

    #[test]
    fn test_pre_allocation() {
        let pool = BufferPool::pre_allocated(256, 3);
        assert_eq!(pool.stats().available, 3);

        let _buf = pool.acquire();
        let stats = pool.stats();
        assert_eq!(stats.reuses, 1);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn test_hit_rate_bounds() {
        let pool = BufferPool::new(128, 2);
        assert_eq!(pool.stats().hit_rate(), 0.0);

        let buf = pool.acquire();
        pool.release(buf);
        for _ in 0..10 {
            let buf = pool.acquire();
            pool.release(buf);
        }

        let rate = pool.stats().hit_rate();
        assert!(rate > 0.0 && rate <= 1.0);
    }
}
