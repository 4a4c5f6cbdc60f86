//! Size-classed byte buffer pool for frame payloads.
//!
//! Framed-mode capture reads every payload into a buffer from this pool, and
//! the consumer hands it back through [`crate::Frame::release`] (or by
//! dropping the frame). Buffers are grouped into three classes so a 5 KB
//! P-frame does not pin a 1 MB allocation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Capacity of each size class, smallest first.
pub const SIZE_CLASSES: [usize; 3] = [64 * 1024, 256 * 1024, 1024 * 1024];

/// Default number of idle buffers kept per class.
pub const DEFAULT_MAX_PER_CLASS: usize = 64;

/// Buffers smaller than this are not worth keeping.
const MIN_POOLED_CAPACITY: usize = SIZE_CLASSES[0] / 2;

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PoolStats {
    /// Buffers freshly allocated.
    pub allocations: u64,
    /// Requests served from an idle buffer.
    pub reuses: u64,
    /// Idle buffers currently held, summed over classes.
    pub idle: usize,
}

impl PoolStats {
    /// `reuses / (allocations + reuses)`, or 0 when nothing was requested.
    pub fn reuse_rate(&self) -> f64 {
        let total = self.allocations + self.reuses;
        if total == 0 {
            0.0
        } else {
            self.reuses as f64 / total as f64
        }
    }
}

/// Thread-safe buffer pool. Share it as `Arc<BufferPool>`.
#[derive(Debug)]
pub struct BufferPool {
    classes: [Mutex<Vec<Vec<u8>>>; 3],
    max_per_class: usize,
    allocations: AtomicU64,
    reuses: AtomicU64,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    /// Create a pool keeping up to [`DEFAULT_MAX_PER_CLASS`] idle buffers per class.
    pub fn new() -> Self {
        Self::with_max_per_class(DEFAULT_MAX_PER_CLASS)
    }

    /// Create a pool with a custom per-class idle limit.
    pub fn with_max_per_class(max_per_class: usize) -> Self {
        Self {
            classes: [
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
            ],
            max_per_class,
            allocations: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
        }
    }

    /// Smallest class that fits `size` bytes.
    fn class_for_request(size: usize) -> Option<usize> {
        SIZE_CLASSES.iter().position(|&cap| size <= cap)
    }

    /// Largest class whose size the buffer's capacity covers.
    fn class_for_capacity(capacity: usize) -> Option<usize> {
        SIZE_CLASSES.iter().rposition(|&cap| capacity >= cap)
    }

    /// Get a zero-filled buffer of length exactly `size`.
    pub fn acquire(&self, size: usize) -> Vec<u8> {
        let Some(class) = Self::class_for_request(size) else {
            self.allocations.fetch_add(1, Ordering::Relaxed);
            return vec![0u8; size];
        };

        let pooled = self.classes[class]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        match pooled {
            Some(mut buf) if buf.capacity() >= size => {
                self.reuses.fetch_add(1, Ordering::Relaxed);
                buf.clear();
                buf.resize(size, 0);
                buf
            }
            _ => {
                self.allocations.fetch_add(1, Ordering::Relaxed);
                let mut buf = Vec::with_capacity(SIZE_CLASSES[class]);
                buf.resize(size, 0);
                buf
            }
        }
    }

    /// Return a buffer for reuse.
    ///
    /// Buffers too small to be useful, larger than the biggest class, or
    /// arriving at a full class are dropped.
    pub fn release(&self, mut buf: Vec<u8>) {
        let capacity = buf.capacity();
        if capacity < MIN_POOLED_CAPACITY || capacity > SIZE_CLASSES[SIZE_CLASSES.len() - 1] {
            return;
        }
        // Between the minimum and the first class: keep it with the first class
        let class = Self::class_for_capacity(capacity).unwrap_or(0);

        let mut idle = self.classes[class]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.max_per_class {
            buf.clear();
            idle.push(buf);
        }
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        let idle = self
            .classes
            .iter()
            .map(|c| c.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum();
        PoolStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            reuses: self.reuses.load(Ordering::Relaxed),
            idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_acquire_exact_length() {
        let pool = BufferPool::new();
        for size in [0usize, 1, 5000, 64 * 1024, 64 * 1024 + 1, 900_000, 2 * 1024 * 1024] {
            let buf = pool.acquire(size);
            assert_eq!(buf.len(), size);
            assert!(buf.iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_class_capacity() {
        let pool = BufferPool::new();
        assert!(pool.acquire(100).capacity() >= 64 * 1024);
        let mid = pool.acquire(100_000).capacity();
        assert!(mid >= 256 * 1024 && mid < 1024 * 1024);
        assert!(pool.acquire(300_000).capacity() >= 1024 * 1024);
    }

    #[test]
    fn test_reuse_after_release() {
        let pool = BufferPool::new();
        let mut buf = pool.acquire(1000);
        buf[0] = 0xAB;
        pool.release(buf);

        let again = pool.acquire(2000);
        assert_eq!(again.len(), 2000);
        assert_eq!(again[0], 0);

        let stats = pool.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.reuses, 1);
        assert!((stats.reuse_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_oversized_not_pooled() {
        let pool = BufferPool::new();
        let big = pool.acquire(3 * 1024 * 1024);
        pool.release(big);
        assert_eq!(pool.stats().idle, 0);
    }

    #[test]
    fn test_small_buffers_dropped() {
        let pool = BufferPool::new();
        pool.release(Vec::with_capacity(1024));
        assert_eq!(pool.stats().idle, 0);
        pool.release(Vec::with_capacity(40 * 1024));
        assert_eq!(pool.stats().idle, 1);
    }

    #[test]
    fn test_max_per_class() {
        let pool = BufferPool::with_max_per_class(2);
        let bufs: Vec<_> = (0..4).map(|_| pool.acquire(10)).collect();
        for buf in bufs {
            pool.release(buf);
        }
        assert_eq!(pool.stats().idle, 2);
    }

    #[test]
    fn test_empty_stats() {
        assert_eq!(BufferPool::new().stats().reuse_rate(), 0.0);
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let pool = Arc::new(BufferPool::with_max_per_class(8));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let mut buf = pool.acquire(1000 + (t * 31 + i) % 60_000);
                        // Each holder sees a private buffer
                        buf[0] = t as u8;
                        std::thread::yield_now();
                        assert_eq!(buf[0], t as u8);
                        pool.release(buf);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.allocations + stats.reuses, 8 * 200);
        assert!(stats.idle <= 8);
    }
}
