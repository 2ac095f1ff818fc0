//! Power-of-two byte-slice recycling (`spec.md` §4.2).
//!
//! Grounded on the teacher's use of `bytes::BytesMut` as its wire-buffer
//! type (`postgres/src/connection.rs`'s `ToSql` implementations write into
//! a `BytesMut`); this module gives that buffer type a recycling pool so
//! hot-path allocation churn is bounded, the same concern the teacher
//! addresses for prepared-statement churn with its per-connection
//! `LruCache`.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use bytes::BytesMut;
use parking_lot::Mutex;

const NUM_BUCKETS: u32 = 32; // covers sizes up to 2^31

/// Default trim interval, `spec.md` §4.2.
pub const DEFAULT_TRIM_INTERVAL: Duration = Duration::from_secs(30);

/// Per-bucket free list, independently lockable (`spec.md` §5: "Buffer-pool
/// buckets are independently lockable").
struct Bucket {
    free: Mutex<Vec<BytesMut>>,
    retained: AtomicU64,
}

impl Bucket {
    fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            retained: AtomicU64::new(0),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BufferPoolStats {
    pub allocations: u64,
    pub pooled_buffers: u64,
    pub total_gets: u64,
    pub total_puts: u64,
}

/// The buffer pool. Hot-path `get`/`put` only ever touch one bucket's
/// mutex, never a pool-wide lock.
pub struct BufferPool {
    buckets: Vec<Bucket>,
    allocations: AtomicU64,
    total_gets: AtomicU64,
    total_puts: AtomicU64,
    trim_interval: Duration,
}

fn bucket_index(size: usize) -> usize {
    let pow2 = size.max(1).next_power_of_two();
    pow2.trailing_zeros() as usize
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_trim_interval(DEFAULT_TRIM_INTERVAL)
    }

    pub fn with_trim_interval(trim_interval: Duration) -> Self {
        Self {
            buckets: (0..NUM_BUCKETS).map(|_| Bucket::new()).collect(),
            allocations: AtomicU64::new(0),
            total_gets: AtomicU64::new(0),
            total_puts: AtomicU64::new(0),
            trim_interval,
        }
    }

    /// Returns a buffer with capacity >= `size`.
    pub fn get(&self, size: usize) -> BytesMut {
        self.total_gets.fetch_add(1, Ordering::Relaxed);
        let idx = bucket_index(size);
        let bucket = &self.buckets[idx.min(self.buckets.len() - 1)];
        if let Some(mut buf) = bucket.free.lock().pop() {
            bucket.retained.fetch_sub(1, Ordering::Relaxed);
            buf.clear();
            return buf;
        }
        self.allocations.fetch_add(1, Ordering::Relaxed);
        BytesMut::with_capacity(1usize << idx.min(self.buckets.len() - 1))
    }

    /// Returns `buf` to its bucket for reuse.
    pub fn put(&self, buf: BytesMut) {
        self.total_puts.fetch_add(1, Ordering::Relaxed);
        let idx = bucket_index(buf.capacity());
        let bucket = &self.buckets[idx.min(self.buckets.len() - 1)];
        bucket.free.lock().push(buf);
        bucket.retained.fetch_add(1, Ordering::Relaxed);
    }

    /// Bounds retained memory by clearing every bucket's free list.
    /// Intended to be invoked by a periodic trimmer every `trim_interval`.
    pub fn trim(&self) {
        for bucket in &self.buckets {
            let mut free = bucket.free.lock();
            bucket.retained.fetch_sub(free.len() as u64, Ordering::Relaxed);
            free.clear();
        }
    }

    pub fn trim_interval(&self) -> Duration {
        self.trim_interval
    }

    pub fn stats(&self) -> BufferPoolStats {
        let pooled_buffers = self
            .buckets
            .iter()
            .map(|b| b.retained.load(Ordering::Relaxed))
            .sum();
        BufferPoolStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            pooled_buffers,
            total_gets: self.total_gets.load(Ordering::Relaxed),
            total_puts: self.total_puts.load(Ordering::Relaxed),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns the periodic trimmer described in `spec.md` §4.2. Returns a
/// handle the caller can abort on shutdown.
pub fn spawn_trimmer(pool: std::sync::Arc<BufferPool>) -> tokio::task::JoinHandle<()> {
    let interval = pool.trim_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            pool.trim();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_capacity_at_least_requested() {
        let pool = BufferPool::new();
        let buf = pool.get(100);
        assert!(buf.capacity() >= 100);
    }

    #[test]
    fn put_then_get_reuses_buffer_without_new_allocation() {
        let pool = BufferPool::new();
        let buf = pool.get(64);
        pool.put(buf);
        let stats_before = pool.stats();
        let _reused = pool.get(64);
        let stats_after = pool.stats();
        assert_eq!(stats_after.allocations, stats_before.allocations);
    }

    #[test]
    fn trim_clears_retained_buffers() {
        let pool = BufferPool::new();
        pool.put(pool.get(64));
        pool.put(pool.get(128));
        assert!(pool.stats().pooled_buffers >= 2);
        pool.trim();
        assert_eq!(pool.stats().pooled_buffers, 0);
    }

    #[test]
    fn bucket_index_rounds_up_to_power_of_two() {
        assert_eq!(bucket_index(1), 0);
        assert_eq!(bucket_index(2), 1);
        assert_eq!(bucket_index(3), 2);
        assert_eq!(bucket_index(1024), 10);
        assert_eq!(bucket_index(1025), 11);
    }
}
