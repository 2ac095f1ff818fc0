//! Atomic counters and latency histograms for queries / connections /
//! transactions / the buffer pool (`spec.md` §4.4).
//!
//! The teacher wraps an internal fork of `prometheus` behind a `metrics`
//! facade crate (`register_convex_histogram!`, `StatusTimer`, ...) that we
//! do not carry into this standalone crate (see DESIGN.md). We build
//! directly on the real, published `prometheus` crate instead, which is
//! the same crate the facade itself wraps, and keep the teacher's texture:
//! one `register_*` call per named series, one small helper per timer.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicI64, AtomicU64, Ordering},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use prometheus::{Histogram, HistogramOpts, Registry};

/// Bucket boundaries from `spec.md` §4.4, in seconds.
const LATENCY_BUCKETS_SECONDS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 5.0, 10.0,
];

const MAX_ERROR_MESSAGE_LEN: usize = 50;
/// Sentinel `min` value so the first real observation always wins
/// (`spec.md` §4.4: "`min` fields reinitialize to a large sentinel").
const MIN_SENTINEL_MILLIS: i64 = i64::MAX;

fn truncate_error_message(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_MESSAGE_LEN {
        message.to_owned()
    } else {
        message.chars().take(MAX_ERROR_MESSAGE_LEN).collect()
    }
}

/// One counters+histogram family, shared shape for query/connection/
/// transaction metrics.
pub struct OperationMetrics {
    name: &'static str,
    total: AtomicU64,
    failed: AtomicU64,
    count_for_avg: AtomicU64,
    avg_millis_bits: AtomicU64, // f64 bit pattern, CAS-updated
    max_millis: AtomicI64,
    min_millis: AtomicI64,
    histogram: Histogram,
    errors: Mutex<HashMap<String, u64>>,
}

impl OperationMetrics {
    fn new(registry: &Registry, name: &'static str) -> Self {
        let histogram = Histogram::with_opts(
            HistogramOpts::new(format!("pgcluster_{name}_latency_seconds"), format!("Latency of {name} operations"))
                .buckets(LATENCY_BUCKETS_SECONDS.to_vec()),
        )
        .expect("static histogram options are always valid");
        registry
            .register(Box::new(histogram.clone()))
            .expect("metric name registered exactly once per Metrics instance");
        Self {
            name,
            total: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            count_for_avg: AtomicU64::new(0),
            avg_millis_bits: AtomicU64::new(0f64.to_bits()),
            max_millis: AtomicI64::new(0),
            min_millis: AtomicI64::new(MIN_SENTINEL_MILLIS),
            histogram,
            errors: Mutex::new(HashMap::new()),
        }
    }

    /// Records one observation. `spec.md` §4.4: "averages use
    /// `avg = (avg*(n-1) + sample)/n`"; extremes use CAS loops; totals use
    /// atomic add.
    pub fn record(&self, duration: Duration, error: Option<&str>) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let millis = duration.as_secs_f64() * 1000.0;
        self.histogram.observe(duration.as_secs_f64());

        let n = self.count_for_avg.fetch_add(1, Ordering::Relaxed) + 1;
        let mut current = f64::from_bits(self.avg_millis_bits.load(Ordering::Relaxed));
        loop {
            let next = (current * ((n - 1) as f64) + millis) / (n as f64);
            match self.avg_millis_bits.compare_exchange_weak(
                current.to_bits(),
                next.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = f64::from_bits(observed),
            }
        }

        let millis_i64 = millis.round() as i64;
        let mut max = self.max_millis.load(Ordering::Relaxed);
        while millis_i64 > max {
            match self.max_millis.compare_exchange_weak(
                max,
                millis_i64,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => max = observed,
            }
        }
        let mut min = self.min_millis.load(Ordering::Relaxed);
        while millis_i64 < min {
            match self.min_millis.compare_exchange_weak(
                min,
                millis_i64,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => min = observed,
            }
        }

        if let Some(message) = error {
            self.failed.fetch_add(1, Ordering::Relaxed);
            let key = truncate_error_message(message);
            *self.errors.lock().entry(key).or_insert(0) += 1;
        }
    }

    pub fn snapshot(&self) -> OperationMetricsSnapshot {
        let min_raw = self.min_millis.load(Ordering::Relaxed);
        OperationMetricsSnapshot {
            name: self.name,
            total: self.total.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            avg_millis: f64::from_bits(self.avg_millis_bits.load(Ordering::Relaxed)),
            max_millis: self.max_millis.load(Ordering::Relaxed),
            min_millis: if min_raw == MIN_SENTINEL_MILLIS { 0 } else { min_raw },
            errors_by_message: self.errors.lock().clone(),
        }
    }

    fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.count_for_avg.store(0, Ordering::Relaxed);
        self.avg_millis_bits.store(0f64.to_bits(), Ordering::Relaxed);
        self.max_millis.store(0, Ordering::Relaxed);
        self.min_millis.store(MIN_SENTINEL_MILLIS, Ordering::Relaxed);
        self.errors.lock().clear();
    }
}

#[derive(Debug, Clone, Default)]
pub struct OperationMetricsSnapshot {
    pub name: &'static str,
    pub total: u64,
    pub failed: u64,
    pub avg_millis: f64,
    pub max_millis: i64,
    pub min_millis: i64,
    pub errors_by_message: HashMap<String, u64>,
}

/// A lightweight RAII timer, grounded on the teacher's `Timer`/`StatusTimer`
/// helpers (`postgres/src/metrics.rs`): construct at operation start,
/// `finish(success)` at operation end.
pub struct OpTimer<'a> {
    start: Instant,
    target: &'a OperationMetrics,
}

impl<'a> OpTimer<'a> {
    /// Records the elapsed time as a failed observation with `message`.
    pub fn fail(self, message: impl Into<String>) {
        let duration = self.start.elapsed();
        self.target.record(duration, Some(&message.into()));
    }

    /// Records the elapsed time as a successful observation.
    pub fn finish(self) {
        let duration = self.start.elapsed();
        self.target.record(duration, None);
    }
}

pub struct Metrics {
    registry: Registry,
    pub query: OperationMetrics,
    pub connection: OperationMetrics,
    pub transaction: OperationMetrics,
    buffer_pool_hits: AtomicU64,
    buffer_pool_misses: AtomicU64,
    buffer_pool_allocations: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        Self {
            query: OperationMetrics::new(&registry, "query"),
            connection: OperationMetrics::new(&registry, "connection"),
            transaction: OperationMetrics::new(&registry, "transaction"),
            registry,
            buffer_pool_hits: AtomicU64::new(0),
            buffer_pool_misses: AtomicU64::new(0),
            buffer_pool_allocations: AtomicU64::new(0),
        }
    }

    pub fn start_query(&self) -> OpTimer<'_> {
        OpTimer {
            start: Instant::now(),
            target: &self.query,
        }
    }

    pub fn start_connection(&self) -> OpTimer<'_> {
        OpTimer {
            start: Instant::now(),
            target: &self.connection,
        }
    }

    pub fn start_transaction(&self) -> OpTimer<'_> {
        OpTimer {
            start: Instant::now(),
            target: &self.transaction,
        }
    }

    pub fn record_buffer_pool_hit(&self) {
        self.buffer_pool_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_buffer_pool_miss(&self) {
        self.buffer_pool_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_buffer_pool_allocation(&self) {
        self.buffer_pool_allocations.fetch_add(1, Ordering::Relaxed);
    }

    /// `spec.md` §4.4: "hit-rate = hits/(hits+misses)".
    pub fn buffer_pool_hit_rate(&self) -> f64 {
        let hits = self.buffer_pool_hits.load(Ordering::Relaxed);
        let misses = self.buffer_pool_misses.load(Ordering::Relaxed);
        if hits + misses == 0 {
            return 0.0;
        }
        hits as f64 / (hits + misses) as f64
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Restores all counters/buckets; `min` fields reinitialize to the
    /// sentinel so the next observation wins (`spec.md` §4.4).
    pub fn reset(&self) {
        self.query.reset();
        self.connection.reset();
        self.transaction.reset();
        self.buffer_pool_hits.store(0, Ordering::Relaxed);
        self.buffer_pool_misses.store(0, Ordering::Relaxed);
        self.buffer_pool_allocations.store(0, Ordering::Relaxed);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_total_and_failed_monotonically() {
        let metrics = Metrics::new();
        metrics.start_query().finish();
        let timer = metrics.start_query();
        timer.fail("connection refused");
        metrics.query.record(Duration::from_millis(5), Some("connection refused"));
        let snapshot = metrics.query.snapshot();
        assert_eq!(snapshot.total, 2);
        assert_eq!(snapshot.failed, 1);
    }

    #[test]
    fn min_reinitializes_to_sentinel_after_reset() {
        let metrics = Metrics::new();
        metrics.query.record(Duration::from_millis(5), None);
        assert_eq!(metrics.query.snapshot().min_millis, 5);
        metrics.reset();
        metrics.query.record(Duration::from_millis(42), None);
        assert_eq!(metrics.query.snapshot().min_millis, 42);
    }

    #[test]
    fn error_messages_are_truncated_to_50_chars() {
        let metrics = Metrics::new();
        let long = "x".repeat(200);
        metrics.query.record(Duration::from_millis(1), Some(&long));
        let snapshot = metrics.query.snapshot();
        let (key, _) = snapshot.errors_by_message.iter().next().unwrap();
        assert_eq!(key.len(), MAX_ERROR_MESSAGE_LEN);
    }

    #[test]
    fn buffer_pool_hit_rate_is_zero_with_no_samples() {
        let metrics = Metrics::new();
        assert_eq!(metrics.buffer_pool_hit_rate(), 0.0);
        metrics.record_buffer_pool_hit();
        metrics.record_buffer_pool_miss();
        assert_eq!(metrics.buffer_pool_hit_rate(), 0.5);
    }

    #[test]
    fn max_and_min_track_extremes_under_concurrent_updates() {
        use std::sync::Arc;
        let metrics = Arc::new(Metrics::new());
        let mut handles = vec![];
        for i in 1..=50u64 {
            let metrics = metrics.clone();
            handles.push(std::thread::spawn(move || {
                metrics.query.record(Duration::from_millis(i), None);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let snapshot = metrics.query.snapshot();
        assert_eq!(snapshot.max_millis, 50);
        assert_eq!(snapshot.min_millis, 1);
        assert_eq!(snapshot.total, 50);
    }
}
