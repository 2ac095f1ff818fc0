//! Per-replica runtime state: health status, in-flight load, latency EMA
//! (`spec.md` §4.11).
//!
//! Grounded on `DatabaseHealth`/`DatabaseNode` in
//! `examples/other_examples/4bd94680_scr1ptjunk13-defi-risk-monitor__src-database-replication.rs.rs`,
//! generalized from that file's binary up/down flag into the four-state
//! machine `spec.md` names.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use super::descriptor::ReplicaDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaStatus {
    Healthy,
    Unhealthy,
    Recovering,
    Maintenance,
}

/// Runtime state tracked alongside one [`ReplicaDescriptor`].
pub struct ReplicaInfo {
    pub descriptor: ReplicaDescriptor,
    status: Mutex<ReplicaStatus>,
    last_health_check: Mutex<Option<Instant>>,
    in_flight: AtomicU64,
    latency_ema_micros_bits: AtomicU64,
    total_queries: AtomicU64,
    successful_queries: AtomicU64,
    failed_queries: AtomicU64,
    consecutive_failures: AtomicU64,
    consecutive_successes: AtomicU64,
}

impl ReplicaInfo {
    pub fn new(descriptor: ReplicaDescriptor) -> Self {
        Self {
            descriptor,
            status: Mutex::new(ReplicaStatus::Recovering),
            last_health_check: Mutex::new(None),
            in_flight: AtomicU64::new(0),
            latency_ema_micros_bits: AtomicU64::new(0f64.to_bits()),
            total_queries: AtomicU64::new(0),
            successful_queries: AtomicU64::new(0),
            failed_queries: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            consecutive_successes: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> ReplicaStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: ReplicaStatus) {
        *self.status.lock() = status;
    }

    pub fn record_health_check(&self, now: Instant) {
        *self.last_health_check.lock() = Some(now);
    }

    pub fn last_health_check(&self) -> Option<Instant> {
        *self.last_health_check.lock()
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn begin_query(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    /// Connection-checkout counter used by the read-replica façade
    /// (`spec.md` §4.10: `IncrementConnections`/`DecrementConnections`),
    /// independent of `record_query`'s query-outcome bookkeeping below.
    pub fn increment_connections(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_connections(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn latency_ema(&self) -> Duration {
        Duration::from_micros(f64::from_bits(self.latency_ema_micros_bits.load(Ordering::Relaxed)) as u64)
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn consecutive_successes(&self) -> u64 {
        self.consecutive_successes.load(Ordering::Relaxed)
    }

    /// Records completion of one query that was bracketed by
    /// [`Self::begin_query`] (decrements `in_flight` as well as updating
    /// counters). `spec.md` §4.11: latency is tracked as an equal-weight
    /// EMA, seeded by the first observed sample.
    pub fn record_query(&self, latency: Duration, success: bool) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.record_outcome(latency, success);
    }

    /// Records a health-check probe's outcome. Unlike [`Self::record_query`]
    /// this does not touch `in_flight`: a probe is not a connection
    /// checkout tracked through [`Self::increment_connections`] (`spec.md`
    /// §4.10 "Health check" — the probe acquires and releases its own
    /// short-lived connection, which is not the same counter as in-flight
    /// application queries).
    pub fn record_probe(&self, latency: Duration, success: bool) {
        self.record_outcome(latency, success);
    }

    fn record_outcome(&self, latency: Duration, success: bool) {
        let n = self.total_queries.fetch_add(1, Ordering::Relaxed) + 1;

        // `spec.md` §4.11: "an equal-weight EMA of observed samples (first
        // sample seeds it)" — every sample contributes `1/n`, the same
        // cumulative-average shape `Metrics::record` uses for its own
        // averages, rather than a fixed-alpha exponential decay that would
        // over-weight recent samples.
        let sample = latency.as_micros() as f64;
        let mut current = f64::from_bits(self.latency_ema_micros_bits.load(Ordering::Relaxed));
        loop {
            let next = current + (sample - current) / (n as f64);
            match self.latency_ema_micros_bits.compare_exchange_weak(
                current.to_bits(),
                next.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = f64::from_bits(observed),
            }
        }

        if success {
            self.successful_queries.fetch_add(1, Ordering::Relaxed);
            self.consecutive_successes.fetch_add(1, Ordering::Relaxed);
            self.consecutive_failures.store(0, Ordering::Relaxed);
        } else {
            self.failed_queries.fetch_add(1, Ordering::Relaxed);
            self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
            self.consecutive_successes.store(0, Ordering::Relaxed);
        }
    }

    pub fn counters(&self) -> (u64, u64, u64) {
        (
            self.total_queries.load(Ordering::Relaxed),
            self.successful_queries.load(Ordering::Relaxed),
            self.failed_queries.load(Ordering::Relaxed),
        )
    }

    /// `spec.md` §4.11: `IsAvailable(r) == status(r) == Healthy &&
    /// connections(r) < maxConnections(r)` (testable property 5).
    pub fn is_available(&self) -> bool {
        self.status() == ReplicaStatus::Healthy && self.in_flight() < self.descriptor.max_connections as u64
    }

    /// `spec.md` §4.11: `success-rate = successful/total*100` (100 when
    /// `total == 0`).
    pub fn success_rate(&self) -> f64 {
        let (total, success, _) = self.counters();
        if total == 0 {
            100.0
        } else {
            (success as f64 / total as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> ReplicaInfo {
        ReplicaInfo::new(ReplicaDescriptor::new("r1", "postgres://host/db"))
    }

    #[test]
    fn only_healthy_status_is_available() {
        let info = info();
        info.set_status(ReplicaStatus::Healthy);
        assert!(info.is_available());
        for status in [ReplicaStatus::Unhealthy, ReplicaStatus::Recovering, ReplicaStatus::Maintenance] {
            info.set_status(status);
            assert!(!info.is_available());
        }
    }

    #[test]
    fn record_query_updates_counters_and_consecutive_streaks() {
        let info = info();
        info.begin_query();
        info.record_query(Duration::from_millis(5), true);
        info.begin_query();
        info.record_query(Duration::from_millis(5), false);
        let (total, success, failed) = info.counters();
        assert_eq!((total, success, failed), (2, 1, 1));
        assert_eq!(info.consecutive_failures(), 1);
        assert_eq!(info.consecutive_successes(), 0);
    }

    #[test]
    fn latency_ema_converges_toward_repeated_sample() {
        let info = info();
        for _ in 0..50 {
            info.begin_query();
            info.record_query(Duration::from_millis(10), true);
        }
        let ema = info.latency_ema().as_millis();
        assert!((9..=11).contains(&ema));
    }

    #[test]
    fn available_requires_in_flight_below_max_connections() {
        let info = ReplicaInfo::new(ReplicaDescriptor::new("r1", "postgres://host/db").with_max_connections(2));
        info.set_status(ReplicaStatus::Healthy);
        info.increment_connections();
        assert!(info.is_available());
        info.increment_connections();
        assert!(!info.is_available());
        info.decrement_connections();
        assert!(info.is_available());
    }

    #[test]
    fn success_rate_is_100_percent_with_no_queries() {
        let info = info();
        assert_eq!(info.success_rate(), 100.0);
    }

    #[test]
    fn success_rate_reflects_successful_fraction() {
        let info = info();
        info.begin_query();
        info.record_query(Duration::from_millis(1), true);
        info.begin_query();
        info.record_query(Duration::from_millis(1), true);
        info.begin_query();
        info.record_query(Duration::from_millis(1), false);
        assert!((info.success_rate() - 66.666).abs() < 0.01);
    }

    #[test]
    fn record_probe_does_not_touch_in_flight_counter() {
        let info = info();
        info.increment_connections();
        info.record_probe(Duration::from_millis(3), true);
        assert_eq!(info.in_flight(), 1);
        let (total, success, _) = info.counters();
        assert_eq!((total, success), (1, 1));
    }
}
