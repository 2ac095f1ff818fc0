//! Aggregate replica-fleet statistics (`spec.md` §4.13).

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use parking_lot::Mutex;

use super::info::{ReplicaInfo, ReplicaStatus};

/// A point-in-time snapshot, field names matching `spec.md` §4.13
/// exactly.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ReplicaStatsSnapshot {
    pub total_replicas: u64,
    pub healthy_replicas: u64,
    pub unhealthy_replicas: u64,
    pub recovering_replicas: u64,
    pub maintenance_replicas: u64,
    pub total_queries: u64,
    pub successful_queries: u64,
    pub failed_queries: u64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: f64,
    pub min_latency_ms: f64,
    pub failover_count: u64,
    pub uptime_seconds: u64,
    pub queries_per_second: f64,
    pub errors_per_second: f64,
    pub query_distribution: HashMap<String, u64>,
    pub error_distribution: HashMap<String, u64>,
}

/// Accumulates fleet-wide counters alongside the per-replica state in
/// [`ReplicaInfo`]; `failover_count` and the started-at clock live here
/// since no single replica owns them.
pub struct ReplicaStatsCollector {
    started_at: Instant,
    failover_count: AtomicU64,
    errors: Mutex<HashMap<String, u64>>,
}

impl ReplicaStatsCollector {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            failover_count: AtomicU64::new(0),
            errors: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_failover(&self) {
        self.failover_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, replica_id: &str) {
        *self.errors.lock().entry(replica_id.to_owned()).or_insert(0) += 1;
    }

    /// Resets accumulated counters without resetting the uptime clock
    /// (`spec.md` §4.13: "Reset clears counters but not the fleet's
    /// start-of-life clock").
    pub fn reset(&self) {
        self.failover_count.store(0, Ordering::Relaxed);
        self.errors.lock().clear();
    }

    pub fn snapshot(&self, replicas: &[std::sync::Arc<ReplicaInfo>]) -> ReplicaStatsSnapshot {
        let mut snapshot = ReplicaStatsSnapshot {
            total_replicas: replicas.len() as u64,
            failover_count: self.failover_count.load(Ordering::Relaxed),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            error_distribution: self.errors.lock().clone(),
            min_latency_ms: f64::MAX,
            ..Default::default()
        };

        let mut latency_sum_weighted = 0.0;
        let mut latency_samples = 0u64;

        for replica in replicas {
            match replica.status() {
                ReplicaStatus::Healthy => snapshot.healthy_replicas += 1,
                ReplicaStatus::Unhealthy => snapshot.unhealthy_replicas += 1,
                ReplicaStatus::Recovering => snapshot.recovering_replicas += 1,
                ReplicaStatus::Maintenance => snapshot.maintenance_replicas += 1,
            }

            let (total, success, failed) = replica.counters();
            snapshot.total_queries += total;
            snapshot.successful_queries += success;
            snapshot.failed_queries += failed;
            snapshot
                .query_distribution
                .insert(replica.descriptor.id.clone(), total);

            if total > 0 {
                let latency_ms = replica.latency_ema().as_secs_f64() * 1000.0;
                latency_sum_weighted += latency_ms * total as f64;
                latency_samples += total;
                snapshot.max_latency_ms = snapshot.max_latency_ms.max(latency_ms);
                snapshot.min_latency_ms = snapshot.min_latency_ms.min(latency_ms);
            }
        }

        if latency_samples > 0 {
            snapshot.avg_latency_ms = latency_sum_weighted / latency_samples as f64;
        } else {
            snapshot.min_latency_ms = 0.0;
        }

        let uptime = snapshot.uptime_seconds.max(1) as f64;
        snapshot.queries_per_second = snapshot.total_queries as f64 / uptime;
        snapshot.errors_per_second = snapshot.failed_queries as f64 / uptime;

        snapshot
    }
}

impl Default for ReplicaStatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::descriptor::ReplicaDescriptor;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn snapshot_counts_replicas_by_status() {
        let collector = ReplicaStatsCollector::new();
        let a = Arc::new(ReplicaInfo::new(ReplicaDescriptor::new("a", "postgres://host/db")));
        a.set_status(ReplicaStatus::Healthy);
        let b = Arc::new(ReplicaInfo::new(ReplicaDescriptor::new("b", "postgres://host/db")));
        b.set_status(ReplicaStatus::Unhealthy);
        let snapshot = collector.snapshot(&[a, b]);
        assert_eq!(snapshot.total_replicas, 2);
        assert_eq!(snapshot.healthy_replicas, 1);
        assert_eq!(snapshot.unhealthy_replicas, 1);
    }

    #[test]
    fn reset_clears_failover_count_but_not_uptime() {
        let collector = ReplicaStatsCollector::new();
        collector.record_failover();
        collector.reset();
        let snapshot = collector.snapshot(&[]);
        assert_eq!(snapshot.failover_count, 0);
    }

    #[test]
    fn snapshot_aggregates_query_latency_extremes() {
        let collector = ReplicaStatsCollector::new();
        let a = Arc::new(ReplicaInfo::new(ReplicaDescriptor::new("a", "postgres://host/db")));
        a.begin_query();
        a.record_query(Duration::from_millis(5), true);
        let b = Arc::new(ReplicaInfo::new(ReplicaDescriptor::new("b", "postgres://host/db")));
        b.begin_query();
        b.record_query(Duration::from_millis(50), true);
        let snapshot = collector.snapshot(&[a, b]);
        assert!(snapshot.max_latency_ms >= snapshot.min_latency_ms);
        assert_eq!(snapshot.total_queries, 2);
    }
}
