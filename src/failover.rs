//! Node health table and deterministic failover selection (`spec.md`
//! §4.7).
//!
//! Grounded on the node-health bookkeeping in
//! `examples/other_examples/4bd94680_scr1ptjunk13-defi-risk-monitor__src-database-replication.rs.rs`
//! (`DatabaseReplicationManager`'s per-node health map and
//! `attempt_failover`), simplified to the flat healthy/unhealthy table
//! `spec.md` calls for — the finer-grained `DatabaseHealth` state machine
//! lives in `replica::info` instead, which is where this crate's spec
//! puts per-replica status.

use std::{
    future::Future,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::RwLock;

use crate::error::Error;

#[derive(Debug, Default)]
pub struct FailoverStats {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed_no_healthy_node: AtomicU64,
    failovers: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FailoverStatsSnapshot {
    pub total: u64,
    pub succeeded: u64,
    pub failed_no_healthy_node: u64,
    pub failovers: u64,
}

impl FailoverStats {
    fn snapshot(&self) -> FailoverStatsSnapshot {
        FailoverStatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed_no_healthy_node: self.failed_no_healthy_node.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
        }
    }
}

/// Tracks a flat healthy/unhealthy verdict per node id and drives
/// operations against the first healthy node in declaration order.
pub struct FailoverController {
    /// Declaration order is preserved so node selection is deterministic
    /// (`spec.md` §4.7: "selection among healthy nodes is by declaration
    /// order, not arbitrary map iteration").
    nodes: RwLock<Vec<(String, bool)>>,
    stats: FailoverStats,
}

impl FailoverController {
    pub fn new(node_ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            nodes: RwLock::new(node_ids.into_iter().map(|id| (id, true)).collect()),
            stats: FailoverStats::default(),
        }
    }

    pub fn mark_down(&self, node_id: &str) {
        let mut nodes = self.nodes.write();
        if let Some(entry) = nodes.iter_mut().find(|(id, _)| id == node_id) {
            entry.1 = false;
        }
    }

    pub fn mark_up(&self, node_id: &str) {
        let mut nodes = self.nodes.write();
        if let Some(entry) = nodes.iter_mut().find(|(id, _)| id == node_id) {
            entry.1 = true;
        }
    }

    pub fn healthy_nodes(&self) -> Vec<String> {
        self.nodes.read().iter().filter(|(_, healthy)| *healthy).map(|(id, _)| id.clone()).collect()
    }

    pub fn unhealthy_nodes(&self) -> Vec<String> {
        self.nodes.read().iter().filter(|(_, healthy)| !*healthy).map(|(id, _)| id.clone()).collect()
    }

    pub fn stats(&self) -> FailoverStatsSnapshot {
        self.stats.snapshot()
    }

    /// Attempts `operation` against the first healthy node in declaration
    /// order; on `Error::is_retryable()` failure, marks that node down and
    /// advances to the next healthy one, up to one attempt per healthy
    /// node.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T, Error>
    where
        F: FnMut(&str) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        self.stats.total.fetch_add(1, Ordering::Relaxed);
        let candidates = self.healthy_nodes();
        if candidates.is_empty() {
            self.stats.failed_no_healthy_node.fetch_add(1, Ordering::Relaxed);
            return Err(Error::NoHealthyReplicas);
        }

        let mut last_err = None;
        for (i, node_id) in candidates.iter().enumerate() {
            match operation(node_id).await {
                Ok(value) => {
                    self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                    return Ok(value);
                }
                Err(err) => {
                    let retryable = err.is_retryable();
                    if retryable {
                        self.mark_down(node_id);
                        if i + 1 < candidates.len() {
                            self.stats.failovers.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    last_err = Some(err);
                    if !retryable {
                        break;
                    }
                }
            }
        }
        Err(last_err.expect("at least one candidate was attempted"))
    }
}
