//! Read/write split façade over the primary [`Pool`] and the
//! [`ReplicaManager`] (`spec.md` §4.12).
//!
//! Grounded on `DatabaseReplicationManager::get_read_pool`/`get_write_pool`
//! in
//! `examples/other_examples/4bd94680_scr1ptjunk13-defi-risk-monitor__src-database-replication.rs.rs`:
//! writes always go to the primary pool, reads are routed through the
//! manager's selection logic, with `SecondaryPreferred` falling back to
//! the primary when no replica is available — the same fallback that
//! file's `get_read_pool` performs when the replica set is empty.

use std::{
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{
    connection::Connection,
    error::Error,
    pool::Pool,
    replica::{
        info::ReplicaInfo,
        manager::{ReadPreference, ReplicaManager},
    },
};

#[derive(Debug, Clone, Copy, Default)]
pub struct ReplicaPoolStats {
    pub reads: u64,
    pub read_failures: u64,
    pub writes: u64,
    pub write_failures: u64,
    /// `SecondaryPreferred` reads that fell back to the primary because no
    /// replica was available (`spec.md` §4.10 read-preference mapping).
    pub primary_fallbacks: u64,
}

#[derive(Debug, Default)]
struct Counters {
    reads: AtomicU64,
    read_failures: AtomicU64,
    writes: AtomicU64,
    write_failures: AtomicU64,
    primary_fallbacks: AtomicU64,
}

/// A held read connection. Wraps either a replica connection (decrementing
/// that replica's in-flight counter on drop, `spec.md` §4.12: "wrap in a
/// lease that decrements on release") or, for primary-routed reads, a
/// plain primary connection with no replica bookkeeping.
pub struct ReadLease {
    conn: Connection,
    replica: Option<Arc<ReplicaInfo>>,
}

impl ReadLease {
    /// The replica this lease was acquired from, or `None` if it was
    /// served directly from the primary (PrimaryOnly routing, or a
    /// SecondaryPreferred fallback).
    pub fn replica_id(&self) -> Option<&str> {
        self.replica.as_ref().map(|r| r.descriptor.id.as_str())
    }
}

impl Deref for ReadLease {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl DerefMut for ReadLease {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

impl Drop for ReadLease {
    fn drop(&mut self) {
        if let Some(replica) = &self.replica {
            replica.decrement_connections();
        }
    }
}

/// `{ primary-pool, replica-manager, read-preference, read-stats,
/// write-stats, closed }` from `spec.md` §4.12. The read-preference
/// setting lives on the manager (`ReplicaManager::set_read_preference`)
/// rather than duplicated here, so there is exactly one place callers
/// configure it.
pub struct ReplicaPool {
    primary: Arc<Pool>,
    manager: Arc<ReplicaManager>,
    counters: Counters,
    closed: AtomicBool,
}

impl ReplicaPool {
    pub fn new(primary: Arc<Pool>, manager: Arc<ReplicaManager>) -> Arc<Self> {
        manager.start();
        Arc::new(Self {
            primary,
            manager,
            counters: Counters::default(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn manager(&self) -> &Arc<ReplicaManager> {
        &self.manager
    }

    pub fn primary(&self) -> &Arc<Pool> {
        &self.primary
    }

    pub fn set_read_preference(&self, preference: ReadPreference) {
        self.manager.set_read_preference(preference);
    }

    /// `AcquireWrite` (`spec.md` §4.12): always from the primary.
    pub async fn acquire_write(&self) -> Result<Connection, Error> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::PoolClosed);
        }
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.primary.acquire().await.map_err(|err| {
            self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
            err
        })
    }

    /// `AcquireRead(preference)` using the manager's currently configured
    /// preference.
    pub async fn acquire_read(&self) -> Result<ReadLease, Error> {
        self.acquire_read_with_preference(self.manager.read_preference()).await
    }

    /// `spec.md` §4.10 read-preference mapping, resolved at the façade
    /// per the spec's own open-question note: `PrimaryOnly` is handled
    /// here directly rather than by the manager (which would otherwise
    /// have no primary pool to route to and must return
    /// `PrimaryNotConfigured`).
    pub async fn acquire_read_with_preference(&self, preference: ReadPreference) -> Result<ReadLease, Error> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::PoolClosed);
        }
        self.counters.reads.fetch_add(1, Ordering::Relaxed);

        let result = match preference {
            ReadPreference::PrimaryOnly => self.acquire_primary_as_read().await,
            ReadPreference::SecondaryOnly => self.acquire_from_selected(self.manager.select_replica()).await,
            ReadPreference::SecondaryPreferred => match self.acquire_from_selected(self.manager.select_replica()).await {
                Ok(lease) => Ok(lease),
                Err(_) => {
                    self.counters.primary_fallbacks.fetch_add(1, Ordering::Relaxed);
                    self.acquire_primary_as_read().await
                }
            },
            ReadPreference::Nearest => {
                self.acquire_from_selected(self.manager.select_replica_with_strategy(crate::config::LoadBalanceMode::Latency)).await
            }
        };

        if result.is_err() {
            self.counters.read_failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn acquire_primary_as_read(&self) -> Result<ReadLease, Error> {
        let conn = self.primary.acquire().await?;
        Ok(ReadLease { conn, replica: None })
    }

    async fn acquire_from_selected(&self, selected: Result<Arc<ReplicaInfo>, Error>) -> Result<ReadLease, Error> {
        let replica = selected?;
        let pool = self
            .manager
            .pool_for(&replica.descriptor.id)
            .ok_or_else(|| Error::UnsupportedConnectionType(format!("replica {} has no backing pool", replica.descriptor.id)))?;
        replica.increment_connections();
        match pool.acquire().await {
            Ok(conn) => Ok(ReadLease {
                conn,
                replica: Some(replica),
            }),
            Err(err) => {
                replica.decrement_connections();
                Err(err)
            }
        }
    }

    pub fn stats(&self) -> ReplicaPoolStats {
        ReplicaPoolStats {
            reads: self.counters.reads.load(Ordering::Relaxed),
            read_failures: self.counters.read_failures.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            write_failures: self.counters.write_failures.load(Ordering::Relaxed),
            primary_fallbacks: self.counters.primary_fallbacks.load(Ordering::Relaxed),
        }
    }

    /// `spec.md` §4.12: "Close closes primary and stops the manager."
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.primary.close(Duration::from_millis(50)).await;
        self.manager.stop();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

#[cfg(all(test, feature = "testing"))]
mod tests {
    use super::*;
    use crate::{
        config::LoadBalanceMode,
        driver::{fake::FakeConnection, DriverConnection},
        hooks::HookManager,
        metrics::Metrics,
        pool::ConnectorFn,
        replica::descriptor::ReplicaDescriptor,
    };

    fn test_pool_params() -> crate::config::PoolParams {
        crate::config::PoolParams {
            max_conns: 4,
            min_conns: 0,
            max_conn_lifetime: Duration::from_secs(3600),
            max_conn_idle_time: Duration::from_secs(3600),
            health_check_period: Duration::from_secs(3600),
            connect_timeout: Duration::from_secs(1),
            lazy_connect: true,
        }
    }

    fn fake_connector() -> ConnectorFn {
        Arc::new(|| Box::pin(async { Ok(Arc::new(FakeConnection::new()) as Arc<dyn DriverConnection>) }))
    }

    async fn build_pool() -> Arc<Pool> {
        Pool::new(test_pool_params(), fake_connector(), Arc::new(HookManager::new(Duration::from_secs(1))), Arc::new(Metrics::new()))
            .await
            .unwrap()
    }

    async fn build_replica_pool() -> Arc<ReplicaPool> {
        let primary = build_pool().await;
        let manager = Arc::new(ReplicaManager::new(LoadBalanceMode::RoundRobin));
        let replica_pool = build_pool().await;
        manager
            .add_replica_with_pool(ReplicaDescriptor::new("r1", "postgres://host/db"), replica_pool)
            .unwrap();
        manager.set_health_check_fn(|_id| async { true });
        manager.health_check("r1").await.unwrap();
        manager.health_check("r1").await.unwrap();
        ReplicaPool::new(primary, manager)
    }

    #[tokio::test]
    async fn acquire_write_always_hits_primary() {
        let facade = build_replica_pool().await;
        let _conn = facade.acquire_write().await.unwrap();
        assert_eq!(facade.stats().writes, 1);
        facade.close().await;
    }

    #[tokio::test]
    async fn acquire_read_routes_to_healthy_replica_by_default() {
        let facade = build_replica_pool().await;
        let lease = facade.acquire_read().await.unwrap();
        assert_eq!(lease.replica_id(), Some("r1"));
        facade.close().await;
    }

    #[tokio::test]
    async fn primary_only_preference_bypasses_the_manager() {
        let facade = build_replica_pool().await;
        let lease = facade.acquire_read_with_preference(ReadPreference::PrimaryOnly).await.unwrap();
        assert_eq!(lease.replica_id(), None);
        facade.close().await;
    }

    #[tokio::test]
    async fn secondary_preferred_falls_back_to_primary_with_no_replicas() {
        let primary = build_pool().await;
        let manager = Arc::new(ReplicaManager::new(LoadBalanceMode::RoundRobin));
        let facade = ReplicaPool::new(primary, manager);
        let lease = facade.acquire_read_with_preference(ReadPreference::SecondaryPreferred).await.unwrap();
        assert_eq!(lease.replica_id(), None);
        assert_eq!(facade.stats().primary_fallbacks, 1);
        facade.close().await;
    }

    #[tokio::test]
    async fn secondary_only_fails_with_no_replicas_configured() {
        let primary = build_pool().await;
        let manager = Arc::new(ReplicaManager::new(LoadBalanceMode::RoundRobin));
        let facade = ReplicaPool::new(primary, manager);
        let result = facade.acquire_read_with_preference(ReadPreference::SecondaryOnly).await;
        assert!(matches!(result, Err(Error::NoReplicasAvailable)));
        assert_eq!(facade.stats().read_failures, 1);
        facade.close().await;
    }

    #[tokio::test]
    async fn dropping_a_read_lease_decrements_replica_connections() {
        let facade = build_replica_pool().await;
        {
            let _lease = facade.acquire_read().await.unwrap();
            assert_eq!(facade.manager.replica_status("r1"), Some(crate::replica::info::ReplicaStatus::Healthy));
        }
        facade.close().await;
    }
}
