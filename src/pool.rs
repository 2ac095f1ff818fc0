//! The connection pool: lazy warming, health-checked reuse, lifetime/idle
//! recycling, graceful drain, metrics (`spec.md` §4.8).
//!
//! Grounded on `ConvexPgPool` in
//! `examples/get-convex-convex-backend/crates/postgres/src/connection.rs`:
//! a `Semaphore`-bounded set of connections, a background idle-worker task
//! that evicts by lifetime/idle-time, and `with_timeout`-wrapped
//! acquisition. The `min_conns`/lazy-warm and graceful-drain behavior
//! generalize that file's always-lazy pool to the fuller lifecycle
//! `spec.md` calls for.

use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::{
    config::{HookKind, PoolParams},
    connection::{Connection, ManagedConnection},
    driver::DriverConnection,
    error::Error,
    hooks::{ExecutionContext, HookManager},
    metrics::Metrics,
};

pub type ConnectFuture = Pin<Box<dyn Future<Output = Result<Arc<dyn DriverConnection>, Error>> + Send>>;
pub type ConnectorFn = Arc<dyn Fn() -> ConnectFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub total_conns: u64,
    pub idle_conns: u64,
    pub in_use_conns: u64,
    pub acquires: u64,
    pub acquire_timeouts: u64,
    pub created: u64,
    pub destroyed: u64,
    pub max_lifetime_destroyed: u64,
    pub max_idle_destroyed: u64,
}

/// State shared between the public `Pool` handle and every checked-out
/// `Connection`. `Connection` holds only a `Weak` reference to this so
/// the pool↔connection cycle never keeps either side alive artificially
/// (`spec.md` §9, "Cyclic pool↔connection references").
pub(crate) struct PoolShared {
    idle: Mutex<VecDeque<Arc<ManagedConnection>>>,
    semaphore: Arc<Semaphore>,
    connector: ConnectorFn,
    params: Mutex<PoolParams>,
    pub(crate) hooks: Arc<HookManager>,
    pub(crate) metrics: Arc<Metrics>,
    closed: AtomicBool,
    live_count: AtomicU64,
    created: AtomicU64,
    destroyed: AtomicU64,
    acquires: AtomicU64,
    acquire_timeouts: AtomicU64,
    max_lifetime_destroyed: AtomicU64,
    max_idle_destroyed: AtomicU64,
}

impl PoolShared {
    pub(crate) fn return_connection(&self, conn: Arc<ManagedConnection>) {
        if self.closed.load(Ordering::Relaxed) || conn.is_poisoned() {
            self.destroy(conn);
            return;
        }
        let params = self.params.lock().clone();
        if conn.age() > params.max_conn_lifetime {
            self.max_lifetime_destroyed.fetch_add(1, Ordering::Relaxed);
            self.destroy(conn);
            return;
        }
        conn.touch();
        self.idle.lock().push_back(conn);
    }

    fn destroy(&self, conn: Arc<ManagedConnection>) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        self.live_count.fetch_sub(1, Ordering::Relaxed);
        drop(conn); // releases the semaphore permit held inside
    }
}

/// The connection pool. Cheap to clone: internally an `Arc<PoolShared>`.
pub struct Pool {
    shared: Arc<PoolShared>,
    idle_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Pool {
    /// Builds a pool and, unless `params.lazy_connect`, warms it to
    /// `params.min_conns` connections before returning (`spec.md` §4.8).
    pub async fn new(params: PoolParams, connector: ConnectorFn, hooks: Arc<HookManager>, metrics: Arc<Metrics>) -> Result<Arc<Self>, Error> {
        let shared = Arc::new(PoolShared {
            idle: Mutex::new(VecDeque::new()),
            semaphore: Arc::new(Semaphore::new(params.max_conns as usize)),
            connector,
            params: Mutex::new(params.clone()),
            hooks,
            metrics,
            closed: AtomicBool::new(false),
            live_count: AtomicU64::new(0),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            acquires: AtomicU64::new(0),
            acquire_timeouts: AtomicU64::new(0),
            max_lifetime_destroyed: AtomicU64::new(0),
            max_idle_destroyed: AtomicU64::new(0),
        });

        if !params.lazy_connect {
            for _ in 0..params.min_conns {
                let conn = Self::create_connection(&shared).await?;
                shared.idle.lock().push_back(conn);
            }
        }

        let pool = Arc::new(Self {
            shared,
            idle_task: Mutex::new(None),
        });
        pool.spawn_idle_worker();
        Ok(pool)
    }

    async fn create_connection(shared: &Arc<PoolShared>) -> Result<Arc<ManagedConnection>, Error> {
        let permit = shared
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::PoolClosed)?;
        let timer = shared.metrics.start_connection();
        let driver = match (shared.connector)().await {
            Ok(driver) => driver,
            Err(err) => {
                timer.fail(err.to_string());
                timer.finish();
                return Err(err);
            }
        };
        timer.finish();
        shared.created.fetch_add(1, Ordering::Relaxed);
        shared.live_count.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(ManagedConnection::new(driver, permit)))
    }

    fn spawn_idle_worker(self: &Arc<Self>) {
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            loop {
                let period = shared.params.lock().health_check_period;
                tokio::time::sleep(period).await;
                if shared.closed.load(Ordering::Relaxed) {
                    break;
                }
                let params = shared.params.lock().clone();
                let mut survivors = VecDeque::new();
                let mut expired = Vec::new();
                {
                    let mut idle = shared.idle.lock();
                    while let Some(conn) = idle.pop_front() {
                        if conn.age() > params.max_conn_lifetime {
                            shared.max_lifetime_destroyed.fetch_add(1, Ordering::Relaxed);
                            expired.push(conn);
                        } else if conn.idle_for() > params.max_conn_idle_time {
                            shared.max_idle_destroyed.fetch_add(1, Ordering::Relaxed);
                            expired.push(conn);
                        } else {
                            survivors.push_back(conn);
                        }
                    }
                    *idle = survivors;
                }
                for conn in expired {
                    shared.destroy(conn);
                }
            }
        });
        *self.idle_task.lock() = Some(handle);
    }

    /// Acquires a connection, reusing an idle one if available and not
    /// expired/poisoned, otherwise creating a new one bounded by
    /// `max_conns` via the pool's semaphore.
    pub async fn acquire(&self) -> Result<Connection, Error> {
        self.acquire_with_timeout(self.shared.params.lock().connect_timeout).await
    }

    pub async fn acquire_with_timeout(&self, timeout: Duration) -> Result<Connection, Error> {
        if self.shared.closed.load(Ordering::Relaxed) {
            return Err(Error::PoolClosed);
        }
        self.shared.acquires.fetch_add(1, Ordering::Relaxed);

        self.shared.hooks.execute(HookKind::BeforeAcquire, ExecutionContext::new("acquire")).await?;

        let result = tokio::time::timeout(timeout, self.acquire_inner()).await;
        let conn = match result {
            Ok(inner) => inner,
            Err(_) => {
                self.shared.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                Err(Error::Timeout(timeout))
            }
        }?;

        self.shared.hooks.execute(HookKind::AfterAcquire, ExecutionContext::new("acquire")).await?;
        Ok(conn)
    }

    async fn acquire_inner(&self) -> Result<Connection, Error> {
        loop {
            let candidate = self.shared.idle.lock().pop_back();
            let managed = match candidate {
                Some(conn) => {
                    let params = self.shared.params.lock().clone();
                    if conn.is_poisoned() || conn.age() > params.max_conn_lifetime {
                        self.shared.destroy(conn);
                        continue;
                    }
                    conn
                }
                None => Self::create_connection(&self.shared).await?,
            };
            return Ok(Connection::new(managed, Arc::downgrade(&self.shared)));
        }
    }

    /// Runs `f` with a checked-out connection, returning it afterward
    /// regardless of success (the connection's own `Drop` does the
    /// return); convenience wrapper for one-shot operations.
    pub async fn with_connection<T, F, Fut>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let conn = self.acquire().await?;
        f(conn).await
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.shared.idle.lock().len() as u64;
        let total = self.shared.live_count.load(Ordering::Relaxed);
        PoolStats {
            total_conns: total,
            idle_conns: idle,
            in_use_conns: total.saturating_sub(idle),
            acquires: self.shared.acquires.load(Ordering::Relaxed),
            acquire_timeouts: self.shared.acquire_timeouts.load(Ordering::Relaxed),
            created: self.shared.created.load(Ordering::Relaxed),
            destroyed: self.shared.destroyed.load(Ordering::Relaxed),
            max_lifetime_destroyed: self.shared.max_lifetime_destroyed.load(Ordering::Relaxed),
            max_idle_destroyed: self.shared.max_idle_destroyed.load(Ordering::Relaxed),
        }
    }

    /// Stops accepting new acquires and waits (polling every
    /// `poll_interval`) for in-use connections to drain back to idle
    /// before destroying everything — graceful drain, `spec.md` §4.8.
    pub async fn close(&self, poll_interval: Duration) {
        self.shared.closed.store(true, Ordering::Relaxed);
        if let Some(task) = self.idle_task.lock().take() {
            task.abort();
        }
        loop {
            let stats = self.stats();
            if stats.in_use_conns == 0 {
                break;
            }
            tokio::time::sleep(poll_interval).await;
        }
        let mut idle = self.shared.idle.lock();
        while let Some(conn) = idle.pop_front() {
            self.shared.destroy(conn);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Relaxed)
    }

    /// Grants access to this pool's [`HookManager`] so callers can
    /// register additional hooks after the pool is built (`spec.md` §6:
    /// hook registration is a runtime operation, not only a construction-
    /// time one).
    pub fn hooks(&self) -> &HookManager {
        self.shared.hooks.as_ref()
    }

    /// A cloned handle to this pool's [`HookManager`], for callers (namely
    /// `Provider`) that need to hold onto it independent of the pool.
    pub fn hooks_arc(&self) -> Arc<HookManager> {
        self.shared.hooks.clone()
    }
}

#[cfg(all(test, feature = "testing"))]
mod tests {
    use super::*;
    use crate::driver::fake::FakeConnection;

    fn test_params() -> PoolParams {
        PoolParams {
            max_conns: 2,
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

    #[tokio::test]
    async fn acquire_creates_and_returns_connections() {
        let pool = Pool::new(
            test_params(),
            fake_connector(),
            Arc::new(HookManager::new(Duration::from_secs(1))),
            Arc::new(Metrics::new()),
        )
        .await
        .unwrap();
        {
            let _conn = pool.acquire().await.unwrap();
            assert_eq!(pool.stats().in_use_conns, 1);
        }
        assert_eq!(pool.stats().idle_conns, 1);
    }

    #[tokio::test]
    async fn acquire_blocks_past_max_conns_until_timeout() {
        let pool = Pool::new(
            test_params(),
            fake_connector(),
            Arc::new(HookManager::new(Duration::from_secs(1))),
            Arc::new(Metrics::new()),
        )
        .await
        .unwrap();
        let _a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        let result = pool.acquire_with_timeout(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn closed_pool_rejects_new_acquires() {
        let pool = Pool::new(
            test_params(),
            fake_connector(),
            Arc::new(HookManager::new(Duration::from_secs(1))),
            Arc::new(Metrics::new()),
        )
        .await
        .unwrap();
        pool.close(Duration::from_millis(5)).await;
        assert!(matches!(pool.acquire().await, Err(Error::PoolClosed)));
    }

    #[tokio::test]
    async fn before_acquire_hook_runs_on_every_acquire() {
        use crate::hooks::{sync_hook, HookOutcome};
        use std::sync::atomic::AtomicU32;

        let hooks = Arc::new(HookManager::new(Duration::from_secs(1)));
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        hooks.register_default(
            crate::config::HookKind::BeforeAcquire,
            sync_hook("count-acquires", move |_ctx| {
                calls_clone.fetch_add(1, Ordering::Relaxed);
                HookOutcome::Continue
            }),
        );
        let pool = Pool::new(test_params(), fake_connector(), hooks, Arc::new(Metrics::new())).await.unwrap();
        let _conn = pool.acquire().await.unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn warms_to_min_conns_when_not_lazy() {
        let mut params = test_params();
        params.lazy_connect = false;
        params.min_conns = 2;
        let pool = Pool::new(
            params,
            fake_connector(),
            Arc::new(HookManager::new(Duration::from_secs(1))),
            Arc::new(Metrics::new()),
        )
        .await
        .unwrap();
        assert_eq!(pool.stats().idle_conns, 2);
    }
}
