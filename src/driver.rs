//! The single capability trait every pooled connection is driven through
//! (`spec.md` §9, "Duck-typed connection wrapper" resolution: "collapse
//! into one explicit trait covering every capability the pool actually
//! calls").
//!
//! Grounded on `tokio_postgres::Client`'s method surface, which the
//! teacher wraps directly in `postgres/src/connection.rs`
//! (`PostgresConnection` holds a `tokio_postgres::Client` and forwards
//! `query`/`execute`/`prepare_cached` to it almost verbatim). Transactions
//! here run as plain `BEGIN`/`COMMIT`/`ROLLBACK` statements against the
//! same connection rather than `tokio_postgres::Transaction<'_>`, which
//! borrows its `Client` and would force this trait into a self-referential
//! type; see DESIGN.md for the tradeoff.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_postgres::{types::ToSql, Notification, Row, Statement};

use crate::error::Error;

/// Every capability the pool, router, and transaction layer need from a
/// live connection.
#[async_trait]
pub trait DriverConnection: Send + Sync {
    async fn query(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>, Error>;

    async fn query_opt(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Option<Row>, Error>;

    async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64, Error>;

    async fn prepare(&self, sql: &str) -> Result<Statement, Error>;

    /// Runs `sql` as a single non-parameterized batch (`spec.md` §4.5,
    /// batch operations).
    async fn batch_execute(&self, sql: &str) -> Result<(), Error>;

    async fn ping(&self) -> Result<(), Error>;

    /// Streams `data` into `sql`'s `COPY ... FROM STDIN`, returning the
    /// number of rows copied.
    async fn copy_in(&self, sql: &str, data: Bytes) -> Result<u64, Error>;

    async fn listen(&self, channel: &str) -> Result<(), Error>;

    async fn unlisten(&self, channel: &str) -> Result<(), Error>;

    /// Waits up to `timeout` for the next `LISTEN` notification.
    async fn wait_for_notification(&self, timeout: Duration) -> Result<Option<Notification>, Error>;

    async fn close(&self) -> Result<(), Error>;

    fn is_closed(&self) -> bool;
}

/// Production implementation backed by a live `tokio_postgres::Client`.
pub struct TokioPostgresConnection {
    client: tokio_postgres::Client,
    notifications: tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<Notification>>,
    driver_task: tokio::task::JoinHandle<()>,
    closed: std::sync::atomic::AtomicBool,
}

impl TokioPostgresConnection {
    /// Connects with `tls`, spawning a background task that drives the
    /// connection's IO loop and forwards `LISTEN`/`NOTIFY` messages onto
    /// an internal channel — the same split the teacher uses in
    /// `postgres/src/lib.rs`'s `create_pool` (spawn the connection future,
    /// keep the client).
    pub async fn connect<T>(config: &tokio_postgres::Config, tls: T) -> Result<Self, Error>
    where
        T: tokio_postgres::tls::MakeTlsConnect<tokio_postgres::Socket> + Send + 'static,
        T::TlsConnect: Send,
        T::Stream: Send,
        <T::TlsConnect as tokio_postgres::tls::TlsConnect<tokio_postgres::Socket>>::Future: Send,
    {
        let (client, mut connection) = config
            .connect(tls)
            .await
            .map_err(|e| Error::driver("connect", e))?;

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let driver_task = tokio::spawn(async move {
            loop {
                match futures_util::future::poll_fn(|cx| connection.poll_message(cx)).await {
                    Some(Ok(tokio_postgres::AsyncMessage::Notification(n))) => {
                        let _ = tx.send(n);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "postgres connection IO error");
                        break;
                    }
                    None => break,
                }
            }
        });

        Ok(Self {
            client,
            notifications: tokio::sync::Mutex::new(rx),
            driver_task,
            closed: std::sync::atomic::AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl DriverConnection for TokioPostgresConnection {
    async fn query(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>, Error> {
        self.client.query(sql, params).await.map_err(|e| Error::driver("query", e))
    }

    async fn query_opt(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Option<Row>, Error> {
        self.client.query_opt(sql, params).await.map_err(|e| Error::driver("query_opt", e))
    }

    async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64, Error> {
        self.client.execute(sql, params).await.map_err(|e| Error::driver("execute", e))
    }

    async fn prepare(&self, sql: &str) -> Result<Statement, Error> {
        self.client.prepare(sql).await.map_err(|e| Error::driver("prepare", e))
    }

    async fn batch_execute(&self, sql: &str) -> Result<(), Error> {
        self.client.batch_execute(sql).await.map_err(|e| Error::driver("batch_execute", e))
    }

    async fn ping(&self) -> Result<(), Error> {
        self.client.simple_query("SELECT 1").await.map_err(|e| Error::driver("ping", e))?;
        Ok(())
    }

    async fn copy_in(&self, sql: &str, data: Bytes) -> Result<u64, Error> {
        use futures_util::SinkExt;
        let sink = self.client.copy_in(sql).await.map_err(|e| Error::driver("copy_in", e))?;
        tokio::pin!(sink);
        sink.send(data).await.map_err(|e| Error::driver("copy_in", e))?;
        sink.finish().await.map_err(|e| Error::driver("copy_in", e))
    }

    async fn listen(&self, channel: &str) -> Result<(), Error> {
        self.client
            .batch_execute(&format!("LISTEN \"{channel}\""))
            .await
            .map_err(|e| Error::driver("listen", e))
    }

    async fn unlisten(&self, channel: &str) -> Result<(), Error> {
        self.client
            .batch_execute(&format!("UNLISTEN \"{channel}\""))
            .await
            .map_err(|e| Error::driver("unlisten", e))
    }

    async fn wait_for_notification(&self, timeout: Duration) -> Result<Option<Notification>, Error> {
        let mut rx = self.notifications.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(n)) => Ok(Some(n)),
            Ok(None) => Ok(None),
            Err(_) => Ok(None),
        }
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.store(true, std::sync::atomic::Ordering::Relaxed);
        self.driver_task.abort();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::Relaxed) || self.client.is_closed()
    }
}

/// In-memory test double, enabled under the `testing` feature so pool and
/// router logic is unit-testable without a live Postgres instance — the
/// same convention the teacher's workspace uses its own `testing` feature
/// for (`db_connection`'s Cargo.toml exposes one for test fixtures).
#[cfg(feature = "testing")]
pub mod fake {
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use tokio_postgres::{types::ToSql, Notification, Row, Statement};

    use super::DriverConnection;
    use crate::error::Error;

    /// A connection double that records call counts and can be told to
    /// fail the next N operations, for retry/failover unit tests.
    pub struct FakeConnection {
        pub queries: AtomicU64,
        pub executes: AtomicU64,
        pub closed: AtomicBool,
        pub fail_next: Mutex<u32>,
    }

    impl FakeConnection {
        pub fn new() -> Self {
            Self {
                queries: AtomicU64::new(0),
                executes: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                fail_next: Mutex::new(0),
            }
        }

        pub fn fail_next_n(&self, n: u32) {
            *self.fail_next.lock() = n;
        }

        fn maybe_fail(&self, operation: &'static str) -> Result<(), Error> {
            let mut remaining = self.fail_next.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::driver(operation, anyhow::anyhow!("connection refused")));
            }
            Ok(())
        }
    }

    impl Default for FakeConnection {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl DriverConnection for FakeConnection {
        async fn query(&self, _sql: &str, _params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>, Error> {
            self.queries.fetch_add(1, Ordering::Relaxed);
            self.maybe_fail("query")?;
            Ok(Vec::new())
        }

        async fn query_opt(&self, _sql: &str, _params: &[&(dyn ToSql + Sync)]) -> Result<Option<Row>, Error> {
            self.queries.fetch_add(1, Ordering::Relaxed);
            self.maybe_fail("query_opt")?;
            Ok(None)
        }

        async fn execute(&self, _sql: &str, _params: &[&(dyn ToSql + Sync)]) -> Result<u64, Error> {
            self.executes.fetch_add(1, Ordering::Relaxed);
            self.maybe_fail("execute")?;
            Ok(0)
        }

        async fn prepare(&self, _sql: &str) -> Result<Statement, Error> {
            Err(Error::UnsupportedConnectionType("FakeConnection cannot prepare real statements".into()))
        }

        async fn batch_execute(&self, _sql: &str) -> Result<(), Error> {
            self.maybe_fail("batch_execute")
        }

        async fn ping(&self) -> Result<(), Error> {
            self.maybe_fail("ping")
        }

        async fn copy_in(&self, _sql: &str, _data: Bytes) -> Result<u64, Error> {
            self.maybe_fail("copy_in")?;
            Ok(0)
        }

        async fn listen(&self, _channel: &str) -> Result<(), Error> {
            self.maybe_fail("listen")
        }

        async fn unlisten(&self, _channel: &str) -> Result<(), Error> {
            self.maybe_fail("unlisten")
        }

        async fn wait_for_notification(&self, _timeout: std::time::Duration) -> Result<Option<Notification>, Error> {
            Ok(None)
        }

        async fn close(&self) -> Result<(), Error> {
            self.closed.store(true, Ordering::Relaxed);
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Relaxed)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn fake_connection_fails_exactly_n_times() {
            let fake = FakeConnection::new();
            fake.fail_next_n(2);
            assert!(fake.query("SELECT 1", &[]).await.is_err());
            assert!(fake.query("SELECT 1", &[]).await.is_err());
            assert!(fake.query("SELECT 1", &[]).await.is_ok());
        }
    }
}
