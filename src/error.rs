//! The closed error enumeration exposed across the pool/router/hook surface.
//!
//! Driver errors are wrapped rather than flattened so callers can still
//! `anyhow::Error::downcast_ref::<tokio_postgres::Error>` when they need to.

use std::time::Duration;

/// Errors returned by `pgcluster`'s public operations.
///
/// This is deliberately a closed set (see `spec.md` §6) rather than an
/// open `anyhow::Error` bag: callers branch on error *kind* (is this
/// retryable? should we fail over? is the pool just closed?) far more
/// often than they want a formatted message.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("pool is closed")]
    PoolClosed,

    #[error("connection is closed")]
    ConnClosed,

    #[error("component reported unhealthy state: {0}")]
    UnhealthyState(String),

    #[error("no replicas are configured")]
    NoReplicasAvailable,

    #[error("no healthy replicas are available")]
    NoHealthyReplicas,

    #[error("primary not configured")]
    PrimaryNotConfigured,

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("hook timed out after {0:?}")]
    HookTimeout(Duration),

    #[error("hook panicked: {0}")]
    HookPanic(String),

    #[error("hook requested operation to stop")]
    HookStopRequested,

    #[error("{0} is not implemented inside a transaction")]
    NotImplementedInTransaction(&'static str),

    #[error("unsupported connection type: {0}")]
    UnsupportedConnectionType(String),

    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    #[error("invalid copy source: {0}")]
    InvalidCopySource(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation was canceled")]
    Canceled,

    #[error("{operation} failed: {source}")]
    Driver {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl Error {
    /// Wraps a driver-originated error with the operation name that was
    /// being attempted, per `spec.md` §7 ("User-visible wrapping prepends
    /// the operation name and includes the original cause").
    pub fn driver(operation: &'static str, source: impl Into<anyhow::Error>) -> Self {
        Error::Driver {
            operation,
            source: source.into(),
        }
    }

    /// The message-pattern / "temporary" classification used by the retry
    /// controller (`spec.md` §4.6) and error-handling design (`spec.md` §7).
    ///
    /// A driver error is retryable if it carries an explicit "temporary"
    /// signal or its rendered message matches one of a fixed set of
    /// well-known transient-failure phrases.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Canceled | Error::Timeout(_) => false,
            Error::Driver { source, .. } => classify_retryable_message(&source.to_string()),
            _ => false,
        }
    }
}

const RETRYABLE_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timeout",
    "temporary failure",
    "network is unreachable",
    "no route to host",
    "too many connections",
    "connection pool exhausted",
];

/// Message-pattern classification shared by the retry and failover
/// controllers, grounded on the pattern set in `spec.md` §4.6.
pub fn classify_retryable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    RETRYABLE_PATTERNS.iter().any(|pat| lower.contains(pat))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_error_wraps_operation_name() {
        let err = Error::driver("acquire", anyhow::anyhow!("connection refused"));
        assert!(err.to_string().contains("acquire"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn classifies_known_transient_patterns() {
        assert!(classify_retryable_message("Connection Refused by peer"));
        assert!(classify_retryable_message("the connection pool exhausted"));
        assert!(!classify_retryable_message("syntax error at or near SELECT"));
    }

    #[test]
    fn cancellation_and_timeout_are_never_retryable() {
        assert!(!Error::Canceled.is_retryable());
        assert!(!Error::Timeout(Duration::from_secs(1)).is_retryable());
    }
}
