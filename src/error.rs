//! Pool errors

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

/// Why a connection request failed. `E` is the source's error type.
#[derive(Debug, thiserror::Error)]
pub enum PoolError<E> {
    /// The pool is closing or closed.
    #[error("connection pool is closed")]
    Closed,
    /// No connection became available in time.
    #[error("timed out after {0:?} waiting for a connection")]
    RequestTimeout(Duration),
    /// The source failed to open a new connection.
    #[error("failed to open a new connection")]
    Connect(#[source] E),
}

/// Some idle connections failed to close while the pool was shutting down.
///
/// Every connection is still attempted; this only reports the failures.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{failed} of {attempted} connections failed to close")]
pub struct CloseError {
    pub failed: usize,
    pub attempted: usize,
    /// first failure observed
    #[source]
    pub first: Arc<dyn Error + Send + Sync>,
}

impl CloseError {
    /// Fold another joint failure into this one.
    pub(crate) fn merge(self, other: CloseError) -> CloseError {
        CloseError {
            failed: self.failed + other.failed,
            attempted: self.attempted + other.attempted,
            first: self.first,
        }
    }
}
