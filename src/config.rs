//! Pool configuration

use std::time::Duration;

/// Configuration for a [`ConnectionPool`](crate::pool::ConnectionPool).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of live connections. Must be greater than zero.
    pub capacity: usize,
    /// How long a request may take before failing with
    /// [`PoolError::RequestTimeout`](crate::error::PoolError::RequestTimeout),
    /// counted from the call to `request`. Time spent opening a new
    /// connection counts too. `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
}

impl PoolConfig {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            request_timeout: None,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(8)
    }
}
