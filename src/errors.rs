//! Error types for the connection pool

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Boxed error returned by resource factories
pub type BoxError = Box<dyn StdError + Send + Sync>;

#[derive(Error, Debug, Clone)]
pub enum PoolError {
    /// No resource became available before the deadline. Carries the timeout the caller asked for.
    #[error("Waited {} sec, no resource available", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("Pool is shutting down")]
    ShuttingDown,

    /// The resource factory failed. The factory's error is kept as the source.
    #[error("Resource factory failed: {0}")]
    Factory(#[source] Arc<dyn StdError + Send + Sync>),

    /// A checkin with no matching checkout, or a resource released to a pool that did not
    /// create it
    #[error("Checkin without a matching checkout on this thread")]
    CheckinWithoutCheckout,

    /// Exclusive access was requested while this thread already holds a resource from the pool
    #[error("Resource already checked out on this thread")]
    AlreadyCheckedOut,

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Invalid pool configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Failed to start reaper thread: {0}")]
    ReaperSpawn(String),

    #[error("Failed to export metrics: {0}")]
    MetricsExport(String),
}

impl PoolError {
    pub(crate) fn factory(err: BoxError) -> Self {
        PoolError::Factory(Arc::from(err))
    }

    /// The factory's own error, for callers that want to downcast it
    pub fn factory_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            PoolError::Factory(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

pub type PoolResult<T> = Result<T, PoolError>;
