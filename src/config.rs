//! Pool configuration options

use crate::errors::{PoolError, PoolResult};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked with a resource when the pool destroys it
pub type ShutdownCallback<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Configuration for connection pool behavior
///
/// # Examples
///
/// ```
/// use esox_connectionpool::PoolConfiguration;
/// use std::time::Duration;
///
/// let config = PoolConfiguration::<u32>::new()
///     .with_min_size(2)
///     .with_max_size(10)
///     .with_timeout(Duration::from_secs(1))
///     .with_max_age(Duration::from_secs(300));
///
/// assert_eq!(config.min_size, 2);
/// assert_eq!(config.max_size, 10);
/// assert!(config.validate().is_ok());
/// ```
pub struct PoolConfiguration<T> {
    /// Number of resources created up front and kept alive by the reaper
    pub min_size: usize,

    /// Hard upper bound on resources in existence at any time
    pub max_size: usize,

    /// Default time a checkout waits for a resource
    pub timeout: Duration,

    /// Age after which a resource is destroyed on next contact. Zero disables expiry.
    pub max_age: Duration,

    /// Interval between reaper cycles. Only used when `max_age` is non-zero.
    pub cleanup_frequency: Duration,

    /// Invoked with every resource the pool destroys
    pub shutdown_callback: Option<ShutdownCallback<T>>,
}

impl<T> Default for PoolConfiguration<T> {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: 5,
            timeout: Duration::from_secs(5),
            max_age: Duration::ZERO,
            cleanup_frequency: Duration::from_secs(1),
            shutdown_callback: None,
        }
    }
}

impl<T> Clone for PoolConfiguration<T> {
    fn clone(&self) -> Self {
        Self {
            min_size: self.min_size,
            max_size: self.max_size,
            timeout: self.timeout,
            max_age: self.max_age,
            cleanup_frequency: self.cleanup_frequency,
            shutdown_callback: self.shutdown_callback.clone(),
        }
    }
}

impl<T> fmt::Debug for PoolConfiguration<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfiguration")
            .field("min_size", &self.min_size)
            .field("max_size", &self.max_size)
            .field("timeout", &self.timeout)
            .field("max_age", &self.max_age)
            .field("cleanup_frequency", &self.cleanup_frequency)
            .field("shutdown_callback", &self.shutdown_callback.is_some())
            .finish()
    }
}

impl<T> PoolConfiguration<T> {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixed-size pool: no pre-created resources, at most `size` of them
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_connectionpool::PoolConfiguration;
    ///
    /// let config = PoolConfiguration::<u32>::new()
    ///     .with_min_size(3)
    ///     .with_size(8);
    ///
    /// assert_eq!(config.min_size, 0);
    /// assert_eq!(config.max_size, 8);
    /// ```
    pub fn with_size(mut self, size: usize) -> Self {
        self.min_size = 0;
        self.max_size = size;
        self
    }

    pub fn with_min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set the default checkout timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the maximum resource age
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Set the reaper interval
    pub fn with_cleanup_frequency(mut self, frequency: Duration) -> Self {
        self.cleanup_frequency = frequency;
        self
    }

    /// Set the callback run for every destroyed resource
    ///
    /// It runs while the pool lock is held and must not call back into the pool. Panics are
    /// caught and ignored.
    pub fn with_shutdown_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.shutdown_callback = Some(Arc::new(callback));
        self
    }

    /// Check the configuration invariants
    pub fn validate(&self) -> PoolResult<()> {
        if self.max_size == 0 {
            return Err(PoolError::InvalidConfiguration(
                "max_size must be at least 1".to_string(),
            ));
        }

        if self.min_size > self.max_size {
            return Err(PoolError::InvalidConfiguration(format!(
                "min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }

        if !self.max_age.is_zero() && self.cleanup_frequency.is_zero() {
            return Err(PoolError::InvalidConfiguration(
                "cleanup_frequency must be non-zero when max_age is set".to_string(),
            ));
        }

        Ok(())
    }

    pub(crate) fn expires(&self) -> bool {
        !self.max_age.is_zero()
    }
}
