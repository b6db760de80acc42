//! Health monitoring for connection pools

/// Health status of a pool
///
/// # Examples
///
/// ```
/// use esox_connectionpool::{PoolConfiguration, TimedStack};
///
/// let stack = TimedStack::new(|| 0u8, PoolConfiguration::new().with_min_size(2)).unwrap();
///
/// let health = stack.health_status();
/// assert!(health.is_healthy());
/// assert_eq!(health.available, 2);
/// ```
#[derive(Debug, Clone)]
#[cfg_attr(feature = "metrics", derive(serde::Serialize))]
pub struct HealthStatus {
    pub is_healthy: bool,

    /// Checked-out share of capacity (0.0 to 1.0)
    pub utilization: f64,

    /// Idle resources ready for checkout
    pub available: usize,

    /// Resources held by callers
    pub checked_out: usize,

    pub max_size: usize,

    pub shutting_down: bool,

    pub warnings: Vec<String>,
}

impl HealthStatus {
    pub fn new(available: usize, checked_out: usize, max_size: usize, shutting_down: bool) -> Self {
        let utilization = if max_size > 0 {
            checked_out as f64 / max_size as f64
        } else {
            0.0
        };

        let mut warnings = Vec::new();
        let mut is_healthy = true;

        if shutting_down {
            warnings.push("Pool is shutting down".to_string());
            is_healthy = false;
        }

        if utilization > 0.9 {
            warnings.push(format!("High utilization: {:.1}%", utilization * 100.0));
            is_healthy = false;
        }

        if checked_out >= max_size && max_size > 0 {
            warnings.push("Pool is exhausted".to_string());
        }

        Self {
            is_healthy,
            utilization,
            available,
            checked_out,
            max_size,
            shutting_down,
            warnings,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.is_healthy
    }
}
