//! Metrics collection and export for connection pools

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Metrics snapshot for a pool
///
/// # Examples
///
/// ```
/// use esox_connectionpool::{PoolConfiguration, TimedStack};
///
/// let stack = TimedStack::new(|| 42u32, PoolConfiguration::new().with_size(3)).unwrap();
///
/// let resource = stack.acquire(stack.default_timeout()).unwrap();
/// let metrics = stack.metrics();
/// assert_eq!(metrics.total_acquired, 1);
/// assert_eq!(metrics.checked_out, 1);
/// stack.release(resource).unwrap();
/// ```
#[derive(Debug, Clone)]
#[cfg_attr(feature = "metrics", derive(serde::Serialize))]
pub struct PoolMetrics {
    /// Total successful acquisitions
    pub total_acquired: usize,

    /// Total resources handed back through release
    pub total_released: usize,

    /// Total resources built by the factory
    pub total_created: usize,

    /// Total resources destroyed (expired, reaped or drained)
    pub total_destroyed: usize,

    /// Acquisitions that gave up at their deadline
    pub timeouts: usize,

    /// Factory calls that returned an error
    pub factory_failures: usize,

    /// Resources currently held by callers
    pub checked_out: usize,

    /// Resources sitting idle in the pool
    pub available: usize,

    /// Resources currently in existence
    pub created: usize,

    /// Upper bound on resources
    pub max_size: usize,

    /// Checked-out share of `max_size` (0.0 to 1.0)
    pub utilization: f64,
}

impl PoolMetrics {
    /// Export metrics as a HashMap
    pub fn export(&self) -> HashMap<String, String> {
        let mut metrics = HashMap::new();
        metrics.insert("total_acquired".to_string(), self.total_acquired.to_string());
        metrics.insert("total_released".to_string(), self.total_released.to_string());
        metrics.insert("total_created".to_string(), self.total_created.to_string());
        metrics.insert("total_destroyed".to_string(), self.total_destroyed.to_string());
        metrics.insert("timeouts".to_string(), self.timeouts.to_string());
        metrics.insert("factory_failures".to_string(), self.factory_failures.to_string());
        metrics.insert("checked_out".to_string(), self.checked_out.to_string());
        metrics.insert("available".to_string(), self.available.to_string());
        metrics.insert("created".to_string(), self.created.to_string());
        metrics.insert("max_size".to_string(), self.max_size.to_string());
        metrics.insert("utilization".to_string(), format!("{:.2}", self.utilization));
        metrics
    }
}

/// Metrics exporter for Prometheus format
#[cfg(feature = "metrics")]
pub struct MetricsExporter;

#[cfg(feature = "metrics")]
impl MetricsExporter {
    /// Export metrics in Prometheus exposition format
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_connectionpool::{MetricsExporter, PoolConfiguration, TimedStack};
    /// use std::collections::HashMap;
    ///
    /// let stack = TimedStack::new(|| 1u8, PoolConfiguration::new()).unwrap();
    ///
    /// let mut tags = HashMap::new();
    /// tags.insert("service".to_string(), "api".to_string());
    ///
    /// let output = MetricsExporter::export_prometheus(&stack.metrics(), "db", Some(&tags)).unwrap();
    /// assert!(output.contains("connectionpool_resources_checked_out"));
    /// assert!(output.contains("service=\"api\""));
    /// ```
    pub fn export_prometheus(
        metrics: &PoolMetrics,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> crate::PoolResult<String> {
        use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Opts, Registry, TextEncoder};

        let registry = Registry::new();
        let labels = Self::labels(pool_name, tags);
        let opts = |name: &str, help: &str| Opts::new(name, help).const_labels(labels.clone());

        let gauges = [
            ("connectionpool_resources_checked_out", "Resources currently checked out", metrics.checked_out),
            ("connectionpool_resources_available", "Idle resources in the pool", metrics.available),
            ("connectionpool_resources_created", "Resources currently in existence", metrics.created),
            ("connectionpool_resources_max", "Maximum pool size", metrics.max_size),
        ];
        for (name, help, value) in gauges {
            let gauge = IntGauge::with_opts(opts(name, help)).map_err(Self::error)?;
            gauge.set(value as i64);
            registry.register(Box::new(gauge)).map_err(Self::error)?;
        }

        let utilization = Gauge::with_opts(opts("connectionpool_utilization", "Pool utilization ratio"))
            .map_err(Self::error)?;
        utilization.set(metrics.utilization);
        registry.register(Box::new(utilization)).map_err(Self::error)?;

        let counters = [
            ("connectionpool_acquired_total", "Total resources acquired", metrics.total_acquired),
            ("connectionpool_released_total", "Total resources released", metrics.total_released),
            ("connectionpool_created_total", "Total resources created", metrics.total_created),
            ("connectionpool_destroyed_total", "Total resources destroyed", metrics.total_destroyed),
            ("connectionpool_timeouts_total", "Acquisitions that timed out", metrics.timeouts),
            ("connectionpool_factory_failures_total", "Failed factory calls", metrics.factory_failures),
        ];
        for (name, help, value) in counters {
            let counter = IntCounter::with_opts(opts(name, help)).map_err(Self::error)?;
            counter.inc_by(value as u64);
            registry.register(Box::new(counter)).map_err(Self::error)?;
        }

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .map_err(Self::error)?;
        String::from_utf8(buffer).map_err(|e| crate::PoolError::MetricsExport(e.to_string()))
    }

    fn labels(pool_name: &str, tags: Option<&HashMap<String, String>>) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert("pool".to_string(), pool_name.to_string());

        if let Some(tags) = tags {
            for (key, value) in tags {
                labels.insert(key.clone(), value.clone());
            }
        }

        labels
    }

    fn error(err: prometheus::Error) -> crate::PoolError {
        crate::PoolError::MetricsExport(err.to_string())
    }
}

/// Internal counters, updated without taking the pool lock
#[derive(Default)]
pub(crate) struct MetricsTracker {
    pub total_acquired: AtomicUsize,
    pub total_released: AtomicUsize,
    pub total_created: AtomicUsize,
    pub total_destroyed: AtomicUsize,
    pub timeouts: AtomicUsize,
    pub factory_failures: AtomicUsize,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_metrics(&self, created: usize, available: usize, max_size: usize) -> PoolMetrics {
        let checked_out = created.saturating_sub(available);
        let utilization = if max_size > 0 {
            checked_out as f64 / max_size as f64
        } else {
            0.0
        };

        PoolMetrics {
            total_acquired: self.total_acquired.load(Ordering::Relaxed),
            total_released: self.total_released.load(Ordering::Relaxed),
            total_created: self.total_created.load(Ordering::Relaxed),
            total_destroyed: self.total_destroyed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            factory_failures: self.factory_failures.load(Ordering::Relaxed),
            checked_out,
            available,
            created,
            max_size,
            utilization,
        }
    }
}
