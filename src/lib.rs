//! # EsoxSolutions.ConnectionPool (Rust Port)
//!
//! Thread-safe, bounded pool for expensive resources such as network connections,
//! shared by many concurrent callers.
//!
//! ## Features
//!
//! - Lazy creation under a hard maximum, with an eagerly created minimum
//! - Blocking checkout with a deadline-based timeout
//! - Age-based expiry and a background reaper that tops the pool back up
//! - Reentrant per-thread checkout: nested use on one thread shares one resource
//! - Resources returned on every exit path via RAII (Drop trait)
//! - One-way, race-free shutdown that wakes blocked callers immediately
//! - Async acquisition on tokio's blocking pool
//! - Metrics, Prometheus export and health status
//!
//! ## Quick Start
//!
//! ```rust
//! use esox_connectionpool::{ConnectionPool, PoolConfiguration};
//! use std::time::Duration;
//!
//! let config = PoolConfiguration::new()
//!     .with_size(4)
//!     .with_timeout(Duration::from_secs(2));
//! let pool = ConnectionPool::new(|| vec![0u8; 16], config).unwrap();
//!
//! let total = pool.with(|buffer| buffer.len()).unwrap();
//! assert_eq!(total, 16);
//!
//! pool.shutdown();
//! ```
//!
//! [`TimedStack`] is the engine underneath; use it directly when resources must move
//! between threads or be acquired from async code.

mod config;
mod errors;
mod health;
mod managed;
mod metrics;
mod pool;
mod timed_stack;

pub use config::{PoolConfiguration, ShutdownCallback};
pub use errors::{BoxError, PoolError, PoolResult};
pub use health::HealthStatus;
pub use managed::ManagedResource;
#[cfg(feature = "metrics")]
pub use metrics::MetricsExporter;
pub use metrics::PoolMetrics;
pub use pool::{ConnectionPool, PooledConnection};
pub use timed_stack::TimedStack;
