// EsoxSolutions.ConnectionPool - Rust Port
// Thread-safe connection pool with timeouts, expiry and reentrant checkout

use esox_connectionpool::{ConnectionPool, PoolConfiguration, PoolError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn main() -> Result<(), PoolError> {
    println!("=== EsoxSolutions.ConnectionPool ===");
    println!();

    let next_id = AtomicUsize::new(1);
    let config = PoolConfiguration::new()
        .with_min_size(1)
        .with_max_size(2)
        .with_timeout(Duration::from_millis(500))
        .with_shutdown_callback(|id: usize| println!("  Closed connection #{}", id));
    let pool = ConnectionPool::new(move || next_id.fetch_add(1, Ordering::Relaxed), config)?;

    println!("Quick Demo:");
    pool.with(|id| {
        println!("  Using connection #{}", id);
        pool.with(|nested| println!("  Nested call reuses connection #{}", nested))
    })??;
    println!("  Slots available after return: {}", pool.len());

    let held = pool.checkout(None)?;
    println!("  Holding connection #{}, idle: {}", *held, pool.idle());
    drop(held);

    pool.shutdown();
    println!("  Pool shut down");
    Ok(())
}
