//! Reentrant checkout/checkin front over a timed stack

use crate::config::PoolConfiguration;
use crate::errors::{BoxError, PoolError, PoolResult};
use crate::health::HealthStatus;
use crate::managed::ManagedResource;
use crate::metrics::PoolMetrics;
use crate::timed_stack::TimedStack;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// A checked-out resource that checks itself back in when dropped
///
/// Nested checkouts on one thread share the same resource, so the guard only hands out
/// shared references. It is tied to the thread that checked it out and cannot be sent
/// elsewhere.
pub struct PooledConnection<'a, T: Send + 'static> {
    pool: &'a ConnectionPool<T>,
    resource: Option<Arc<ManagedResource<T>>>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T: Send + 'static> PooledConnection<'a, T> {
    fn new(pool: &'a ConnectionPool<T>, resource: Arc<ManagedResource<T>>) -> Self {
        Self {
            pool,
            resource: Some(resource),
            _not_send: PhantomData,
        }
    }

    /// Check the resource back in now instead of on drop
    pub fn checkin(mut self) -> PoolResult<()> {
        match self.resource.take() {
            Some(resource) => self.pool.checkin(resource),
            None => Err(PoolError::CheckinWithoutCheckout),
        }
    }

    pub fn created_at(&self) -> Instant {
        self.managed().created_at()
    }

    fn managed(&self) -> &ManagedResource<T> {
        self.resource.as_ref().expect("Resource already checked in")
    }
}

impl<T: Send + 'static> Deref for PooledConnection<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.managed()
    }
}

impl<T: Send + 'static> Drop for PooledConnection<'_, T> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take()
            && let Err(err) = self.pool.checkin(resource)
        {
            warn!(error = %err, "Checkin on drop failed");
        }
    }
}

impl<T: Send + fmt::Debug + 'static> fmt::Debug for PooledConnection<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("resource", &self.resource.as_deref().map(|managed| &**managed))
            .finish()
    }
}

/// What one thread currently holds: the resource and how deeply it is nested
struct Checkout<T> {
    resource: Arc<ManagedResource<T>>,
    depth: usize,
}

/// A resource held mutably by one thread; released and unregistered on drop
struct ExclusiveCheckout<'a, T: Send + 'static> {
    pool: &'a ConnectionPool<T>,
    thread: ThreadId,
    resource: Option<ManagedResource<T>>,
}

impl<T: Send + 'static> Drop for ExclusiveCheckout<'_, T> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take()
            && let Err(err) = self.pool.stack.release(resource)
        {
            warn!(error = %err, "Release of exclusive checkout failed");
        }
        self.pool.exclusive.remove(&self.thread);
    }
}

/// Connection pool with per-call timeouts and reentrant per-thread checkout
///
/// A thread that already holds a resource gets the same one back from nested checkouts
/// without consuming another slot. The resource goes back to the pool when the outermost
/// checkout ends, on every exit path including panics.
///
/// Because nested checkouts alias one resource, [`with`](Self::with) and [`checkout`](Self::checkout)
/// only give out `&T`. Resources whose operations take `&mut self` either carry their own
/// interior mutability or go through [`with_mut`](Self::with_mut), which is exclusive and
/// therefore not reentrant.
///
/// # Examples
///
/// ```
/// use esox_connectionpool::{ConnectionPool, PoolConfiguration};
///
/// let pool = ConnectionPool::new(|| String::from("conn"), PoolConfiguration::new().with_size(2)).unwrap();
///
/// let len = pool.with(|conn| {
///     // Reentrant: same thread, same resource.
///     pool.with(|inner| assert_eq!(conn, inner)).unwrap();
///     conn.len()
/// }).unwrap();
///
/// assert_eq!(len, 4);
/// assert_eq!(pool.len(), 2);
/// ```
pub struct ConnectionPool<T: Send + 'static> {
    stack: TimedStack<T>,
    timeout: Duration,
    checkouts: DashMap<ThreadId, Checkout<T>>,
    exclusive: DashSet<ThreadId>,
}

impl<T: Send + 'static> ConnectionPool<T> {
    /// Create a pool around an infallible factory
    pub fn new<F>(factory: F, config: PoolConfiguration<T>) -> PoolResult<Self>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Ok(Self::from_stack(TimedStack::new(factory, config)?))
    }

    /// Create a pool around a fallible factory
    pub fn try_new<F, E>(factory: F, config: PoolConfiguration<T>) -> PoolResult<Self>
    where
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        Ok(Self::from_stack(TimedStack::try_new(factory, config)?))
    }

    fn from_stack(stack: TimedStack<T>) -> Self {
        Self {
            timeout: stack.default_timeout(),
            stack,
            checkouts: DashMap::new(),
            exclusive: DashSet::new(),
        }
    }

    /// Run `f` with a resource, waiting up to the configured timeout for one
    pub fn with<R, F>(&self, f: F) -> PoolResult<R>
    where
        F: FnOnce(&T) -> R,
    {
        self.with_timeout(self.timeout, f)
    }

    /// Run `f` with a resource, waiting up to `timeout` for one
    ///
    /// The resource is checked back in however `f` exits, unwinding included.
    pub fn with_timeout<R, F>(&self, timeout: Duration, f: F) -> PoolResult<R>
    where
        F: FnOnce(&T) -> R,
    {
        let conn = self.checkout(Some(timeout))?;
        let output = f(&conn);
        drop(conn);
        Ok(output)
    }

    /// Run `f` with mutable access to a resource, waiting up to the configured timeout
    ///
    /// Fails with [`PoolError::AlreadyCheckedOut`] when this thread already holds a resource
    /// from this pool, and every checkout this thread attempts from inside `f` fails the same
    /// way. The resource is released however `f` exits.
    pub fn with_mut<R, F>(&self, f: F) -> PoolResult<R>
    where
        F: FnOnce(&mut T) -> R,
    {
        if self.is_checked_out() {
            return Err(PoolError::AlreadyCheckedOut);
        }

        let thread = thread::current().id();
        let resource = self.stack.acquire(self.timeout)?;
        self.exclusive.insert(thread);
        let mut held = ExclusiveCheckout {
            pool: self,
            thread,
            resource: Some(resource),
        };

        let resource = held.resource.as_mut().expect("Exclusive resource present");
        Ok(f(&mut **resource))
    }

    /// Check out a resource, or the one this thread already holds
    ///
    /// `None` uses the configured timeout.
    pub fn checkout(&self, timeout: Option<Duration>) -> PoolResult<PooledConnection<'_, T>> {
        let thread = thread::current().id();

        if self.exclusive.contains(&thread) {
            return Err(PoolError::AlreadyCheckedOut);
        }

        if let Some(mut held) = self.checkouts.get_mut(&thread) {
            held.depth += 1;
            return Ok(PooledConnection::new(self, Arc::clone(&held.resource)));
        }

        let resource = Arc::new(self.stack.acquire(timeout.unwrap_or(self.timeout))?);
        self.checkouts.insert(
            thread,
            Checkout {
                resource: Arc::clone(&resource),
                depth: 1,
            },
        );
        Ok(PooledConnection::new(self, resource))
    }

    /// Unwind one checkout level; the outermost one releases to the stack
    ///
    /// A checkin on a thread with no checkout is rejected with
    /// [`PoolError::CheckinWithoutCheckout`].
    fn checkin(&self, resource: Arc<ManagedResource<T>>) -> PoolResult<()> {
        drop(resource);

        let held = match self.checkouts.entry(thread::current().id()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().depth -= 1;
                if entry.get().depth > 0 {
                    return Ok(());
                }
                entry.remove()
            }
            Entry::Vacant(_) => return Err(PoolError::CheckinWithoutCheckout),
        };

        match Arc::try_unwrap(held.resource) {
            Ok(resource) => self.stack.release(resource),
            Err(_) => {
                error!("Checked-in resource is still referenced and cannot be released");
                Ok(())
            }
        }
    }

    /// Shut the underlying stack down
    pub fn shutdown(&self) {
        self.stack.shutdown();
    }

    /// Shut down, destroying resources through `callback`
    pub fn shutdown_with<F>(&self, callback: F)
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.stack.shutdown_with(callback);
    }

    /// Whether the calling thread currently holds a resource from this pool
    pub fn is_checked_out(&self) -> bool {
        let thread = thread::current().id();
        self.checkouts.contains_key(&thread) || self.exclusive.contains(&thread)
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn idle(&self) -> usize {
        self.stack.idle()
    }

    pub fn size(&self) -> usize {
        self.stack.max_size()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn reap(&self, idle_for: Duration) -> usize {
        self.stack.reap(idle_for)
    }

    pub fn metrics(&self) -> PoolMetrics {
        self.stack.metrics()
    }

    pub fn health_status(&self) -> HealthStatus {
        self.stack.health_status()
    }

    /// The stack behind this pool, for callers that manage resources without thread affinity
    pub fn stack(&self) -> &TimedStack<T> {
        &self.stack
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn numbered_pool(size: usize) -> ConnectionPool<usize> {
        let next = AtomicUsize::new(0);
        ConnectionPool::new(
            move || next.fetch_add(1, Ordering::SeqCst),
            PoolConfiguration::new().with_size(size),
        )
        .unwrap()
    }

    #[test]
    fn with_returns_resource_afterwards() {
        let pool = numbered_pool(2);

        let value = pool.with(|conn| *conn + 10).unwrap();
        assert_eq!(value, 10);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.idle(), 1);
        assert!(!pool.is_checked_out());
    }

    #[test]
    fn nested_checkout_reuses_resource() {
        let pool = numbered_pool(3);

        pool.with(|outer| {
            assert_eq!(pool.len(), 2);
            pool.with(|inner| {
                assert_eq!(outer, inner);
                assert_eq!(pool.len(), 2);
                assert_eq!(pool.stack().created(), 1);
            })
            .unwrap();
            assert!(pool.is_checked_out());
            assert_eq!(pool.len(), 2);
        })
        .unwrap();

        assert_eq!(pool.len(), 3);
        assert!(!pool.is_checked_out());
        assert_eq!(pool.metrics().total_released, 1);
    }

    #[test]
    fn explicit_checkin_unwinds_levels() {
        let pool = numbered_pool(1);

        let outer = pool.checkout(None).unwrap();
        let inner = pool.checkout(None).unwrap();
        assert_eq!(*outer, *inner);

        inner.checkin().unwrap();
        assert!(pool.is_empty());

        outer.checkin().unwrap();
        assert!(!pool.is_empty());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn panicking_body_still_checks_in() {
        let pool = numbered_pool(1);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            pool.with::<(), _>(|_| panic!("query failed")).unwrap();
        }));
        assert!(outcome.is_err());

        assert!(!pool.is_checked_out());
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.with(|conn| *conn).unwrap(), 0);
    }

    #[test]
    fn threads_get_distinct_resources() {
        let pool = numbered_pool(2);
        let (tx, rx) = crossbeam::channel::unbounded();
        let barrier = std::sync::Barrier::new(2);

        thread::scope(|scope| {
            for _ in 0..2 {
                let tx = tx.clone();
                let pool = &pool;
                let barrier = &barrier;
                scope.spawn(move || {
                    pool.with(|conn| {
                        tx.send(*conn).unwrap();
                        barrier.wait();
                    })
                    .unwrap();
                });
            }
        });

        let mut seen: Vec<usize> = rx.try_iter().collect();
        seen.sort();
        assert_eq!(seen, vec![0, 1]);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn timeout_override_applies_per_call() {
        let pool = numbered_pool(1);
        let (held_tx, held_rx) = crossbeam::channel::bounded(0);
        let (done_tx, done_rx) = crossbeam::channel::bounded::<()>(0);

        thread::scope(|scope| {
            scope.spawn(|| {
                pool.with(|_| {
                    held_tx.send(()).unwrap();
                    done_rx.recv().unwrap();
                })
                .unwrap();
            });

            held_rx.recv().unwrap();
            let err = pool.with_timeout(Duration::ZERO, |_| ()).unwrap_err();
            assert!(matches!(err, PoolError::Timeout(d) if d.is_zero()));
            assert!(!pool.is_checked_out());
            done_tx.send(()).unwrap();
        });

        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn failed_checkout_leaves_no_entry() {
        let pool = ConnectionPool::try_new(
            || Err::<u8, _>("refused"),
            PoolConfiguration::new().with_size(1),
        )
        .unwrap();

        assert!(matches!(pool.checkout(None), Err(PoolError::Factory(_))));
        assert!(!pool.is_checked_out());
        assert!(pool.checkouts.is_empty());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn shutdown_blocks_checkout_and_destroys_on_checkin() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&destroyed);
        let config = PoolConfiguration::new()
            .with_min_size(1)
            .with_max_size(2)
            .with_shutdown_callback(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        let pool = ConnectionPool::new(|| 0u8, config).unwrap();

        let held = pool.checkout(None).unwrap();
        pool.shutdown();
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);

        // Reentrant checkout still sees the held resource.
        let nested = pool.checkout(None).unwrap();
        drop(nested);
        drop(held);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);

        assert!(matches!(pool.checkout(None), Err(PoolError::ShuttingDown)));
    }

    #[test]
    fn checkin_on_thread_without_checkout_is_rejected() {
        let pool = numbered_pool(2);
        let stray = Arc::new(pool.stack().acquire(Duration::ZERO).unwrap());

        let err = pool.checkin(stray).unwrap_err();
        assert!(matches!(err, PoolError::CheckinWithoutCheckout));
        assert!(pool.checkouts.is_empty());
        assert_eq!(pool.metrics().total_released, 0);
    }

    #[test]
    fn with_mut_changes_persist() {
        let pool = ConnectionPool::new(Vec::<u32>::new, PoolConfiguration::new().with_size(1)).unwrap();

        pool.with_mut(|conn| conn.push(7)).unwrap();
        pool.with_mut(|conn| conn.push(8)).unwrap();

        assert_eq!(pool.with(|conn| conn.clone()).unwrap(), vec![7, 8]);
        assert!(!pool.is_checked_out());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn with_mut_is_not_reentrant() {
        let pool = numbered_pool(2);

        let inside_with = pool.with(|_| pool.with_mut(|_| ())).unwrap();
        assert!(matches!(inside_with, Err(PoolError::AlreadyCheckedOut)));

        let (nested_with, nested_mut) = pool
            .with_mut(|_| {
                assert!(pool.is_checked_out());
                (pool.with(|_| ()), pool.with_mut(|_| ()))
            })
            .unwrap();
        assert!(matches!(nested_with, Err(PoolError::AlreadyCheckedOut)));
        assert!(matches!(nested_mut, Err(PoolError::AlreadyCheckedOut)));

        assert!(!pool.is_checked_out());
        assert_eq!(pool.stack().created(), 1);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn panicking_with_mut_still_releases() {
        let pool = numbered_pool(1);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            pool.with_mut::<(), _>(|_| panic!("write failed")).unwrap();
        }));
        assert!(outcome.is_err());

        assert!(!pool.is_checked_out());
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.with_mut(|conn| *conn).unwrap(), 0);
    }
}
