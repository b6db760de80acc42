//! Bounded stack of timestamped resources
//!
//! One mutex guards the idle stack, the created count and the shutdown flag. One condition
//! variable is shared by blocked acquirers, the reaper thread and shutdown; every push,
//! release and shutdown broadcasts on it and every waiter re-validates after waking.

use crate::config::{PoolConfiguration, ShutdownCallback};
use crate::errors::{BoxError, PoolError, PoolResult};
use crate::health::HealthStatus;
use crate::managed::ManagedResource;
use crate::metrics::{MetricsTracker, PoolMetrics};

use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

type Factory<T> = Box<dyn Fn() -> Result<T, BoxError> + Send + Sync>;

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

/// Thread-safe bounded pool of lazily created resources
///
/// Resources are created on demand up to `max_size`, handed out in LIFO order and destroyed
/// when they outlive `max_age`. When expiry is enabled a background reaper periodically
/// surfaces expired idle resources and tops the pool back up to `min_size`.
///
/// # Examples
///
/// ```
/// use esox_connectionpool::{PoolConfiguration, TimedStack};
/// use std::time::Duration;
///
/// let stack = TimedStack::new(|| String::from("conn"), PoolConfiguration::new().with_size(1)).unwrap();
///
/// let conn = stack.acquire(Duration::from_secs(1)).unwrap();
/// assert!(stack.is_empty());
/// stack.release(conn).unwrap();
/// assert_eq!(stack.len(), 1);
/// ```
pub struct TimedStack<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

struct Shared<T> {
    id: usize,
    state: Mutex<State<T>>,
    signal: Condvar,
    factory: Factory<T>,
    min_size: usize,
    max_size: usize,
    max_age: Duration,
    timeout: Duration,
    metrics: MetricsTracker,
}

struct State<T> {
    available: Vec<ManagedResource<T>>,
    created: usize,
    shutting_down: bool,
    on_destroy: Option<ShutdownCallback<T>>,
}

impl<T: Send + 'static> TimedStack<T> {
    /// Create a stack around an infallible factory
    pub fn new<F>(factory: F, config: PoolConfiguration<T>) -> PoolResult<Self>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::try_new(move || Ok::<T, BoxError>(factory()), config)
    }

    /// Create a stack around a fallible factory
    ///
    /// `min_size` resources are created before this returns; the first factory error aborts
    /// construction and is returned.
    pub fn try_new<F, E>(factory: F, config: PoolConfiguration<T>) -> PoolResult<Self>
    where
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        config.validate()?;

        let shared = Arc::new(Shared {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(State {
                available: Vec::with_capacity(config.max_size),
                created: 0,
                shutting_down: false,
                on_destroy: config.shutdown_callback.clone(),
            }),
            signal: Condvar::new(),
            factory: Box::new(move || factory().map_err(Into::<BoxError>::into)),
            min_size: config.min_size,
            max_size: config.max_size,
            max_age: config.max_age,
            timeout: config.timeout,
            metrics: MetricsTracker::new(),
        });

        let stack = Self {
            shared,
            reaper: Mutex::new(None),
        };

        {
            let mut state = stack.shared.state.lock();
            for _ in 0..config.min_size {
                let resource = stack.shared.create(&mut state)?;
                state.available.push(resource);
            }
        }

        if config.expires() {
            let shared = Arc::clone(&stack.shared);
            let frequency = config.cleanup_frequency;
            let handle = thread::Builder::new()
                .name("connectionpool-reaper".to_string())
                .spawn(move || shared.reap_loop(frequency))
                .map_err(|e| PoolError::ReaperSpawn(e.to_string()))?;
            *stack.reaper.lock() = Some(handle);
        }

        debug!(
            min_size = config.min_size,
            max_size = config.max_size,
            max_age_ms = config.max_age.as_millis() as u64,
            "Timed stack created"
        );

        Ok(stack)
    }

    /// Take a resource, creating one if there is headroom, waiting up to `timeout` otherwise
    ///
    /// Fails with [`PoolError::Timeout`] at the deadline, [`PoolError::ShuttingDown`] as soon
    /// as shutdown has begun, and [`PoolError::Factory`] when creation fails.
    ///
    /// The resource counts against `max_size` until it is handed to [`release`](Self::release).
    /// Dropping it instead destroys the value but leaves its slot consumed for the life of the
    /// pool. [`ConnectionPool`](crate::ConnectionPool) returns resources automatically.
    pub fn acquire(&self, timeout: Duration) -> PoolResult<ManagedResource<T>> {
        self.shared.acquire(timeout)
    }

    /// [`acquire`](Self::acquire) on tokio's blocking pool
    ///
    /// If the returned future is dropped before completion, a resource acquired in the
    /// background is released straight back.
    pub async fn acquire_async(&self, timeout: Duration) -> PoolResult<ManagedResource<T>> {
        let shared = Arc::clone(&self.shared);
        let (tx, rx) = oneshot::channel();

        tokio::task::spawn_blocking(move || {
            let outcome = shared.acquire(timeout);
            if let Err(Ok(resource)) = tx.send(outcome) {
                debug!("Async acquire abandoned, releasing resource");
                if let Err(err) = shared.release(resource) {
                    warn!(error = %err, "Failed to release abandoned resource");
                }
            }
        });

        rx.await.map_err(|_| PoolError::Cancelled)?
    }

    /// Return a resource. During shutdown it is destroyed instead.
    ///
    /// A resource acquired from a different pool is rejected with
    /// [`PoolError::CheckinWithoutCheckout`] and dropped; neither pool's counts change.
    pub fn release(&self, resource: ManagedResource<T>) -> PoolResult<()> {
        self.shared.release(resource)
    }

    /// Stop handing out resources and destroy every idle one
    ///
    /// Idempotent. Resources still checked out are destroyed when they are released.
    pub fn shutdown(&self) {
        self.shutdown_inner(None);
    }

    /// Like [`shutdown`](Self::shutdown), destroying resources through `callback` instead of
    /// the configured one
    pub fn shutdown_with<F>(&self, callback: F)
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.shutdown_inner(Some(Arc::new(callback)));
    }

    fn shutdown_inner(&self, callback: Option<ShutdownCallback<T>>) {
        {
            let mut state = self.shared.state.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            if callback.is_some() {
                state.on_destroy = callback;
            }
        }
        self.shared.signal.notify_all();
        info!("Pool shutting down");

        if let Some(handle) = self.reaper.lock().take()
            && handle.join().is_err()
        {
            warn!("Reaper thread panicked");
        }

        let mut state = self.shared.state.lock();
        let drained = std::mem::take(&mut state.available);
        state.created -= drained.len();
        let count = drained.len();
        let callback = state.on_destroy.clone();
        for resource in drained {
            self.shared.destroy(callback.as_ref(), resource);
        }
        drop(state);

        info!(drained = count, "Pool shut down");
    }

    /// Destroy idle resources that have sat in the pool for at least `idle_for`
    ///
    /// Returns how many were destroyed.
    pub fn reap(&self, idle_for: Duration) -> usize {
        let mut state = self.shared.state.lock();
        if state.shutting_down {
            return 0;
        }

        let (stale, fresh): (Vec<_>, Vec<_>) = std::mem::take(&mut state.available)
            .into_iter()
            .partition(|resource| resource.idle_time() >= idle_for);
        state.available = fresh;
        state.created -= stale.len();

        let count = stale.len();
        let callback = state.on_destroy.clone();
        for resource in stale {
            self.shared.destroy(callback.as_ref(), resource);
        }
        drop(state);

        if count > 0 {
            debug!(reaped = count, "Reaped idle resources");
            self.shared.signal.notify_all();
        }
        count
    }

    /// Slots available for future acquisition: idle resources plus creation headroom
    pub fn len(&self) -> usize {
        let state = self.shared.state.lock();
        self.shared.max_size - state.created + state.available.len()
    }

    /// True when every possible resource is checked out
    pub fn is_empty(&self) -> bool {
        let state = self.shared.state.lock();
        state.created - state.available.len() >= self.shared.max_size
    }

    /// Idle resources ready for immediate checkout
    pub fn idle(&self) -> usize {
        self.shared.state.lock().available.len()
    }

    /// Resources currently in existence
    pub fn created(&self) -> usize {
        self.shared.state.lock().created
    }

    pub fn max_size(&self) -> usize {
        self.shared.max_size
    }

    pub fn default_timeout(&self) -> Duration {
        self.shared.timeout
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.state.lock().shutting_down
    }

    pub fn metrics(&self) -> PoolMetrics {
        let (created, available) = {
            let state = self.shared.state.lock();
            (state.created, state.available.len())
        };
        self.shared
            .metrics
            .get_metrics(created, available, self.shared.max_size)
    }

    pub fn health_status(&self) -> HealthStatus {
        let state = self.shared.state.lock();
        HealthStatus::new(
            state.available.len(),
            state.created - state.available.len(),
            self.shared.max_size,
            state.shutting_down,
        )
    }
}

impl<T: Send + 'static> Drop for TimedStack<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<T> Shared<T> {
    fn acquire(&self, timeout: Duration) -> PoolResult<ManagedResource<T>> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();

        loop {
            if state.shutting_down {
                return Err(PoolError::ShuttingDown);
            }

            let candidate = match self.fetch_valid(&mut state) {
                Some(resource) => Some(resource),
                None if state.created < self.max_size => Some(self.create(&mut state)?),
                None => None,
            };

            if let Some(resource) = candidate {
                MetricsTracker::increment(&self.metrics.total_acquired);
                return Ok(resource);
            }

            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        MetricsTracker::increment(&self.metrics.timeouts);
                        return Err(PoolError::Timeout(timeout));
                    }
                    self.signal.wait_until(&mut state, deadline);
                }
                None => self.signal.wait(&mut state),
            }
        }
    }

    fn release(&self, mut resource: ManagedResource<T>) -> PoolResult<()> {
        if resource.pool_id() != self.id {
            warn!(
                pool = self.id,
                owner = resource.pool_id(),
                "Rejected resource released to the wrong pool"
            );
            return Err(PoolError::CheckinWithoutCheckout);
        }

        let mut state = self.state.lock();
        MetricsTracker::increment(&self.metrics.total_released);

        if state.shutting_down {
            state.created -= 1;
            let callback = state.on_destroy.clone();
            self.destroy(callback.as_ref(), resource);
        } else {
            resource.touch();
            state.available.push(resource);
        }
        drop(state);

        self.signal.notify_all();
        Ok(())
    }

    /// Pop until a resource that has not expired turns up, destroying expired ones on the way
    fn fetch_valid(&self, state: &mut State<T>) -> Option<ManagedResource<T>> {
        while let Some(resource) = state.available.pop() {
            if !resource.is_expired(self.max_age) {
                return Some(resource);
            }

            state.created -= 1;
            let callback = state.on_destroy.clone();
            self.destroy(callback.as_ref(), resource);
        }
        None
    }

    /// Build a resource. The created count only moves when the factory succeeds.
    fn create(&self, state: &mut State<T>) -> PoolResult<ManagedResource<T>> {
        match (self.factory)() {
            Ok(resource) => {
                state.created += 1;
                MetricsTracker::increment(&self.metrics.total_created);
                debug!(created = state.created, "Created pooled resource");
                Ok(ManagedResource::new(resource, self.id))
            }
            Err(err) => {
                MetricsTracker::increment(&self.metrics.factory_failures);
                Err(PoolError::factory(err))
            }
        }
    }

    fn destroy(&self, callback: Option<&ShutdownCallback<T>>, resource: ManagedResource<T>) {
        MetricsTracker::increment(&self.metrics.total_destroyed);
        debug!(age_ms = resource.age().as_millis() as u64, "Destroying pooled resource");

        let resource = resource.into_inner();
        let Some(callback) = callback else {
            return;
        };

        if panic::catch_unwind(AssertUnwindSafe(|| callback(resource))).is_err() {
            warn!("Shutdown callback panicked, ignoring");
        }
    }

    fn reap_loop(&self, frequency: Duration) {
        let mut next_cleanup = Instant::now().checked_add(frequency);
        let mut state = self.state.lock();

        while !state.shutting_down {
            match next_cleanup {
                Some(at) if Instant::now() >= at => {
                    self.reap_cycle(&mut state);
                    next_cleanup = Instant::now().checked_add(frequency);
                }
                Some(at) => {
                    self.signal.wait_until(&mut state, at);
                }
                None => self.signal.wait(&mut state),
            }
        }

        debug!("Reaper exiting");
    }

    /// Cycle one idle resource through the expiry check, then restore the floor
    fn reap_cycle(&self, state: &mut State<T>) {
        if let Some(resource) = self.fetch_valid(state) {
            state.available.push(resource);
        }

        if state.created < self.min_size {
            match self.create(state) {
                Ok(resource) => state.available.push(resource),
                Err(err) => warn!(error = %err, "Reaper failed to replenish pool"),
            }
        }

        self.signal.notify_all();
    }
}
