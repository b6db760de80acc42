//! Resources as the pool holds them

use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

/// A pooled resource together with its lifecycle timestamps
///
/// Handed out by [`TimedStack::acquire`](crate::TimedStack::acquire) and given back through
/// [`TimedStack::release`](crate::TimedStack::release). Each one is stamped with the id of
/// the pool that built it; releasing it into any other pool is rejected.
#[derive(Debug)]
pub struct ManagedResource<T> {
    resource: T,
    pool_id: usize,
    created_at: Instant,
    returned_at: Instant,
}

impl<T> ManagedResource<T> {
    pub(crate) fn new(resource: T, pool_id: usize) -> Self {
        let now = Instant::now();
        Self {
            resource,
            pool_id,
            created_at: now,
            returned_at: now,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_created_at(resource: T, pool_id: usize, created_at: Instant) -> Self {
        Self {
            resource,
            pool_id,
            created_at,
            returned_at: created_at,
        }
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Time since the resource was created
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time the resource has been sitting idle in the pool
    pub fn idle_time(&self) -> Duration {
        self.returned_at.elapsed()
    }

    /// A zero `max_age` never expires
    pub fn is_expired(&self, max_age: Duration) -> bool {
        !max_age.is_zero() && self.age() >= max_age
    }

    pub(crate) fn pool_id(&self) -> usize {
        self.pool_id
    }

    pub(crate) fn touch(&mut self) {
        self.returned_at = Instant::now();
    }

    pub(crate) fn into_inner(self) -> T {
        self.resource
    }
}

impl<T> Deref for ManagedResource<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.resource
    }
}

impl<T> DerefMut for ManagedResource<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.resource
    }
}
