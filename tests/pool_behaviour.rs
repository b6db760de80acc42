use esox_connectionpool::{ConnectionPool, PoolConfiguration, PoolError, TimedStack};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn concurrent_holders_never_exceed_max() {
    const MAX: usize = 4;

    let holding = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let pool = ConnectionPool::new(|| (), PoolConfiguration::new().with_size(MAX)).unwrap();

    thread::scope(|scope| {
        for _ in 0..16 {
            scope.spawn(|| {
                for _ in 0..50 {
                    pool.with_timeout(Duration::from_secs(10), |_| {
                        let now = holding.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::yield_now();
                        holding.fetch_sub(1, Ordering::SeqCst);
                    })
                    .unwrap();
                }
            });
        }
    });

    assert!(peak.load(Ordering::SeqCst) <= MAX);
    assert!(pool.stack().created() <= MAX);
    assert_eq!(pool.len(), MAX);
    assert_eq!(pool.metrics().total_acquired, pool.metrics().total_released);
}

#[test]
fn waiter_receives_the_released_instance() {
    let stack = TimedStack::new(|| Arc::new(()), PoolConfiguration::new().with_size(1)).unwrap();
    let held = stack.acquire(Duration::ZERO).unwrap();
    let identity = Arc::clone(&*held);

    let (tx, rx) = crossbeam::channel::bounded(1);
    thread::scope(|scope| {
        scope.spawn(|| {
            let received = stack.acquire(Duration::from_secs(10)).unwrap();
            tx.send(Arc::ptr_eq(&*received, &identity)).unwrap();
            stack.release(received).unwrap();
        });

        thread::sleep(Duration::from_millis(50));
        stack.release(held).unwrap();
    });

    assert!(rx.recv().unwrap());
}

#[test]
fn reentrancy_is_per_thread() {
    let next = AtomicUsize::new(0);
    let pool = ConnectionPool::new(
        move || next.fetch_add(1, Ordering::SeqCst),
        PoolConfiguration::new().with_size(2),
    )
    .unwrap();

    let outer = pool.checkout(None).unwrap();
    let nested = pool.checkout(None).unwrap();
    assert_eq!(*outer, *nested);
    assert_eq!(pool.len(), 1);

    let other = thread::scope(|scope| {
        scope
            .spawn(|| pool.with(|conn| *conn).unwrap())
            .join()
            .unwrap()
    });
    assert_ne!(other, *outer);

    drop(nested);
    assert_eq!(pool.len(), 1);
    drop(outer);
    assert_eq!(pool.len(), 2);
}

#[test]
fn shutdown_is_one_way_and_idempotent() {
    let destroyed = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&destroyed);
    let config = PoolConfiguration::new()
        .with_min_size(2)
        .with_max_size(4)
        .with_shutdown_callback(move |_: u32| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
    let pool = ConnectionPool::new(|| 7u32, config).unwrap();

    pool.shutdown();
    pool.shutdown();

    assert_eq!(destroyed.load(Ordering::SeqCst), 2);
    assert!(matches!(pool.with(|_| ()), Err(PoolError::ShuttingDown)));
    assert!(!pool.health_status().is_healthy());
}

#[test]
fn failing_factory_does_not_leak_capacity() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&attempts);
    let pool = ConnectionPool::try_new(
        move || {
            counted.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(std::io::Error::other("database unavailable"))
        },
        PoolConfiguration::new().with_size(2),
    )
    .unwrap();

    for _ in 0..5 {
        let err = pool.with(|_| ()).unwrap_err();
        assert!(err.to_string().contains("database unavailable"));
        assert_eq!(pool.len(), 2);
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_waiter_is_served_after_release() {
    let stack = Arc::new(TimedStack::new(|| 1u8, PoolConfiguration::new().with_size(1)).unwrap());
    let held = stack.acquire(Duration::ZERO).unwrap();

    let waiter = {
        let stack = Arc::clone(&stack);
        tokio::spawn(async move { stack.acquire_async(Duration::from_secs(10)).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    stack.release(held).unwrap();

    let resource = waiter.await.unwrap().unwrap();
    assert_eq!(*resource, 1);
    stack.release(resource).unwrap();
    assert_eq!(stack.len(), 1);
}

#[test]
fn sibling_pools_refuse_each_others_resources() {
    let primary = TimedStack::new(|| 1u32, PoolConfiguration::new().with_size(1)).unwrap();
    let replica = TimedStack::new(|| 2u32, PoolConfiguration::new().with_size(1)).unwrap();

    let from_replica = replica.acquire(Duration::ZERO).unwrap();
    assert!(matches!(
        primary.release(from_replica),
        Err(PoolError::CheckinWithoutCheckout)
    ));

    let first = primary.acquire(Duration::ZERO).unwrap();
    assert!(matches!(
        primary.acquire(Duration::ZERO),
        Err(PoolError::Timeout(_))
    ));
    primary.release(first).unwrap();
    assert_eq!(primary.created(), 1);
    assert_eq!(primary.len(), 1);
}
