use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use keel_core::config::LockConfig;
use keel_core::sync::ExclusiveLock;

async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    condition()
}

#[tokio::test]
async fn uncontended_acquire_and_release() {
    let lock = ExclusiveLock::new("config");

    let guard = lock.acquire(Duration::from_millis(50), Some("writer")).await.unwrap();
    let stats = lock.stats();
    assert!(stats.is_locked);
    assert_eq!(stats.holder.as_deref(), Some("writer"));
    assert_eq!(stats.acquisitions, 1);
    assert_eq!(stats.contentions, 0);

    guard.release();
    let stats = lock.stats();
    assert!(!stats.is_locked);
    assert_eq!(stats.holder, None);
}

#[tokio::test]
async fn waiters_are_granted_in_arrival_order() {
    let lock = ExclusiveLock::new("fifo");
    let order = Arc::new(Mutex::new(Vec::new()));
    let guard = lock.acquire(Duration::from_millis(50), Some("owner")).await.unwrap();

    let mut waiters = Vec::new();
    for index in 1..=5usize {
        let waiter_lock = lock.clone();
        let order = order.clone();
        waiters.push(tokio::spawn(async move {
            let tag = format!("w{index}");
            let guard = waiter_lock.acquire(Duration::from_secs(2), Some(tag.as_str())).await.unwrap();
            order.lock().unwrap().push(index);
            tokio::time::sleep(Duration::from_millis(2)).await;
            guard.release();
        }));
        assert!(wait_until(Duration::from_secs(1), || lock.stats().queue_depth == index).await);
    }

    guard.release();
    for waiter in waiters {
        waiter.await.unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    let stats = lock.stats();
    assert_eq!(stats.contentions, 5);
    assert_eq!(stats.max_queue_depth, 5);
    assert_eq!(stats.acquisitions, 6);
    assert!(!stats.is_locked);
}

#[tokio::test]
async fn acquire_times_out_against_held_lock() {
    let lock = ExclusiveLock::new("slow");
    let guard = lock.acquire(Duration::from_millis(50), Some("owner")).await.unwrap();

    let started = Instant::now();
    let error = lock
        .acquire(Duration::from_millis(50), Some("late"))
        .await
        .unwrap_err();

    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(error.lock, "slow");
    assert_eq!(error.holder.as_deref(), Some("owner"));
    assert_eq!(error.queue_depth, 0);
    assert_eq!(error.timeout, Duration::from_millis(50));
    assert_eq!(lock.stats().queue_depth, 0);

    guard.release();
    let stats = lock.stats();
    assert!(!stats.is_locked, "a timed-out waiter must not receive the lock");
}

#[tokio::test]
async fn timed_out_waiter_does_not_block_the_next_one() {
    let lock = ExclusiveLock::new("mixed");
    let guard = lock.acquire(Duration::from_millis(50), None).await.unwrap();

    let impatient = tokio::spawn({
        let lock = lock.clone();
        async move { lock.acquire(Duration::from_millis(20), Some("impatient")).await.is_err() }
    });
    assert!(wait_until(Duration::from_secs(1), || lock.stats().queue_depth == 1).await);
    let patient = tokio::spawn({
        let lock = lock.clone();
        async move {
            let guard = lock.acquire(Duration::from_secs(2), Some("patient")).await.unwrap();
            guard.release();
        }
    });

    assert!(impatient.await.unwrap());
    guard.release();
    tokio::time::timeout(Duration::from_secs(1), patient)
        .await
        .unwrap()
        .unwrap();
    assert!(!lock.stats().is_locked);
}

#[tokio::test]
async fn failing_section_releases_lock_for_waiters() {
    let lock = ExclusiveLock::new("failing");

    let section = tokio::spawn({
        let lock = lock.clone();
        async move {
            lock.with_lock(Duration::from_millis(50), Some("failing"), || async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Err::<(), String>("write rejected".to_string())
            })
            .await
        }
    });
    assert!(wait_until(Duration::from_secs(1), || lock.stats().is_locked).await);

    let waiter = tokio::spawn({
        let lock = lock.clone();
        async move {
            lock.with_lock(Duration::from_secs(1), Some("waiter"), || async { 7 })
                .await
        }
    });

    let outcome = section.await.unwrap().unwrap();
    assert_eq!(outcome, Err("write rejected".to_string()));
    assert_eq!(waiter.await.unwrap().unwrap(), 7);
    assert!(!lock.stats().is_locked);
}

#[tokio::test]
async fn failing_section_leaves_lock_free() {
    let lock = ExclusiveLock::new("immediate");

    let outcome = lock
        .with_lock(Duration::from_millis(50), None, || async {
            Err::<u32, &str>("boom")
        })
        .await
        .unwrap();

    assert_eq!(outcome, Err("boom"));
    assert!(!lock.stats().is_locked);
}

#[tokio::test]
async fn panicking_section_releases_lock() {
    let lock = ExclusiveLock::new("panicky");

    let joined = tokio::spawn({
        let lock = lock.clone();
        async move {
            lock.with_lock(Duration::from_millis(50), Some("panicker"), || async {
                let exploded = true;
                if exploded {
                    panic!("section exploded");
                }
            })
            .await
        }
    })
    .await;

    assert!(joined.unwrap_err().is_panic());
    assert!(!lock.stats().is_locked);
    let guard = lock.acquire(Duration::from_millis(50), None).await.unwrap();
    guard.release();
}

#[tokio::test]
async fn abandoned_acquire_leaves_queue() {
    let lock = ExclusiveLock::new("abandoned");
    let guard = lock.acquire(Duration::from_millis(50), None).await.unwrap();

    let abandoned = tokio::time::timeout(
        Duration::from_millis(20),
        lock.acquire(Duration::from_secs(5), Some("gives-up")),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(lock.stats().queue_depth, 0);

    guard.release();
    assert!(!lock.stats().is_locked);
}

#[tokio::test]
async fn sections_spanning_awaits_do_not_interleave() {
    let lock = ExclusiveLock::new("counter");
    let value = Arc::new(AtomicUsize::new(0));

    let mut workers = Vec::new();
    for _ in 0..8 {
        let lock = lock.clone();
        let value = value.clone();
        workers.push(tokio::spawn(async move {
            lock.with_lock(Duration::from_secs(5), None, || async {
                let read = value.load(Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                value.store(read + 1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }

    assert_eq!(value.load(Ordering::SeqCst), 8);
}

#[tokio::test]
async fn reset_stats_clears_counters_only() {
    let lock = ExclusiveLock::from_config(
        "stats",
        &LockConfig {
            default_timeout_ms: 250,
            contention_warn_threshold: Some(1),
        },
    );
    assert_eq!(lock.default_timeout(), Duration::from_millis(250));

    let guard = lock.acquire(Duration::from_millis(50), Some("holder")).await.unwrap();
    assert!(lock.acquire(Duration::from_millis(5), None).await.is_err());
    assert_eq!(lock.stats().contentions, 1);

    lock.reset_stats();
    let stats = lock.stats();
    assert_eq!(stats.acquisitions, 0);
    assert_eq!(stats.contentions, 0);
    assert_eq!(stats.max_queue_depth, 0);
    assert!(stats.is_locked);
    assert_eq!(stats.holder.as_deref(), Some("holder"));

    guard.release();
}
