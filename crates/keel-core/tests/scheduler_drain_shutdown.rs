use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use keel_core::config::SchedulerConfig;
use keel_core::load::LoadMonitor;
use keel_core::models::{BoxError, SchedulerError, TaskId, TaskPolicy, TerminationReason};
use keel_core::orchestration::{DeferredTask, PeriodicTask, Runnable, TaskScheduler};

fn scheduler() -> TaskScheduler {
    TaskScheduler::new(LoadMonitor::idle(), SchedulerConfig::default())
}

fn noop() -> impl Runnable {
    || async { Ok::<(), BoxError>(()) }
}

fn counting(counter: Arc<AtomicUsize>) -> impl Runnable {
    move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), BoxError>(())
        }
    }
}

fn ids(names: &[&str]) -> Vec<TaskId> {
    names.iter().map(|name| TaskId::from(*name)).collect()
}

/// Registers long-period tasks with strictly increasing creation times.
async fn register_staggered(scheduler: &TaskScheduler, names: &[&str]) {
    for name in names {
        scheduler
            .register_periodic(PeriodicTask::new(Duration::from_secs(3600), noop()).id(*name))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

#[tokio::test]
async fn drain_keeps_the_newest_tasks() {
    let scheduler = scheduler();
    let names = ["t0", "t1", "t2", "t3", "t4", "t5", "t6", "t7", "t8", "t9"];
    register_staggered(&scheduler, &names).await;

    let cancelled = scheduler.emergency_drain(4);

    assert_eq!(cancelled, ids(&names[..6]));
    assert_eq!(scheduler.active_ids(), ids(&names[6..]));
    assert_eq!(scheduler.diagnostics().periodic_count, 4);
    assert_eq!(
        scheduler.snapshot("t0").unwrap().termination_reason,
        Some(TerminationReason::Drained)
    );
}

#[tokio::test]
async fn drain_under_cap_is_a_no_op() {
    let scheduler = scheduler();
    register_staggered(&scheduler, &["a", "b"]).await;

    assert!(scheduler.emergency_drain(2).is_empty());
    assert!(scheduler.emergency_drain(10).is_empty());
    assert_eq!(scheduler.active_ids(), ids(&["a", "b"]));
}

#[tokio::test]
async fn drain_to_zero_cancels_every_periodic_task() {
    let scheduler = scheduler();
    register_staggered(&scheduler, &["a", "b", "c"]).await;

    let cancelled = scheduler.emergency_drain(0);

    assert_eq!(cancelled, ids(&["a", "b", "c"]));
    assert_eq!(scheduler.diagnostics().total_timers, 0);
}

#[tokio::test]
async fn drain_never_touches_deferred_tasks() {
    let scheduler = scheduler();
    for name in ["d0", "d1", "d2"] {
        scheduler
            .register_deferred(DeferredTask::new(Duration::from_secs(3600), noop()).id(name))
            .unwrap();
    }
    register_staggered(&scheduler, &["p0", "p1", "p2", "p3"]).await;

    let cancelled = scheduler.emergency_drain(5);
    assert_eq!(cancelled, ids(&["p0", "p1"]));

    // Three deferred tasks alone exceed a cap of two: every periodic task goes.
    let cancelled = scheduler.emergency_drain(2);
    assert_eq!(cancelled, ids(&["p2", "p3"]));

    let diagnostics = scheduler.diagnostics();
    assert_eq!(diagnostics.periodic_count, 0);
    assert_eq!(diagnostics.deferred_count, 3);
}

#[tokio::test]
async fn spared_tasks_survive_drain_but_count_toward_cap() {
    let scheduler = scheduler();
    register_staggered(&scheduler, &["keeper", "t0", "t1", "t2", "t3"]).await;

    let cancelled = scheduler.emergency_drain_sparing(2, &["keeper"]);

    assert_eq!(cancelled, ids(&["t0", "t1", "t2"]));
    assert_eq!(scheduler.active_ids(), ids(&["keeper", "t3"]));

    let cancelled = scheduler.emergency_drain_sparing(0, &["keeper"]);
    assert_eq!(cancelled, ids(&["t3"]));
    assert_eq!(scheduler.active_ids(), ids(&["keeper"]));
}

#[tokio::test]
async fn unbounded_grace_still_returns_when_tasks_finish() {
    let scheduler = scheduler();
    scheduler
        .register_deferred(DeferredTask::new(Duration::from_millis(10), noop()).id("quick"))
        .unwrap();

    let report = tokio::time::timeout(Duration::from_secs(2), scheduler.shutdown(Duration::MAX))
        .await
        .unwrap();

    assert_eq!(report.completed_in_grace, 1);
    assert!(report.force_cancelled.is_empty());
}

#[tokio::test]
async fn shutdown_force_cancels_after_grace() {
    let scheduler = scheduler();
    let counter = Arc::new(AtomicUsize::new(0));
    scheduler
        .register_periodic(
            PeriodicTask::new(Duration::from_millis(10), counting(counter.clone())).id("forever"),
        )
        .unwrap();

    let started = Instant::now();
    let report = scheduler.shutdown(Duration::from_millis(100)).await;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(1));
    assert_eq!(report.force_cancelled, ids(&["forever"]));
    assert_eq!(report.completed_in_grace, 0);
    assert_eq!(scheduler.diagnostics().total_timers, 0);
    assert_eq!(
        scheduler.snapshot("forever").unwrap().termination_reason,
        Some(TerminationReason::Shutdown)
    );

    let ran = counter.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counter.load(Ordering::SeqCst), ran);
}

#[tokio::test]
async fn shutdown_rejects_registrations_immediately() {
    let scheduler = scheduler();
    scheduler
        .register_periodic(PeriodicTask::new(Duration::from_millis(10), noop()).id("running"))
        .unwrap();

    let shutdown = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.shutdown(Duration::from_millis(100)).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(!scheduler.is_accepting());
    assert!(scheduler.is_active("running"));
    let error = scheduler
        .register_periodic(PeriodicTask::new(Duration::from_millis(10), noop()).id("late"))
        .unwrap_err();
    assert_eq!(error, SchedulerError::ShuttingDown(TaskId::from("late")));
    let error = scheduler
        .register_deferred(DeferredTask::new(Duration::from_millis(10), noop()).id("later"))
        .unwrap_err();
    assert_eq!(error, SchedulerError::ShuttingDown(TaskId::from("later")));

    let report = shutdown.await.unwrap();
    assert_eq!(report.force_cancelled, ids(&["running"]));
}

#[tokio::test]
async fn shutdown_returns_early_once_tasks_finish() {
    let scheduler = scheduler();
    scheduler
        .register_periodic(
            PeriodicTask::new(Duration::from_millis(10), noop())
                .id("short")
                .policy(TaskPolicy::default().with_max_runs(2)),
        )
        .unwrap();
    scheduler
        .register_deferred(DeferredTask::new(Duration::from_millis(15), noop()).id("one-shot"))
        .unwrap();

    let started = Instant::now();
    let report = scheduler.shutdown(Duration::from_secs(5)).await;

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(report.completed_in_grace, 2);
    assert!(report.force_cancelled.is_empty());
}

#[tokio::test]
async fn diagnostics_reflect_registry() {
    let scheduler = scheduler();
    let counter = Arc::new(AtomicUsize::new(0));
    scheduler
        .register_periodic(
            PeriodicTask::new(Duration::from_millis(10), counting(counter.clone())).id("fast"),
        )
        .unwrap();
    scheduler
        .register_periodic(PeriodicTask::new(Duration::from_secs(3600), noop()).id("slow"))
        .unwrap();
    scheduler
        .register_deferred(DeferredTask::new(Duration::from_secs(3600), noop()).id("someday"))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    let diagnostics = scheduler.diagnostics();

    assert_eq!(diagnostics.total_timers, 3);
    assert_eq!(diagnostics.periodic_count, 2);
    assert_eq!(diagnostics.deferred_count, 1);
    assert!(diagnostics.oldest_task_age_ms.unwrap() >= 50);
    assert!(diagnostics.total_executions >= 1);
    assert!(diagnostics.total_executions <= counter.load(Ordering::SeqCst) as u64 + 1);
}
