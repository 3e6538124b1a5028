//! Handles backed by their own dedicated pool.

use std::collections::HashSet;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tidepool_core::{FixedProbe, PoolsConfig};
use tidepool_scheduler::{
    is_interrupted, CancelledKind, PoolClass, PoolOrchestrator, QueueKind, SchedulerConfig, SchedulerError,
    TaskError,
};

fn started() -> PoolOrchestrator {
    let config = PoolsConfig::defaults(&FixedProbe::new(2, 4 * 1024 * 1024)).unwrap();
    let orchestrator = PoolOrchestrator::new(config);
    orchestrator.start().unwrap();
    orchestrator
}

fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    check()
}

#[test]
fn custom_pool_runs_on_its_own_threads() {
    let orchestrator = started();
    let batch = orchestrator
        .create_custom_scheduler(SchedulerConfig::new().with_name("batch"), 2, QueueKind::Bounded(8))
        .unwrap();
    assert_eq!(batch.pool_class(), PoolClass::Custom);
    assert_eq!(batch.pool_name(), "tidepool.custom.batch");
    assert_eq!(batch.pool_size(), 2);
    assert_eq!(orchestrator.custom_pool_count(), 1);

    let seen = Arc::new(Mutex::new(HashSet::new()));
    let futures: Vec<_> = (0..8)
        .map(|_| {
            let seen = Arc::clone(&seen);
            batch
                .submit(move || {
                    let name = thread::current().name().unwrap_or_default().to_string();
                    seen.lock().insert(name);
                    thread::sleep(Duration::from_millis(5));
                })
                .unwrap()
        })
        .collect();
    for future in futures {
        future.get().unwrap();
    }
    let seen = seen.lock().clone();
    assert!(!seen.is_empty() && seen.len() <= 2, "threads: {:?}", seen);
    assert!(seen.iter().all(|name| name.starts_with("tidepool.custom.batch.")));

    // The counter moves just after the future completes.
    assert!(eventually(|| {
        orchestrator
            .pool_stats()
            .iter()
            .any(|s| s.name == "tidepool.custom.batch" && s.class == PoolClass::Custom && s.completed == 8)
    }));

    let info = orchestrator
        .list_active_schedulers()
        .into_iter()
        .find(|info| info.name == "batch")
        .unwrap();
    assert!(info.dedicated);

    orchestrator.stop().unwrap();
}

#[test]
fn shutdown_closes_the_dedicated_pool() {
    let orchestrator = started();
    let batch = orchestrator
        .create_custom_scheduler(SchedulerConfig::new().with_name("batch"), 2, QueueKind::Bounded(8))
        .unwrap();

    assert_eq!(batch.submit(|| 40 + 2).unwrap().get(), Ok(42));
    batch.shutdown();
    assert_eq!(orchestrator.custom_pool_count(), 0);
    assert!(matches!(batch.submit(|| ()), Err(SchedulerError::Stopped { .. })));

    assert!(batch.await_termination(Duration::from_secs(2)));
    assert!(batch.is_terminated());
    assert!(eventually(|| batch.pool_size() == 0));
    assert!(orchestrator.stop().unwrap().is_clean());
}

#[test]
fn pending_one_shot_keeps_the_pool_open() {
    let orchestrator = started();
    let batch = orchestrator
        .create_custom_scheduler(SchedulerConfig::new().with_name("late"), 1, QueueKind::Bounded(4))
        .unwrap();

    let task = batch.schedule_after(|| "fired", Duration::from_millis(50)).unwrap();
    batch.shutdown();
    assert_eq!(orchestrator.custom_pool_count(), 1);

    assert_eq!(task.get_timeout(Duration::from_secs(2)), Ok("fired"));
    assert!(batch.await_termination(Duration::from_secs(2)));
    assert!(eventually(|| orchestrator.custom_pool_count() == 0));
    orchestrator.stop().unwrap();
}

#[test]
fn shutdown_now_drains_queue_and_interrupts_workers() {
    let orchestrator = started();
    let batch = orchestrator
        .create_custom_scheduler(SchedulerConfig::new().with_name("batch"), 2, QueueKind::Bounded(8))
        .unwrap();

    let (started_tx, started_rx) = mpsc::channel::<()>();
    let running: Vec<_> = (0..2)
        .map(|_| {
            let started = started_tx.clone();
            batch
                .submit(move || {
                    started.send(()).unwrap();
                    let began = Instant::now();
                    while !is_interrupted() && began.elapsed() < Duration::from_secs(10) {
                        thread::sleep(Duration::from_millis(1));
                    }
                })
                .unwrap()
        })
        .collect();
    started_rx.recv().unwrap();
    started_rx.recv().unwrap();

    let queued: Vec<_> = (0..3).map(|i| batch.submit(move || i).unwrap()).collect();
    let cancelled = batch.shutdown_now();
    assert_eq!(cancelled.len(), 3);
    assert!(cancelled
        .iter()
        .all(|task| task.kind == CancelledKind::Queued && task.scheduler == "batch"));

    for future in queued {
        assert_eq!(future.get(), Err(TaskError::Cancelled));
    }
    for future in running {
        assert_eq!(future.get(), Err(TaskError::Cancelled));
    }
    assert!(batch.await_termination(Duration::from_secs(5)));
    assert_eq!(batch.pool_size(), 0);
    assert_eq!(orchestrator.custom_pool_count(), 0);
    orchestrator.stop().unwrap();
}

#[test]
fn orchestrator_stop_closes_custom_pools() {
    let orchestrator = started();
    let first = orchestrator
        .create_custom_scheduler(SchedulerConfig::new().with_name("first"), 1, QueueKind::Bounded(2))
        .unwrap();
    let second = orchestrator
        .create_custom_scheduler(SchedulerConfig::new().with_name("second"), 1, QueueKind::Rendezvous)
        .unwrap();
    assert_eq!(orchestrator.custom_pool_count(), 2);

    let report = orchestrator.stop().unwrap();
    assert!(report.is_clean());
    assert_eq!(orchestrator.custom_pool_count(), 0);
    assert!(first.is_shutdown() && second.is_shutdown());
    assert!(eventually(|| first.pool_size() == 0 && second.pool_size() == 0));
}
