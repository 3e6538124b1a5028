//! Graceful and forced shutdown of the orchestrator and of single handles.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use tidepool_core::{ConfigSource, FixedProbe, PoolsConfig};
use tidepool_scheduler::{
    is_interrupted, CancelledKind, LifecycleState, PoolOrchestrator, SchedulerConfig, SchedulerError,
    TaskError,
};

fn config(pairs: &[(&str, &str)]) -> PoolsConfig {
    let source = ConfigSource::from_pairs(pairs.iter().copied());
    PoolsConfig::load(Some(&source), &FixedProbe::new(2, 4 * 1024 * 1024)).unwrap()
}

/// Spin until interrupted; false if nobody interrupts within 10s.
fn wait_for_interrupt() -> bool {
    let started = Instant::now();
    while !is_interrupted() {
        if started.elapsed() > Duration::from_secs(10) {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
    true
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
fn graceful_stop_finishes_queued_work() {
    let orchestrator = PoolOrchestrator::new(config(&[("cpuIntensive.queueCapacity", "64")]));
    orchestrator.start().unwrap();
    let handle = orchestrator.create_cpu_intensive_scheduler(SchedulerConfig::new()).unwrap();

    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..40 {
        let done = Arc::clone(&done);
        handle
            .execute(move || {
                thread::sleep(Duration::from_millis(5));
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    let report = orchestrator.stop().unwrap();
    assert!(report.is_clean(), "forced: {:?}", report.forced);
    assert!(report.unfired.is_empty());
    assert_eq!(done.load(Ordering::SeqCst), 40);
    assert_eq!(orchestrator.state(), LifecycleState::Stopped);

    assert!(handle.is_shutdown());
    assert!(matches!(handle.submit(|| ()), Err(SchedulerError::Stopped { .. })));
    assert_eq!(handle.pool_size(), 0);
}

#[test]
fn exhausted_budget_forces_cancellation() {
    let orchestrator = PoolOrchestrator::new(config(&[
        ("cpuLight.poolSize", "2"),
        ("gracefulShutdownTimeoutMillis", "100"),
    ]));
    orchestrator.start().unwrap();
    let handle = orchestrator
        .create_cpu_light_scheduler(SchedulerConfig::new().with_name("stubborn"))
        .unwrap();

    let (started_tx, started_rx) = mpsc::channel::<()>();
    let mut loopers = Vec::new();
    for _ in 0..2 {
        let started = started_tx.clone();
        loopers.push(
            handle
                .submit(move || {
                    started.send(()).unwrap();
                    wait_for_interrupt()
                })
                .unwrap(),
        );
    }
    started_rx.recv().unwrap();
    started_rx.recv().unwrap();

    let queued: Vec<_> = (0..3).map(|_| handle.submit(|| ()).unwrap()).collect();

    let began = Instant::now();
    let report = orchestrator.stop().unwrap();
    assert!(began.elapsed() >= Duration::from_millis(100));

    assert_eq!(report.forced.len(), 1, "forced: {:?}", report.forced);
    let forced = &report.forced[0];
    assert_eq!(forced.pool, "tidepool.cpu-light");
    assert_eq!(forced.interrupted, 2);
    assert_eq!(forced.cancelled.len(), 3);
    assert!(forced
        .cancelled
        .iter()
        .all(|task| task.scheduler == "stubborn" && task.kind == CancelledKind::Queued));

    for future in queued {
        assert_eq!(future.get(), Err(TaskError::Cancelled));
    }
    // Interrupted while running: the loopers saw the flag, their futures report cancellation.
    for looper in loopers {
        assert_eq!(looper.get(), Err(TaskError::Cancelled));
    }
    assert!(eventually(|| handle.pool_size() == 0), "workers still alive");
    assert_eq!(orchestrator.state(), LifecycleState::Stopped);
}

#[test]
fn stop_report_lists_unfired_timers() {
    let orchestrator = PoolOrchestrator::new(config(&[]));
    orchestrator.start().unwrap();
    let handle = orchestrator
        .create_cpu_light_scheduler(SchedulerConfig::new().with_name("later"))
        .unwrap();

    let far = handle
        .schedule_after(|| "never", Duration::from_secs(3600))
        .unwrap();
    let report = orchestrator.stop().unwrap();

    assert_eq!(report.unfired.len(), 1);
    assert_eq!(report.unfired[0].id, far.id());
    assert_eq!(report.unfired[0].kind, CancelledKind::Delayed);
    assert_eq!(far.get(), Err(TaskError::Cancelled));
}

#[test]
fn handle_shutdown_now_only_touches_its_own_tasks() {
    let orchestrator = PoolOrchestrator::new(config(&[("cpuLight.poolSize", "1")]));
    orchestrator.start().unwrap();
    let mine = orchestrator.create_cpu_light_scheduler(SchedulerConfig::new()).unwrap();
    let theirs = orchestrator.create_cpu_light_scheduler(SchedulerConfig::new()).unwrap();

    let (started_tx, started_rx) = mpsc::channel::<()>();
    let blocker = mine
        .submit(move || {
            started_tx.send(()).unwrap();
            wait_for_interrupt()
        })
        .unwrap();
    started_rx.recv().unwrap();

    let my_queued = mine.submit(|| 1).unwrap();
    let their_queued = theirs.submit(|| 2).unwrap();

    let cancelled = mine.shutdown_now();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].id, my_queued.id());

    assert_eq!(my_queued.get(), Err(TaskError::Cancelled));
    // Interrupted while running: the future reports cancellation.
    assert_eq!(blocker.get(), Err(TaskError::Cancelled));
    assert_eq!(their_queued.get(), Ok(2));
    assert!(!theirs.is_shutdown());
    assert!(mine.await_termination(Duration::from_secs(2)));

    orchestrator.stop().unwrap();
}

#[test]
fn handle_stop_interrupts_after_its_timeout() {
    let orchestrator = PoolOrchestrator::new(config(&[]));
    orchestrator.start().unwrap();
    let handle = orchestrator
        .create_io_scheduler(SchedulerConfig::new().with_shutdown_timeout(Duration::from_millis(50)))
        .unwrap();

    let (started_tx, started_rx) = mpsc::channel::<()>();
    let slow = handle
        .submit(move || {
            started_tx.send(()).unwrap();
            wait_for_interrupt()
        })
        .unwrap();
    started_rx.recv().unwrap();

    let cancelled = handle.stop();
    assert!(cancelled.is_empty());
    assert_eq!(slow.get(), Err(TaskError::Cancelled));
    assert!(handle.await_termination(Duration::from_secs(2)));
    assert!(handle.is_terminated());

    assert!(orchestrator.stop().unwrap().is_clean());
}

#[test]
fn panicking_task_does_not_kill_the_worker() {
    let orchestrator = PoolOrchestrator::new(config(&[("cpuLight.poolSize", "1")]));
    orchestrator.start().unwrap();
    let handle = orchestrator.create_cpu_light_scheduler(SchedulerConfig::new()).unwrap();

    let boom = handle.submit(|| -> u32 { panic!("boom") }).unwrap();
    assert_eq!(boom.get(), Err(TaskError::Panicked("boom".to_string())));

    assert_eq!(handle.submit(|| 7).unwrap().get(), Ok(7));
    assert_eq!(handle.pool_size(), 1);
    orchestrator.stop().unwrap();
}
