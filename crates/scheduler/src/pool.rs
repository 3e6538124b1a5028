//! Backing thread pool shared by scheduler handles.
//!
//! Threads up to `core_size` are started eagerly and stay alive; beyond that
//! the pool grows to `max_size` only when its queue refuses a task, and the
//! extra threads retire after `keep_alive` without work. A zero-capacity
//! queue turns the pool into a rendezvous hand-off: a task is accepted only
//! if a thread is idle or can still be added.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Condvar, Mutex, RwLock};
use tidepool_core::{PoolClass, PoolSizing};
use tracing::{debug, error, info};

use crate::cohort::ThreadCohort;
use crate::task::{CancelOutcome, Job, TaskControl};
use crate::thread_factory::NamedThreadFactory;

/// Why a pool refused a task. The task is handed back to the caller.
#[derive(Debug)]
pub(crate) enum Refused {
    /// Queue full and no thread can be added.
    Full(Job),
    /// The pool no longer accepts work.
    Shutdown(Job),
}

#[derive(Default)]
struct PoolState {
    /// Live worker threads.
    workers: usize,
    shutdown: bool,
    /// Tasks currently executing, by worker sequence number.
    running: HashMap<usize, Arc<dyn TaskControl>>,
}

enum NextJob {
    Job(Job),
    /// Idle past keep-alive with more than `core_size` workers; already uncounted.
    Retire,
    /// Queue closed and drained.
    Closed,
}

pub struct BackingPool {
    class: PoolClass,
    sizing: PoolSizing,
    factory: NamedThreadFactory,
    sender: RwLock<Option<Sender<Job>>>,
    receiver: Receiver<Job>,
    state: Mutex<PoolState>,
    terminated: Condvar,
    next_worker: AtomicUsize,
    completed: AtomicU64,
}

impl BackingPool {
    pub(crate) fn new(cohort: Arc<ThreadCohort>, sizing: PoolSizing) -> Arc<Self> {
        let (sender, receiver) = channel::bounded(sizing.queue.capacity());
        Arc::new(Self {
            class: cohort.class(),
            sizing,
            factory: NamedThreadFactory::new(cohort),
            sender: RwLock::new(Some(sender)),
            receiver,
            state: Mutex::new(PoolState::default()),
            terminated: Condvar::new(),
            next_worker: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
        })
    }

    /// Start all core threads up front so the first tasks see a warm pool.
    pub(crate) fn prestart_core_threads(self: &Arc<Self>) -> std::io::Result<()> {
        for _ in 0..self.sizing.core_size {
            self.state.lock().workers += 1;
            if let Err(e) = self.spawn_worker(None) {
                self.worker_gone();
                return Err(e);
            }
        }
        info!(
            pool = %self.name(),
            core = self.sizing.core_size,
            max = self.sizing.max_size,
            queue = ?self.sizing.queue,
            "pool started"
        );
        Ok(())
    }

    pub fn name(&self) -> &str {
        self.factory.cohort().name()
    }

    pub fn class(&self) -> PoolClass {
        self.class
    }

    pub fn cohort(&self) -> &Arc<ThreadCohort> {
        self.factory.cohort()
    }

    pub fn sizing(&self) -> &PoolSizing {
        &self.sizing
    }

    /// Live worker threads.
    pub fn pool_size(&self) -> usize {
        self.state.lock().workers
    }

    /// Threads currently executing a task.
    pub fn active_count(&self) -> usize {
        self.state.lock().running.len()
    }

    /// Tasks waiting in the queue.
    pub fn queued(&self) -> usize {
        self.receiver.len()
    }

    pub fn completed_tasks(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    pub fn is_terminated(&self) -> bool {
        let state = self.state.lock();
        state.shutdown && state.workers == 0
    }

    /// Queue `job`, adding a thread if the queue is full and the pool may grow.
    pub(crate) fn execute(self: &Arc<Self>, job: Job) -> Result<(), Refused> {
        let sender = self.sender.read();
        let Some(sender) = sender.as_ref() else {
            return Err(Refused::Shutdown(job));
        };

        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Disconnected(job)) => Err(Refused::Shutdown(job)),
            Err(TrySendError::Full(job)) => {
                {
                    let mut state = self.state.lock();
                    if state.workers >= self.sizing.max_size {
                        return Err(Refused::Full(job));
                    }
                    state.workers += 1;
                }
                let slot = Arc::new(Mutex::new(Some(job)));
                match self.spawn_worker(Some(Arc::clone(&slot))) {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        error!(pool = %self.name(), error = %e, "failed to add worker thread");
                        self.worker_gone();
                        match slot.lock().take() {
                            Some(job) => Err(Refused::Full(job)),
                            None => Ok(()),
                        }
                    }
                }
            }
        }
    }

    /// Spawn a worker; the caller has already counted it in `workers`.
    fn spawn_worker(self: &Arc<Self>, first: Option<Arc<Mutex<Option<Job>>>>) -> std::io::Result<()> {
        let pool = Arc::clone(self);
        let worker = self.next_worker.fetch_add(1, Ordering::Relaxed);
        self.factory.new_thread(move || {
            let first = first.and_then(|slot| slot.lock().take());
            pool.worker_loop(worker, first);
        })?;
        Ok(())
    }

    fn worker_loop(&self, worker: usize, mut first: Option<Job>) {
        loop {
            let job = match first.take() {
                Some(job) => job,
                None => match self.next_job() {
                    NextJob::Job(job) => job,
                    NextJob::Retire => {
                        debug!(pool = %self.name(), worker, "idle worker retired");
                        self.notify_if_terminated();
                        return;
                    }
                    NextJob::Closed => break,
                },
            };
            self.run_job(worker, job);
        }
        self.worker_gone();
    }

    fn next_job(&self) -> NextJob {
        loop {
            match self.receiver.recv_timeout(self.sizing.keep_alive) {
                Ok(job) => return NextJob::Job(job),
                Err(RecvTimeoutError::Disconnected) => return NextJob::Closed,
                Err(RecvTimeoutError::Timeout) => {
                    let mut state = self.state.lock();
                    if state.workers > self.sizing.core_size {
                        state.workers -= 1;
                        return NextJob::Retire;
                    }
                }
            }
        }
    }

    fn run_job(&self, worker: usize, job: Job) {
        self.state.lock().running.insert(worker, job.control());
        job.run();
        self.state.lock().running.remove(&worker);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    fn worker_gone(&self) {
        let mut state = self.state.lock();
        state.workers = state.workers.saturating_sub(1);
        if state.shutdown && state.workers == 0 {
            self.terminated.notify_all();
        }
    }

    fn notify_if_terminated(&self) {
        let state = self.state.lock();
        if state.shutdown && state.workers == 0 {
            self.terminated.notify_all();
        }
    }

    /// Stop accepting work. Queued tasks still run.
    pub(crate) fn shutdown(&self) {
        let was_open = self.sender.write().take().is_some();
        let mut state = self.state.lock();
        state.shutdown = true;
        if state.workers == 0 {
            self.terminated.notify_all();
        }
        if was_open {
            debug!(pool = %self.name(), queued = self.receiver.len(), "pool closed to new work");
        }
    }

    /// Stop accepting work, discard the queue and cancel running tasks.
    ///
    /// Running tasks have their interrupt flag raised and their futures
    /// completed as cancelled; the threads themselves finish once the task
    /// returns. Returns the discarded jobs (still owned, so the caller
    /// decides how to report them) and the number of tasks interrupted.
    pub(crate) fn shutdown_now(&self) -> (Vec<Job>, usize) {
        self.shutdown();
        let drained: Vec<Job> = self.receiver.try_iter().collect();
        let running: Vec<Arc<dyn TaskControl>> = self.state.lock().running.values().cloned().collect();
        let interrupted = running
            .iter()
            .filter(|control| control.cancel(true) == CancelOutcome::WhileRunning)
            .count();
        (drained, interrupted)
    }

    /// Wait until every worker has exited after shutdown.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !(state.shutdown && state.workers == 0) {
            if self.terminated.wait_until(&mut state, deadline).timed_out() {
                return state.shutdown && state.workers == 0;
            }
        }
        true
    }
}

impl std::fmt::Debug for BackingPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackingPool")
            .field("name", &self.name())
            .field("class", &self.class)
            .field("sizing", &self.sizing)
            .finish()
    }
}
