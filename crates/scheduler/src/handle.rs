//! Scheduler handles: the client-facing view of a backing pool.
//!
//! Handles on a shared pool only see their own tasks: shutting one down never
//! affects work submitted through another handle. A handle created with a
//! concurrency ceiling keeps excess tasks in its own FIFO backlog and feeds
//! them to the pool as its running tasks finish.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tidepool_core::PoolClass;
use tracing::{debug, info, warn};

use crate::admission::{AdmissionOutcome, AdmissionPolicy, RejectionContext};
use crate::cohort::{current_cohort, ThreadCohort};
use crate::error::SchedulerError;
use crate::pool::{BackingPool, Refused};
use crate::registry::HandleRegistry;
use crate::task::{
    next_task_id, panic_message, CancelOutcome, CancelledKind, CancelledTask, Completion, Job,
    TaskControl, TaskError, TaskFuture, TaskId,
};
use crate::timer::{TimerAction, TimerOwner, TriggerEngine};

/// Options for a new scheduler handle.
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    name: Option<String>,
    max_concurrent: Option<usize>,
    shutdown_timeout: Option<Duration>,
    wait_allowed: bool,
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit handle name. Without one the orchestrator's namer picks it.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// At most `n` of this handle's tasks execute at once.
    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = Some(n);
        self
    }

    /// Budget for [`SchedulerHandle::stop`]. Defaults to the orchestrator's
    /// graceful shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    /// Let threads of a custom pool run rejected work inline. Ignored for
    /// shared pool classes.
    pub fn with_wait_allowed(mut self, allowed: bool) -> Self {
        self.wait_allowed = allowed;
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn max_concurrent(&self) -> Option<usize> {
        self.max_concurrent
    }

    pub fn shutdown_timeout(&self) -> Option<Duration> {
        self.shutdown_timeout
    }

    pub fn wait_allowed(&self) -> bool {
        self.wait_allowed
    }
}

/// How a periodic task computes its next fire time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    /// Next run is due one period after the previous run was due.
    FixedRate,
    /// Next run is due one period after the previous run finished.
    FixedDelay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Periodic {
    pub initial_delay: Duration,
    pub period: Duration,
    pub mode: RepeatMode,
}

impl Periodic {
    pub fn fixed_rate(initial_delay: Duration, period: Duration) -> Self {
        Self {
            initial_delay,
            period,
            mode: RepeatMode::FixedRate,
        }
    }

    pub fn fixed_delay(initial_delay: Duration, delay: Duration) -> Self {
        Self {
            initial_delay,
            period: delay,
            mode: RepeatMode::FixedDelay,
        }
    }
}

/// Point-in-time view of one handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerInfo {
    pub name: String,
    pub pool_class: PoolClass,
    pub pool: String,
    pub dedicated: bool,
    pub max_concurrent: Option<usize>,
    /// Tasks executing right now.
    pub active: usize,
    /// Tasks waiting behind the concurrency ceiling.
    pub backlog: usize,
    /// Submitted tasks that have not completed.
    pub outstanding: usize,
    /// One-shot timers waiting to fire.
    pub pending_timers: usize,
    pub shutdown: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Caller,
    Timer,
}

struct Throttle {
    ceiling: usize,
    running: usize,
    backlog: VecDeque<Job>,
}

#[derive(Default)]
struct Tracking {
    tasks: HashMap<TaskId, Arc<dyn TaskControl>>,
    /// One-shot timers scheduled but not yet fired or discarded.
    timers: usize,
}

impl Tracking {
    fn idle(&self) -> bool {
        self.tasks.is_empty() && self.timers == 0
    }
}

/// Wait before a backlogged task refused by a busy pool is offered again.
const BACKLOG_RETRY: Duration = Duration::from_millis(10);

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) type ShutdownTimeout = Arc<dyn Fn() -> Duration + Send + Sync>;

/// Everything the orchestrator decides about a handle before creating it.
pub(crate) struct HandleParts {
    pub name: String,
    pub pool: Arc<BackingPool>,
    /// The handle owns `pool` and closes it on shutdown.
    pub dedicated: bool,
    pub engine: TriggerEngine,
    pub policy: Arc<dyn AdmissionPolicy>,
    pub registry: Weak<HandleRegistry>,
    pub max_concurrent: Option<usize>,
    pub shutdown_timeout: ShutdownTimeout,
    pub on_pool_closed: Option<Box<dyn FnOnce() + Send>>,
}

struct HandleInner {
    name: Arc<str>,
    /// Key of this handle's trigger engine entries.
    owner: TimerOwner,
    pool: Arc<BackingPool>,
    dedicated: bool,
    engine: TriggerEngine,
    policy: Arc<dyn AdmissionPolicy>,
    registry: Weak<HandleRegistry>,
    shutdown_timeout: ShutdownTimeout,
    alive: AtomicBool,
    active: Arc<AtomicUsize>,
    throttle: Option<Mutex<Throttle>>,
    tracking: Mutex<Tracking>,
    idle: Condvar,
    periodic: Mutex<Vec<Arc<PeriodicTask>>>,
    on_pool_closed: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

/// Client view of a backing pool. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SchedulerHandle {
    inner: Arc<HandleInner>,
}

impl SchedulerHandle {
    pub(crate) fn new(parts: HandleParts) -> Self {
        let throttle = parts.max_concurrent.map(|ceiling| {
            Mutex::new(Throttle {
                ceiling,
                running: 0,
                backlog: VecDeque::new(),
            })
        });
        let name: Arc<str> = Arc::from(parts.name);
        let owner = TimerOwner {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            name: Arc::clone(&name),
        };
        Self {
            inner: Arc::new(HandleInner {
                name,
                owner,
                pool: parts.pool,
                dedicated: parts.dedicated,
                engine: parts.engine,
                policy: parts.policy,
                registry: parts.registry,
                shutdown_timeout: parts.shutdown_timeout,
                alive: AtomicBool::new(true),
                active: Arc::new(AtomicUsize::new(0)),
                throttle,
                tracking: Mutex::new(Tracking::default()),
                idle: Condvar::new(),
                periodic: Mutex::new(Vec::new()),
                on_pool_closed: Mutex::new(parts.on_pool_closed),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn pool_class(&self) -> PoolClass {
        self.inner.pool.class()
    }

    /// Name of the backing pool, e.g. `tidepool.io`.
    pub fn pool_name(&self) -> &str {
        self.inner.pool.name()
    }

    pub fn max_concurrent(&self) -> Option<usize> {
        self.inner.throttle.as_ref().map(|t| t.lock().ceiling)
    }

    /// Live threads of the backing pool.
    pub fn pool_size(&self) -> usize {
        self.inner.pool.pool_size()
    }

    /// This handle's tasks executing right now.
    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        !self.inner.alive.load(Ordering::Acquire)
    }

    /// Shut down, with every submitted task and timer finished or discarded.
    pub fn is_terminated(&self) -> bool {
        self.is_shutdown()
            && self.inner.tracking.lock().idle()
            && (!self.inner.dedicated || self.inner.pool.is_terminated())
    }

    pub(crate) fn same_handle(&self, other: &SchedulerHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn backing_pool(&self) -> &Arc<BackingPool> {
        &self.inner.pool
    }

    pub fn info(&self) -> SchedulerInfo {
        let (outstanding, pending_timers) = {
            let tracking = self.inner.tracking.lock();
            (tracking.tasks.len(), tracking.timers)
        };
        SchedulerInfo {
            name: self.name().to_string(),
            pool_class: self.pool_class(),
            pool: self.pool_name().to_string(),
            dedicated: self.inner.dedicated,
            max_concurrent: self.max_concurrent(),
            active: self.active_count(),
            backlog: self
                .inner
                .throttle
                .as_ref()
                .map_or(0, |t| t.lock().backlog.len()),
            outstanding,
            pending_timers,
            shutdown: self.is_shutdown(),
        }
    }

    // ── Submission ───────────────────────────────────────────

    /// Run `f` on the backing pool.
    ///
    /// Fails with [`SchedulerError::Rejected`] when the pool is saturated and
    /// the admission policy refuses to run the task on the calling thread.
    pub fn submit<F, T>(&self, f: F) -> Result<TaskFuture<T>, SchedulerError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.inner.ensure_alive()?;
        let (mut job, future) = self.inner.job(f);
        self.inner.track(&mut job);
        self.inner.admit(job, Origin::Caller)?;
        Ok(future)
    }

    /// Fire-and-forget form of [`submit`](Self::submit).
    pub fn execute<F>(&self, f: F) -> Result<(), SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(f).map(drop)
    }

    /// Run `f` once at `when`.
    pub fn schedule_at<F, T>(&self, f: F, when: Instant) -> Result<ScheduledTask<T>, SchedulerError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.inner.timer_guard()?;
        let runs = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&runs);
        let (mut job, future) = self.inner.job(move || {
            counter.fetch_add(1, Ordering::Relaxed);
            f()
        });
        self.inner.track(&mut job);
        let id = job.id();

        let handle = Arc::downgrade(&self.inner);
        let action: TimerAction = Box::new(move || {
            if let Some(inner) = handle.upgrade() {
                if let Err(e) = inner.admit(job, Origin::Timer) {
                    warn!(scheduler = %inner.name, task = id, error = %e, "delayed task dropped at fire time");
                }
            }
            drop(guard);
        });
        if self
            .inner
            .engine
            .schedule(when, Some(id), self.inner.owner.clone(), action)
            .is_err()
        {
            return Err(self.inner.stopped());
        }

        debug!(scheduler = %self.name(), task = id, "one-shot timer scheduled");
        Ok(ScheduledTask {
            id,
            future,
            engine: self.inner.engine.clone(),
            runs,
            periodic: None,
        })
    }

    /// Run `f` once after `delay`.
    pub fn schedule_after<F, T>(&self, f: F, delay: Duration) -> Result<ScheduledTask<T>, SchedulerError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.schedule_at(f, Instant::now() + delay)
    }

    /// Run `f` repeatedly until cancelled, the handle shuts down, or a run
    /// panics. Runs of one task never overlap.
    pub fn schedule_every<F>(&self, f: F, schedule: Periodic) -> Result<ScheduledTask<()>, SchedulerError>
    where
        F: FnMut() + Send + 'static,
    {
        if schedule.period.is_zero() {
            return Err(SchedulerError::InvalidArgument(
                "periodic task needs a non-zero period".to_string(),
            ));
        }
        self.inner.ensure_alive()?;

        let id = next_task_id();
        let completion = Arc::new(Completion::new(id));
        completion.begin();
        let task = Arc::new(PeriodicTask {
            id,
            completion: Arc::clone(&completion),
            body: Mutex::new(Box::new(f)),
            schedule,
            runs: Arc::new(AtomicU64::new(0)),
            cancelled: AtomicBool::new(false),
        });
        {
            let mut periodic = self.inner.periodic.lock();
            periodic.retain(|t| !t.is_stopped());
            periodic.push(Arc::clone(&task));
        }

        if !self.inner.arm(&task, Instant::now() + schedule.initial_delay) {
            return Err(self.inner.stopped());
        }
        debug!(scheduler = %self.name(), task = id, mode = ?schedule.mode, period = ?schedule.period, "periodic task scheduled");
        Ok(ScheduledTask {
            id,
            future: TaskFuture::new(completion),
            engine: self.inner.engine.clone(),
            runs: Arc::clone(&task.runs),
            periodic: Some(task),
        })
    }

    // ── Shutdown ─────────────────────────────────────────────

    /// Stop accepting work and stop periodic repetition. Tasks already
    /// submitted and one-shot timers already scheduled still run.
    pub fn shutdown(&self) {
        let close_pool = {
            let tracking = self.inner.tracking.lock();
            if !self.inner.alive.swap(false, Ordering::AcqRel) {
                return;
            }
            self.inner.dedicated && tracking.timers == 0
        };
        self.inner.cancel_periodic();
        if let Some(registry) = self.inner.registry.upgrade() {
            registry.unregister(self);
        }
        if close_pool {
            self.inner.close_pool();
        }
        info!(scheduler = %self.name(), pool = %self.pool_name(), "scheduler shut down");
    }

    /// Shut down, discard every task of this handle that has not started and
    /// interrupt the ones that have. Returns the discarded tasks.
    pub fn shutdown_now(&self) -> Vec<CancelledTask> {
        self.shutdown();
        let inner = &self.inner;

        let mut cancelled = inner.engine.remove_owner(inner.owner.id);
        cancelled.extend(inner.discard_backlog());
        if inner.dedicated {
            inner.close_pool();
            let (drained, _) = inner.pool.shutdown_now();
            cancelled.extend(drained.into_iter().map(|job| job.cancel(CancelledKind::Queued)));
        }

        let controls: Vec<Arc<dyn TaskControl>> = inner.tracking.lock().tasks.values().cloned().collect();
        let mut interrupted = 0;
        let mut not_started = Vec::new();
        for control in controls {
            match control.cancel(true) {
                CancelOutcome::NotStarted => not_started.push(control.id()),
                CancelOutcome::WhileRunning => interrupted += 1,
                CancelOutcome::AlreadyDone => {}
            }
        }
        {
            let mut tracking = inner.tracking.lock();
            for id in &not_started {
                tracking.tasks.remove(id);
            }
            if tracking.idle() {
                inner.idle.notify_all();
            }
        }
        cancelled.extend(not_started.into_iter().map(|id| CancelledTask {
            id,
            scheduler: inner.name.to_string(),
            kind: CancelledKind::Queued,
        }));

        info!(
            scheduler = %self.name(),
            cancelled = cancelled.len(),
            interrupted,
            "scheduler shut down now"
        );
        cancelled
    }

    /// Graceful stop: shut down, wait up to the handle's shutdown timeout,
    /// then cancel whatever is left.
    pub fn stop(&self) -> Vec<CancelledTask> {
        self.shutdown();
        let timeout = (self.inner.shutdown_timeout)();
        if self.await_termination(timeout) {
            return Vec::new();
        }
        warn!(scheduler = %self.name(), ?timeout, "scheduler did not finish in time, cancelling");
        self.shutdown_now()
    }

    /// Block until the handle is terminated or `timeout` passes.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        {
            let mut tracking = self.inner.tracking.lock();
            while !tracking.idle() {
                if self.inner.idle.wait_until(&mut tracking, deadline).timed_out() {
                    if !tracking.idle() {
                        return false;
                    }
                    break;
                }
            }
        }
        if self.inner.dedicated {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !self.inner.pool.await_termination(remaining) {
                return false;
            }
        }
        self.is_shutdown()
    }

    /// Drop this handle's backlog without running it. Used when its pool is
    /// being cancelled.
    pub(crate) fn discard_backlog(&self) -> Vec<CancelledTask> {
        self.inner.discard_backlog()
    }
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("name", &self.inner.name)
            .field("pool", &self.inner.pool.name())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl HandleInner {
    fn stopped(&self) -> SchedulerError {
        SchedulerError::Stopped {
            scheduler: self.name.to_string(),
        }
    }

    fn ensure_alive(&self) -> Result<(), SchedulerError> {
        if self.alive.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(self.stopped())
        }
    }

    fn job<F, T>(&self, f: F) -> (Job, TaskFuture<T>)
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let active = Arc::clone(&self.active);
        Job::new(Arc::clone(&self.name), move || {
            let _running = ActiveGuard::enter(active);
            f()
        })
    }

    fn track(self: &Arc<Self>, job: &mut Job) {
        let id = job.id();
        self.tracking.lock().tasks.insert(id, job.control());
        let handle = Arc::downgrade(self);
        job.on_done(move || {
            if let Some(inner) = handle.upgrade() {
                inner.untrack(id);
            }
        });
    }

    fn untrack(&self, id: TaskId) {
        let mut tracking = self.tracking.lock();
        tracking.tasks.remove(&id);
        if tracking.idle() {
            self.idle.notify_all();
        }
    }

    /// Count a one-shot timer. Fails once the handle is shut down.
    fn timer_guard(self: &Arc<Self>) -> Result<TimerGuard, SchedulerError> {
        let mut tracking = self.tracking.lock();
        self.ensure_alive()?;
        tracking.timers += 1;
        Ok(TimerGuard {
            handle: Arc::downgrade(self),
        })
    }

    fn timer_done(&self) {
        let close_pool = {
            let mut tracking = self.tracking.lock();
            tracking.timers = tracking.timers.saturating_sub(1);
            if tracking.idle() {
                self.idle.notify_all();
            }
            tracking.timers == 0 && self.dedicated && !self.alive.load(Ordering::Acquire)
        };
        if close_pool {
            self.close_pool();
        }
    }

    /// Pass `job` through the throttle to the pool.
    fn admit(self: &Arc<Self>, mut job: Job, origin: Origin) -> Result<(), SchedulerError> {
        if let Some(throttle) = &self.throttle {
            let mut throttle = throttle.lock();
            // A non-empty backlog with a free slot is waiting on a retry; queue behind it.
            if throttle.running >= throttle.ceiling || !throttle.backlog.is_empty() {
                throttle.backlog.push_back(job);
                return Ok(());
            }
            throttle.running += 1;
            drop(throttle);
            self.hold_slot(&mut job);
        }
        self.dispatch(job, origin)
    }

    fn dispatch(&self, job: Job, origin: Origin) -> Result<(), SchedulerError> {
        let job = match self.pool.execute(job) {
            Ok(()) => return Ok(()),
            Err(Refused::Shutdown(_)) => return Err(self.stopped()),
            Err(Refused::Full(job)) => job,
        };

        // Timer hand-offs never borrow the dispatcher thread.
        let outcome = match origin {
            Origin::Timer => AdmissionOutcome::Reject,
            Origin::Caller => {
                let caller = current_cohort();
                self.policy.on_rejected(&RejectionContext {
                    scheduler: &self.name,
                    pool: self.pool.name(),
                    pool_class: self.pool.class(),
                    caller: caller.as_deref(),
                })
            }
        };
        match outcome {
            AdmissionOutcome::ExecuteInline => {
                debug!(scheduler = %self.name, task = job.id(), "pool saturated, running on caller thread");
                job.run();
                Ok(())
            }
            AdmissionOutcome::Reject => {
                debug!(scheduler = %self.name, task = job.id(), "pool saturated, task rejected");
                Err(SchedulerError::Rejected {
                    scheduler: self.name.to_string(),
                    pool: self.pool.name().to_string(),
                })
            }
        }
    }

    /// Give the throttle slot back when `job` completes or is discarded.
    /// Clearing the returned flag keeps the slot with the caller.
    fn hold_slot(self: &Arc<Self>, job: &mut Job) -> Arc<AtomicBool> {
        let armed = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&armed);
        let handle = Arc::downgrade(self);
        job.on_done(move || {
            if flag.load(Ordering::Acquire) {
                if let Some(inner) = handle.upgrade() {
                    inner.release_slot();
                }
            }
        });
        armed
    }

    /// Hand a freed slot to the oldest backlogged task, or give it up.
    ///
    /// A backlogged task the pool refuses only runs on this thread if it is
    /// a worker of the handle's own pool or the admission policy lets it
    /// borrow. Otherwise the task goes back to the head of the backlog and
    /// the trigger engine offers it to the pool again shortly.
    fn release_slot(self: &Arc<Self>) {
        let Some(throttle) = &self.throttle else {
            return;
        };
        loop {
            let mut job = {
                let mut throttle = throttle.lock();
                match throttle.backlog.pop_front() {
                    Some(job) => job,
                    None => {
                        throttle.running = throttle.running.saturating_sub(1);
                        return;
                    }
                }
            };
            let armed = self.hold_slot(&mut job);
            let (job, closed) = match self.pool.execute(job) {
                Ok(()) => return,
                Err(Refused::Full(job)) => (job, false),
                Err(Refused::Shutdown(job)) => (job, true),
            };
            // Keep the slot with this loop while deciding where the task goes.
            armed.store(false, Ordering::Release);

            if self.may_borrow_current_thread() {
                debug!(scheduler = %self.name, task = job.id(), "pool refused backlogged task, running it on releasing worker");
                job.run();
                continue;
            }
            if closed {
                debug!(scheduler = %self.name, task = job.id(), "pool closed, backlogged task cancelled");
                drop(job);
                continue;
            }
            {
                let mut throttle = throttle.lock();
                throttle.backlog.push_front(job);
                throttle.running = throttle.running.saturating_sub(1);
            }
            self.retry_backlog_later();
            return;
        }
    }

    /// Whether a backlogged task may run on the calling thread. Workers of
    /// this handle's pool may; the trigger engine's dispatcher never does;
    /// anyone else only with the admission policy's consent.
    fn may_borrow_current_thread(&self) -> bool {
        let Some(caller) = current_cohort() else {
            return false;
        };
        if caller.class() == PoolClass::Timer {
            return false;
        }
        if same_cohort(&caller, self.pool.cohort()) {
            return true;
        }
        self.policy.on_rejected(&RejectionContext {
            scheduler: &self.name,
            pool: self.pool.name(),
            pool_class: self.pool.class(),
            caller: Some(&*caller),
        }) == AdmissionOutcome::ExecuteInline
    }

    fn retry_backlog_later(self: &Arc<Self>) {
        let handle = Arc::downgrade(self);
        let action: TimerAction = Box::new(move || {
            if let Some(inner) = handle.upgrade() {
                inner.pump_backlog();
            }
        });
        let due = Instant::now() + BACKLOG_RETRY;
        if self.engine.schedule(due, None, self.owner.clone(), action).is_err() {
            debug!(scheduler = %self.name, "trigger engine stopped, backlog left for shutdown");
        }
    }

    /// Take a free slot, if any, and offer it to the backlog.
    fn pump_backlog(self: &Arc<Self>) {
        let Some(throttle) = &self.throttle else {
            return;
        };
        {
            let mut throttle = throttle.lock();
            if throttle.running >= throttle.ceiling || throttle.backlog.is_empty() {
                return;
            }
            throttle.running += 1;
        }
        self.release_slot();
    }

    fn discard_backlog(&self) -> Vec<CancelledTask> {
        let backlog = match &self.throttle {
            Some(throttle) => std::mem::take(&mut throttle.lock().backlog),
            None => return Vec::new(),
        };
        backlog
            .into_iter()
            .map(|job| job.cancel(CancelledKind::Queued))
            .collect()
    }

    /// Put the next run of `task` on the trigger engine.
    fn arm(self: &Arc<Self>, task: &Arc<PeriodicTask>, due: Instant) -> bool {
        let handle = Arc::downgrade(self);
        let fired = Arc::clone(task);
        let action: TimerAction = Box::new(move || {
            let Some(inner) = handle.upgrade() else {
                fired.stop();
                return;
            };
            if fired.is_stopped() {
                return;
            }
            let runner = Arc::clone(&fired);
            let (mut job, _) = inner.job(move || runner.run_once());
            inner.track(&mut job);

            let rearm = Arc::downgrade(&inner);
            let next = Arc::clone(&fired);
            job.on_done(move || {
                let Some(inner) = rearm.upgrade() else {
                    return;
                };
                if next.is_stopped() || !inner.alive.load(Ordering::Acquire) {
                    return;
                }
                let at = match next.schedule.mode {
                    RepeatMode::FixedRate => due + next.schedule.period,
                    RepeatMode::FixedDelay => Instant::now() + next.schedule.period,
                };
                inner.arm(&next, at);
            });

            if let Err(e) = inner.admit(job, Origin::Timer) {
                warn!(scheduler = %inner.name, task = fired.id, error = %e, "periodic run skipped");
            }
        });

        match self.engine.schedule(due, Some(task.id), self.owner.clone(), action) {
            Ok(()) => true,
            Err(_) => {
                task.stop();
                false
            }
        }
    }

    fn cancel_periodic(&self) {
        let tasks = std::mem::take(&mut *self.periodic.lock());
        for task in tasks {
            task.stop();
            self.engine.remove(task.id);
        }
    }

    fn close_pool(&self) {
        self.pool.shutdown();
        let hook = self.on_pool_closed.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

fn same_cohort(a: &Arc<ThreadCohort>, b: &Arc<ThreadCohort>) -> bool {
    Arc::ptr_eq(a, b) || a.name() == b.name()
}

/// Keeps a handle's timer count up while a one-shot timer is pending.
struct TimerGuard {
    handle: Weak<HandleInner>,
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.handle.upgrade() {
            inner.timer_done();
        }
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

struct PeriodicTask {
    id: TaskId,
    /// Outcome of the whole repetition: pending until cancelled or a run panics.
    completion: Arc<Completion<()>>,
    body: Mutex<Box<dyn FnMut() + Send>>,
    schedule: Periodic,
    runs: Arc<AtomicU64>,
    cancelled: AtomicBool,
}

impl PeriodicTask {
    fn run_once(&self) {
        if self.is_stopped() {
            return;
        }
        self.runs.fetch_add(1, Ordering::Relaxed);
        let mut body = self.body.lock();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(&mut **body)) {
            self.completion
                .finish(Err(TaskError::Panicked(panic_message(payload.as_ref()))));
        }
    }

    fn stop(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.completion.cancel(false);
    }

    fn is_stopped(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.completion.is_done()
    }
}

/// A one-shot or periodic task held by the trigger engine.
pub struct ScheduledTask<T> {
    id: TaskId,
    future: TaskFuture<T>,
    engine: TriggerEngine,
    runs: Arc<AtomicU64>,
    periodic: Option<Arc<PeriodicTask>>,
}

impl<T: Send + 'static> ScheduledTask<T> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Cancel future executions. A run already in progress completes.
    /// Returns false if the task had already finished.
    pub fn cancel(&self) -> bool {
        let cancelled = self.future.cancel(false);
        if let Some(task) = &self.periodic {
            task.cancelled.store(true, Ordering::Release);
        }
        self.engine.remove(self.id);
        cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        self.future.is_cancelled()
    }

    pub fn is_done(&self) -> bool {
        self.future.is_done()
    }

    /// Executions started so far.
    pub fn run_count(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.future.wait_timeout(timeout)
    }

    /// Block until the task completes. A periodic task only completes by
    /// cancellation or a panicking run, so this yields its error.
    pub fn get(self) -> Result<T, TaskError> {
        self.future.get()
    }

    pub fn get_timeout(self, timeout: Duration) -> Result<T, TaskError> {
        self.future.get_timeout(timeout)
    }
}

impl<T> std::fmt::Debug for ScheduledTask<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("id", &self.id)
            .field("periodic", &self.periodic.is_some())
            .field("runs", &self.runs.load(Ordering::Relaxed))
            .finish()
    }
}
