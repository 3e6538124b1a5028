//! Units of work and their completion handles.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use thiserror::Error;

use crate::cohort::TaskScope;

/// Process-unique task identifier.
pub type TaskId = u64;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_task_id() -> TaskId {
    NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)
}

/// Why a task did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task was cancelled")]
    Cancelled,

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("timed out waiting for task result")]
    Timeout,
}

/// Where a cancelled task was when it was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelledKind {
    /// Waiting in a pool queue or a throttle backlog.
    Queued,
    /// Waiting in the trigger engine for its fire time.
    Delayed,
}

/// A task that was discarded before it started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelledTask {
    pub id: TaskId,
    pub scheduler: String,
    pub kind: CancelledKind,
}

impl fmt::Display for CancelledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task #{} of `{}` ({:?})", self.id, self.scheduler, self.kind)
    }
}

/// Result of asking a task to cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelOutcome {
    NotStarted,
    WhileRunning,
    AlreadyDone,
}

/// Type-erased view of a task's completion state.
pub(crate) trait TaskControl: Send + Sync {
    fn id(&self) -> TaskId;

    /// Pending -> running. False if the task was cancelled first.
    fn begin(&self) -> bool;

    fn cancel(&self, interrupt: bool) -> CancelOutcome;

    fn interrupt_flag(&self) -> Arc<AtomicBool>;

    fn is_done(&self) -> bool;
}

enum Slot<T> {
    Pending,
    Running,
    Done(Result<T, TaskError>),
    Taken,
}

pub(crate) struct Completion<T> {
    id: TaskId,
    interrupted: Arc<AtomicBool>,
    slot: Mutex<Slot<T>>,
    done: Condvar,
}

impl<T> Completion<T> {
    pub(crate) fn new(id: TaskId) -> Self {
        Self {
            id,
            interrupted: Arc::new(AtomicBool::new(false)),
            slot: Mutex::new(Slot::Pending),
            done: Condvar::new(),
        }
    }

    /// Record the task's outcome. Ignored if it was cancelled meanwhile.
    pub(crate) fn finish(&self, result: Result<T, TaskError>) {
        let mut slot = self.slot.lock();
        if matches!(*slot, Slot::Running) {
            *slot = Slot::Done(result);
            self.done.notify_all();
        }
    }

    fn take(&self, deadline: Option<Instant>) -> Result<T, TaskError> {
        let mut slot = self.slot.lock();
        loop {
            if matches!(*slot, Slot::Done(_)) {
                return match std::mem::replace(&mut *slot, Slot::Taken) {
                    Slot::Done(result) => result,
                    _ => unreachable!("slot checked as done"),
                };
            }
            match deadline {
                Some(deadline) => {
                    if self.done.wait_until(&mut slot, deadline).timed_out()
                        && !matches!(*slot, Slot::Done(_))
                    {
                        return Err(TaskError::Timeout);
                    }
                }
                None => self.done.wait(&mut slot),
            }
        }
    }
}

impl<T: Send + 'static> TaskControl for Completion<T> {
    fn id(&self) -> TaskId {
        self.id
    }

    fn begin(&self) -> bool {
        let mut slot = self.slot.lock();
        if matches!(*slot, Slot::Pending) {
            *slot = Slot::Running;
            true
        } else {
            false
        }
    }

    fn cancel(&self, interrupt: bool) -> CancelOutcome {
        let mut slot = self.slot.lock();
        let outcome = match *slot {
            Slot::Pending => CancelOutcome::NotStarted,
            Slot::Running => {
                if interrupt {
                    self.interrupted.store(true, Ordering::Release);
                }
                CancelOutcome::WhileRunning
            }
            Slot::Done(_) | Slot::Taken => return CancelOutcome::AlreadyDone,
        };
        *slot = Slot::Done(Err(TaskError::Cancelled));
        self.done.notify_all();
        outcome
    }

    fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    fn is_done(&self) -> bool {
        matches!(*self.slot.lock(), Slot::Done(_) | Slot::Taken)
    }
}

/// Handle to the eventual result of a submitted task.
pub struct TaskFuture<T> {
    completion: Arc<Completion<T>>,
}

impl<T: Send + 'static> TaskFuture<T> {
    pub(crate) fn new(completion: Arc<Completion<T>>) -> Self {
        Self { completion }
    }

    pub fn id(&self) -> TaskId {
        self.completion.id
    }

    /// Block until the task finishes.
    pub fn get(self) -> Result<T, TaskError> {
        self.completion.take(None)
    }

    /// Block for at most `timeout`.
    pub fn get_timeout(self, timeout: Duration) -> Result<T, TaskError> {
        self.completion.take(Some(Instant::now() + timeout))
    }

    /// Wait up to `timeout` for completion without consuming the result.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self.completion.slot.lock();
        while matches!(*slot, Slot::Pending | Slot::Running) {
            if self.completion.done.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        !matches!(*slot, Slot::Pending | Slot::Running)
    }

    /// Cancel the task. A queued task will never run; a running one has its
    /// interrupt flag raised when `interrupt` is set.
    pub fn cancel(&self, interrupt: bool) -> bool {
        self.completion.cancel(interrupt) != CancelOutcome::AlreadyDone
    }

    pub fn is_done(&self) -> bool {
        self.completion.is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.completion.slot.lock(), Slot::Done(Err(TaskError::Cancelled)))
    }
}

impl<T> fmt::Debug for TaskFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFuture").field("id", &self.completion.id).finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

type Hook = Box<dyn FnOnce() + Send>;

/// A pending unit of work, owned by whichever queue currently holds it.
///
/// Dropping a job that never ran completes its future as cancelled, so a
/// task can never vanish without its submitter finding out. `on_done` hooks
/// run exactly once, whether the job ran or was discarded.
pub(crate) struct Job {
    id: TaskId,
    scheduler: Arc<str>,
    control: Arc<dyn TaskControl>,
    body: Option<Hook>,
    on_done: Vec<Hook>,
}

impl Job {
    pub(crate) fn new<F, T>(scheduler: Arc<str>, f: F) -> (Job, TaskFuture<T>)
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let id = next_task_id();
        let completion = Arc::new(Completion::new(id));
        let result = Arc::clone(&completion);
        let body: Hook = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(f))
                .map_err(|payload| TaskError::Panicked(panic_message(payload.as_ref())));
            result.finish(outcome);
        });
        let control: Arc<dyn TaskControl> = completion.clone();
        let job = Job {
            id,
            scheduler,
            control,
            body: Some(body),
            on_done: Vec::new(),
        };
        (job, TaskFuture::new(completion))
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn control(&self) -> Arc<dyn TaskControl> {
        Arc::clone(&self.control)
    }

    pub(crate) fn on_done(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.on_done.push(Box::new(hook));
    }

    /// Run on the current thread, unless the task was cancelled while queued.
    pub(crate) fn run(mut self) {
        if let Some(body) = self.body.take() {
            if self.control.begin() {
                let _scope = TaskScope::enter(self.control.interrupt_flag());
                body();
            }
        }
    }

    /// Discard without running and describe what was discarded.
    pub(crate) fn cancel(self, kind: CancelledKind) -> CancelledTask {
        CancelledTask {
            id: self.id,
            scheduler: self.scheduler.to_string(),
            kind,
        }
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        if self.body.take().is_some() {
            self.control.cancel(false);
        }
        for hook in self.on_done.drain(..) {
            hook();
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}
