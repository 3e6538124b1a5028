//! Thread cohorts and per-thread identity.
//!
//! Worker threads record the cohort they belong to in a thread-local when
//! they start. The admission policy reads it back to decide whether a
//! rejected task may borrow the calling thread.

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tidepool_core::PoolClass;

/// A named group of worker threads sharing one pool class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadCohort {
    name: String,
    class: PoolClass,
    wait_capable: bool,
}

impl ThreadCohort {
    pub fn new(name: impl Into<String>, class: PoolClass, wait_capable: bool) -> Self {
        Self {
            name: name.into(),
            class,
            wait_capable,
        }
    }

    /// Cohort for a shared pool class, `<prefix>.<class>`.
    pub fn for_class(prefix: &str, class: PoolClass) -> Self {
        Self::new(format!("{}.{}", prefix, class.as_str()), class, class.wait_capable())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class(&self) -> PoolClass {
        self.class
    }

    /// Whether threads of this cohort may block on work of other pools.
    pub fn wait_capable(&self) -> bool {
        self.wait_capable
    }
}

impl fmt::Display for ThreadCohort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

thread_local! {
    static CURRENT_COHORT: RefCell<Option<Arc<ThreadCohort>>> = const { RefCell::new(None) };
    static CURRENT_TASK: RefCell<Option<Arc<AtomicBool>>> = const { RefCell::new(None) };
}

/// Cohort of the calling thread, `None` for threads no pool created.
pub fn current_cohort() -> Option<Arc<ThreadCohort>> {
    CURRENT_COHORT.with(|c| c.borrow().clone())
}

pub(crate) fn join_cohort(cohort: Arc<ThreadCohort>) {
    CURRENT_COHORT.with(|c| *c.borrow_mut() = Some(cohort));
}

/// Whether the task running on this thread has been asked to stop.
///
/// Threads cannot be killed, so cancellation of running work is
/// cooperative: long-running tasks should poll this and return early.
pub fn is_interrupted() -> bool {
    CURRENT_TASK.with(|c| {
        c.borrow()
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    })
}

/// Marks the interrupt flag of the task executing on this thread until dropped.
///
/// Nests: a task run inline by the admission policy restores the outer
/// task's flag when it finishes.
pub(crate) struct TaskScope {
    prev: Option<Arc<AtomicBool>>,
}

impl TaskScope {
    pub(crate) fn enter(flag: Arc<AtomicBool>) -> Self {
        let prev = CURRENT_TASK.with(|c| c.replace(Some(flag)));
        Self { prev }
    }
}

impl Drop for TaskScope {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT_TASK.with(|c| *c.borrow_mut() = prev);
    }
}
