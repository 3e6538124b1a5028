//! Shared trigger engine for delayed and periodic work.
//!
//! One dispatcher thread sleeps until the earliest due entry, pops it and runs
//! its action. Actions only hand work off to a scheduler handle, so a slow
//! task never holds up the timers behind it.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info};

use crate::task::{panic_message, CancelledKind, CancelledTask, TaskId};
use crate::thread_factory::NamedThreadFactory;

pub(crate) type TimerAction = Box<dyn FnOnce() + Send>;

/// The scheduler handle an entry belongs to. `id` is unique per handle;
/// names may repeat.
#[derive(Debug, Clone)]
pub(crate) struct TimerOwner {
    pub id: u64,
    pub name: Arc<str>,
}

struct Entry {
    due: Instant,
    seq: u64,
    /// `None` for housekeeping entries, which are never reported as
    /// cancelled work.
    task: Option<TaskId>,
    owner: TimerOwner,
    action: TimerAction,
}

impl Entry {
    fn cancelled(&self) -> Option<CancelledTask> {
        self.task.map(|id| CancelledTask {
            id,
            scheduler: self.owner.name.to_string(),
            kind: CancelledKind::Delayed,
        })
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

// Reversed so the max-heap pops the earliest due entry, ties in arrival order.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct EngineState {
    heap: BinaryHeap<Entry>,
    seq: u64,
    shutdown: bool,
    terminated: bool,
    fired: u64,
}

struct EngineInner {
    name: String,
    state: Mutex<EngineState>,
    wakeup: Condvar,
    terminated: Condvar,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Min-heap of timed actions drained by one dispatcher thread.
#[derive(Clone)]
pub struct TriggerEngine {
    inner: Arc<EngineInner>,
}

impl TriggerEngine {
    /// Start the dispatcher on a thread from `factory`.
    pub(crate) fn start(factory: &NamedThreadFactory) -> std::io::Result<Self> {
        let inner = Arc::new(EngineInner {
            name: factory.cohort().name().to_string(),
            state: Mutex::new(EngineState::default()),
            wakeup: Condvar::new(),
            terminated: Condvar::new(),
            dispatcher: Mutex::new(None),
        });
        let worker = Arc::clone(&inner);
        let handle = factory.new_thread(move || dispatch(worker))?;
        *inner.dispatcher.lock() = Some(handle);
        info!(engine = %inner.name, "trigger engine started");
        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Queue `action` to run at `due`. Hands the action back if the engine
    /// has been shut down.
    pub(crate) fn schedule(
        &self,
        due: Instant,
        task: Option<TaskId>,
        owner: TimerOwner,
        action: TimerAction,
    ) -> Result<(), TimerAction> {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return Err(action);
        }
        state.seq += 1;
        let seq = state.seq;
        let earliest = state.heap.peek().map_or(true, |head| due < head.due);
        state.heap.push(Entry {
            due,
            seq,
            task,
            owner,
            action,
        });
        if earliest {
            self.inner.wakeup.notify_one();
        }
        Ok(())
    }

    /// Drop the pending entry for `id`, if any.
    pub(crate) fn remove(&self, id: TaskId) -> bool {
        let removed = self.take_where(|entry| entry.task == Some(id));
        !removed.is_empty()
    }

    /// Drop every pending entry of one handle.
    pub(crate) fn remove_owner(&self, owner: u64) -> Vec<CancelledTask> {
        let removed = self.take_where(|entry| entry.owner.id == owner);
        removed.iter().filter_map(Entry::cancelled).collect()
    }

    /// Remove matching entries under the lock; their actions are dropped by
    /// the caller once the lock is released.
    fn take_where(&self, mut pred: impl FnMut(&Entry) -> bool) -> Vec<Entry> {
        let mut state = self.inner.state.lock();
        let (removed, kept): (Vec<Entry>, Vec<Entry>) =
            std::mem::take(&mut state.heap).into_iter().partition(|e| pred(e));
        state.heap = kept.into();
        removed
    }

    /// Stop the dispatcher. Entries that have not fired are discarded and
    /// returned in due order.
    pub(crate) fn shutdown(&self) -> Vec<CancelledTask> {
        let pending = {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            self.inner.wakeup.notify_all();
            std::mem::take(&mut state.heap).into_sorted_vec()
        };
        // Sorted ascending by `Ord`, which is reversed: latest first.
        let cancelled: Vec<CancelledTask> = pending.iter().rev().filter_map(Entry::cancelled).collect();
        if !cancelled.is_empty() {
            debug!(engine = %self.inner.name, discarded = cancelled.len(), "discarded pending timers");
        }
        drop(pending);
        cancelled
    }

    /// Wait for the dispatcher thread to exit after shutdown.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        {
            let mut state = self.inner.state.lock();
            while !state.terminated {
                if self.inner.terminated.wait_until(&mut state, deadline).timed_out() {
                    if !state.terminated {
                        return false;
                    }
                    break;
                }
            }
        }
        if let Some(handle) = self.inner.dispatcher.lock().take() {
            if handle.join().is_err() {
                error!(engine = %self.inner.name, "trigger dispatcher panicked");
            }
        }
        true
    }

    /// Entries waiting to fire.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().heap.len()
    }

    /// Entries fired so far.
    pub fn fired(&self) -> u64 {
        self.inner.state.lock().fired
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().shutdown
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.state.lock().terminated
    }
}

impl std::fmt::Debug for TriggerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerEngine")
            .field("name", &self.inner.name)
            .field("pending", &self.pending())
            .finish()
    }
}

fn dispatch(inner: Arc<EngineInner>) {
    let mut state = inner.state.lock();
    while !state.shutdown {
        let now = Instant::now();
        match state.heap.peek().map(|head| head.due) {
            None => inner.wakeup.wait(&mut state),
            Some(due) if due > now => {
                inner.wakeup.wait_until(&mut state, due);
            }
            Some(_) => {
                if let Some(entry) = state.heap.pop() {
                    state.fired += 1;
                    MutexGuard::unlocked(&mut state, || fire(&inner.name, entry));
                }
            }
        }
    }
    state.terminated = true;
    inner.terminated.notify_all();
    debug!(engine = %inner.name, "trigger dispatcher exited");
}

fn fire(engine: &str, entry: Entry) {
    let Entry {
        task,
        owner,
        action,
        ..
    } = entry;
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(action)) {
        error!(
            engine = %engine,
            task = ?task,
            scheduler = %owner.name,
            panic = %panic_message(payload.as_ref()),
            "timer action panicked"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    use tidepool_core::PoolClass;

    use super::*;
    use crate::cohort::{current_cohort, ThreadCohort};
    use crate::task::next_task_id;

    fn engine() -> TriggerEngine {
        let factory = NamedThreadFactory::new(Arc::new(ThreadCohort::for_class("test", PoolClass::Timer)));
        TriggerEngine::start(&factory).unwrap()
    }

    fn owner() -> TimerOwner {
        TimerOwner {
            id: 1,
            name: Arc::from("timers"),
        }
    }

    #[test]
    fn fires_in_due_order() {
        let engine = engine();
        let (tx, rx) = mpsc::channel();
        let now = Instant::now();
        for (label, delay) in [("c", 60), ("a", 20), ("b", 40)] {
            let tx = tx.clone();
            engine
                .schedule(
                    now + Duration::from_millis(delay),
                    Some(next_task_id()),
                    owner(),
                    Box::new(move || tx.send(label).unwrap()),
                )
                .ok()
                .unwrap();
        }
        let order: Vec<_> = (0..3).map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(engine.fired(), 3);

        assert!(engine.shutdown().is_empty());
        assert!(engine.await_termination(Duration::from_secs(2)));
    }

    #[test]
    fn actions_run_on_the_timer_thread() {
        let engine = engine();
        let (tx, rx) = mpsc::channel();
        engine
            .schedule(
                Instant::now(),
                Some(next_task_id()),
                owner(),
                Box::new(move || tx.send(current_cohort().map(|c| c.class())).unwrap()),
            )
            .ok()
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), Some(PoolClass::Timer));
        engine.shutdown();
        assert!(engine.await_termination(Duration::from_secs(2)));
    }

    #[test]
    fn removed_entries_never_fire() {
        let engine = engine();
        let fired = Arc::new(AtomicUsize::new(0));
        let id = next_task_id();
        let counter = Arc::clone(&fired);
        engine
            .schedule(
                Instant::now() + Duration::from_millis(50),
                Some(id),
                owner(),
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .ok()
            .unwrap();
        assert!(engine.remove(id));
        assert!(!engine.remove(id));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        engine.shutdown();
        assert!(engine.await_termination(Duration::from_secs(2)));
    }

    #[test]
    fn shutdown_returns_unfired_entries() {
        let engine = engine();
        let far = Instant::now() + Duration::from_secs(60);
        let mut ids = Vec::new();
        for offset in [3, 1, 2] {
            let id = next_task_id();
            ids.push((offset, id));
            engine
                .schedule(far + Duration::from_secs(offset), Some(id), owner(), Box::new(|| {}))
                .ok()
                .unwrap();
        }
        let other = next_task_id();
        engine
            .schedule(
                far,
                Some(other),
                TimerOwner {
                    id: 2,
                    name: Arc::from("timers"),
                },
                Box::new(|| {}),
            )
            .ok()
            .unwrap();

        // Same name, different owner: only the owner's entry goes.
        let removed = engine.remove_owner(2);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, other);
        assert_eq!(removed[0].kind, CancelledKind::Delayed);

        let cancelled = engine.shutdown();
        ids.sort();
        let expected: Vec<TaskId> = ids.into_iter().map(|(_, id)| id).collect();
        let got: Vec<TaskId> = cancelled.iter().map(|c| c.id).collect();
        assert_eq!(got, expected);

        assert!(engine.schedule(far, Some(next_task_id()), owner(), Box::new(|| {})).is_err());
        assert!(engine.await_termination(Duration::from_secs(2)));
        assert!(engine.is_terminated());
    }

    #[test]
    fn housekeeping_entries_are_never_reported() {
        let engine = engine();
        let far = Instant::now() + Duration::from_secs(60);
        let task = next_task_id();
        engine.schedule(far, Some(task), owner(), Box::new(|| {})).ok().unwrap();
        engine.schedule(far, None, owner(), Box::new(|| {})).ok().unwrap();
        assert_eq!(engine.pending(), 2);

        let removed = engine.remove_owner(1);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, task);
        assert_eq!(engine.pending(), 0);

        engine.schedule(far, None, owner(), Box::new(|| {})).ok().unwrap();
        assert!(engine.shutdown().is_empty());
        assert!(engine.await_termination(Duration::from_secs(2)));
    }

    #[test]
    fn panicking_action_does_not_stop_dispatcher() {
        let engine = engine();
        let (tx, rx) = mpsc::channel();
        let now = Instant::now();
        engine
            .schedule(now, Some(next_task_id()), owner(), Box::new(|| panic!("bad timer")))
            .ok()
            .unwrap();
        engine
            .schedule(
                now + Duration::from_millis(10),
                Some(next_task_id()),
                owner(),
                Box::new(move || tx.send(()).unwrap()),
            )
            .ok()
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        engine.shutdown();
        assert!(engine.await_termination(Duration::from_secs(2)));
    }
}
