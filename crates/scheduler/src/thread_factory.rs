//! Named worker thread creation.

use std::io;
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};

use parking_lot::Mutex;

use crate::cohort::{self, ThreadCohort};

/// Creates threads named `<cohort>.<n>`, `n` counting from 1 and never reused.
///
/// A number is only taken once its thread actually started, so a failed
/// spawn leaves no gap in the sequence.
#[derive(Debug)]
pub struct NamedThreadFactory {
    cohort: Arc<ThreadCohort>,
    counter: Mutex<usize>,
}

impl NamedThreadFactory {
    pub fn new(cohort: Arc<ThreadCohort>) -> Self {
        Self {
            cohort,
            counter: Mutex::new(0),
        }
    }

    pub fn cohort(&self) -> &Arc<ThreadCohort> {
        &self.cohort
    }

    /// Number of threads this factory has named so far.
    pub fn created(&self) -> usize {
        *self.counter.lock()
    }

    /// Spawn `f` on a new thread that belongs to this factory's cohort.
    pub fn new_thread<F>(&self, f: F) -> io::Result<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_with(f, |builder, body| builder.spawn(body))
    }

    fn spawn_with<F, S>(&self, f: F, spawn: S) -> io::Result<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
        S: FnOnce(Builder, Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>>,
    {
        // Held across the spawn so numbers are handed out in order.
        let mut counter = self.counter.lock();
        let seq = *counter + 1;
        let cohort = Arc::clone(&self.cohort);
        let builder = Builder::new().name(format!("{}.{}", cohort.name(), seq));
        let handle = spawn(
            builder,
            Box::new(move || {
                cohort::join_cohort(cohort);
                f();
            }),
        )?;
        *counter = seq;
        Ok(handle)
    }
}
