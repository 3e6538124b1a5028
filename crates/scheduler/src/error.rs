//! Scheduler error types.

use thiserror::Error;
use tidepool_core::ConfigError;

use crate::orchestrator::LifecycleState;

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The backing pool is saturated and the calling thread may not borrow.
    #[error("task rejected by `{scheduler}`: pool `{pool}` is at capacity")]
    Rejected { scheduler: String, pool: String },

    /// The scheduler (or its orchestrator) has begun or completed shutdown.
    #[error("scheduler `{scheduler}` has been shut down")]
    Stopped { scheduler: String },

    #[error("cannot {operation} while orchestrator is {state}")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}
