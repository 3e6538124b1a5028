//! Thread-pool orchestration: shared pools per workload class, scheduler
//! handles with optional concurrency ceilings, a shared trigger engine for
//! delayed work, and coordinated graceful shutdown.

pub mod admission;
pub mod cohort;
pub mod error;
pub mod handle;
pub mod naming;
pub mod orchestrator;
pub mod pool;
pub mod registry;
pub mod task;
pub mod thread_factory;
pub mod timer;

pub use admission::{AdmissionOutcome, AdmissionPolicy, RejectionContext, WaitCapablePolicy};
pub use cohort::{current_cohort, is_interrupted, ThreadCohort};
pub use error::SchedulerError;
pub use handle::{Periodic, RepeatMode, ScheduledTask, SchedulerConfig, SchedulerHandle, SchedulerInfo};
pub use naming::{CallSiteNamer, HandleNamer, SequentialNamer};
pub use orchestrator::{ForcedCancellation, LifecycleState, PoolOrchestrator, PoolStats, ShutdownReport};
pub use pool::BackingPool;
pub use registry::HandleRegistry;
pub use task::{CancelledKind, CancelledTask, TaskError, TaskFuture, TaskId};
pub use thread_factory::NamedThreadFactory;
pub use timer::TriggerEngine;

pub use tidepool_core::{PoolClass, PoolSizing, PoolsConfig, QueueKind};
