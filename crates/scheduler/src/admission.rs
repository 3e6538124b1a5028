//! Admission policy invoked when a backing pool refuses a task.
//!
//! A task on pool A that submits to pool B and then waits on the result can
//! deadlock if B is saturated and the rejection blocks or discards. The
//! default policy lets the caller run the rejected task itself when the
//! caller's cohort is allowed to wait; everyone else gets an explicit
//! rejection instead of a hidden block.

use tidepool_core::PoolClass;

use crate::cohort::ThreadCohort;

/// What to do with a task the target pool refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// Run the task synchronously on the submitting thread.
    ExecuteInline,
    /// Surface a rejection to the submitter.
    Reject,
}

/// Facts about a refused submission.
#[derive(Debug, Clone, Copy)]
pub struct RejectionContext<'a> {
    /// Scheduler the task was submitted through.
    pub scheduler: &'a str,
    /// Name of the pool that refused it.
    pub pool: &'a str,
    pub pool_class: PoolClass,
    /// Cohort of the submitting thread, `None` for unmanaged threads.
    pub caller: Option<&'a ThreadCohort>,
}

pub trait AdmissionPolicy: Send + Sync {
    fn on_rejected(&self, ctx: &RejectionContext<'_>) -> AdmissionOutcome;
}

impl<F> AdmissionPolicy for F
where
    F: Fn(&RejectionContext<'_>) -> AdmissionOutcome + Send + Sync,
{
    fn on_rejected(&self, ctx: &RejectionContext<'_>) -> AdmissionOutcome {
        self(ctx)
    }
}

/// Runs rejected work inline only for callers in wait-capable cohorts.
#[derive(Debug, Default, Clone, Copy)]
pub struct WaitCapablePolicy;

impl AdmissionPolicy for WaitCapablePolicy {
    fn on_rejected(&self, ctx: &RejectionContext<'_>) -> AdmissionOutcome {
        match ctx.caller {
            Some(cohort) if cohort.wait_capable() => AdmissionOutcome::ExecuteInline,
            _ => AdmissionOutcome::Reject,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(caller: Option<&'a ThreadCohort>) -> RejectionContext<'a> {
        RejectionContext {
            scheduler: "cpu-light@flow.rs:10",
            pool: "tidepool.cpu-light",
            pool_class: PoolClass::CpuLight,
            caller,
        }
    }

    #[test]
    fn io_caller_borrows() {
        let io = ThreadCohort::for_class("tidepool", PoolClass::Io);
        assert_eq!(
            WaitCapablePolicy.on_rejected(&ctx(Some(&io))),
            AdmissionOutcome::ExecuteInline
        );
    }

    #[test]
    fn wait_custom_caller_borrows() {
        let custom = ThreadCohort::new("tidepool.custom.batch", PoolClass::Custom, true);
        assert_eq!(
            WaitCapablePolicy.on_rejected(&ctx(Some(&custom))),
            AdmissionOutcome::ExecuteInline
        );
    }

    #[test]
    fn non_blocking_and_unmanaged_callers_are_rejected() {
        let light = ThreadCohort::for_class("tidepool", PoolClass::CpuLight);
        let intensive = ThreadCohort::for_class("tidepool", PoolClass::CpuIntensive);
        let plain_custom = ThreadCohort::new("tidepool.custom.x", PoolClass::Custom, false);

        assert_eq!(WaitCapablePolicy.on_rejected(&ctx(Some(&light))), AdmissionOutcome::Reject);
        assert_eq!(WaitCapablePolicy.on_rejected(&ctx(Some(&intensive))), AdmissionOutcome::Reject);
        assert_eq!(WaitCapablePolicy.on_rejected(&ctx(Some(&plain_custom))), AdmissionOutcome::Reject);
        assert_eq!(WaitCapablePolicy.on_rejected(&ctx(None)), AdmissionOutcome::Reject);
    }

    fn always_inline(_: &RejectionContext<'_>) -> AdmissionOutcome {
        AdmissionOutcome::ExecuteInline
    }

    #[test]
    fn functions_are_policies() {
        let policy: &dyn AdmissionPolicy = &always_inline;
        assert_eq!(policy.on_rejected(&ctx(None)), AdmissionOutcome::ExecuteInline);
    }
}
