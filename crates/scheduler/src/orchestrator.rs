//! Pool orchestrator: owns the shared pools and the trigger engine, hands out
//! scheduler handles and runs the coordinated shutdown.

use std::collections::HashMap;
use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Serialize, Serializer};
use tidepool_core::{PoolClass, PoolSizing, PoolsConfig, QueueKind};
use tracing::{debug, info, warn};

use crate::admission::{AdmissionPolicy, WaitCapablePolicy};
use crate::cohort::ThreadCohort;
use crate::error::SchedulerError;
use crate::handle::{HandleParts, SchedulerConfig, SchedulerHandle, SchedulerInfo, ShutdownTimeout};
use crate::naming::{CallSiteNamer, HandleNamer};
use crate::pool::BackingPool;
use crate::registry::HandleRegistry;
use crate::task::{CancelledKind, CancelledTask};
use crate::thread_factory::NamedThreadFactory;
use crate::timer::TriggerEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Started,
    Stopping,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleState::Created => "created",
            LifecycleState::Started => "started",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
        })
    }
}

fn serialize_millis<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
}

/// Work a pool still held when its share of the shutdown budget ran out.
#[derive(Debug, Clone, Serialize)]
pub struct ForcedCancellation {
    pub pool: String,
    /// Queued and backlogged tasks discarded without running.
    pub cancelled: Vec<CancelledTask>,
    /// Running tasks whose interrupt flag was raised.
    pub interrupted: usize,
}

/// Outcome of [`PoolOrchestrator::stop`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    pub forced: Vec<ForcedCancellation>,
    /// Timers discarded before they fired.
    pub unfired: Vec<CancelledTask>,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

impl ShutdownReport {
    /// Every pool drained within the budget.
    pub fn is_clean(&self) -> bool {
        self.forced.is_empty()
    }
}

/// Live counters of one backing pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub class: PoolClass,
    pub threads: usize,
    pub active: usize,
    pub queued: usize,
    pub completed: u64,
}

impl PoolStats {
    fn of(pool: &BackingPool) -> Self {
        Self {
            name: pool.name().to_string(),
            class: pool.class(),
            threads: pool.pool_size(),
            active: pool.active_count(),
            queued: pool.queued(),
            completed: pool.completed_tasks(),
        }
    }
}

#[derive(Clone)]
struct SharedPools {
    cpu_light: Arc<BackingPool>,
    io: Arc<BackingPool>,
    cpu_intensive: Arc<BackingPool>,
    engine: TriggerEngine,
}

impl SharedPools {
    fn pool(&self, class: PoolClass) -> Option<&Arc<BackingPool>> {
        match class {
            PoolClass::CpuLight => Some(&self.cpu_light),
            PoolClass::Io => Some(&self.io),
            PoolClass::CpuIntensive => Some(&self.cpu_intensive),
            PoolClass::Custom | PoolClass::Timer => None,
        }
    }

    /// Shared pools in drain order.
    fn in_order(&self) -> [&Arc<BackingPool>; 3] {
        [&self.cpu_light, &self.io, &self.cpu_intensive]
    }
}

type CustomPools = Arc<Mutex<HashMap<u64, Arc<BackingPool>>>>;

/// Root of the pool hierarchy.
///
/// Created in [`LifecycleState::Created`]; [`start`](Self::start) builds the
/// pools, [`stop`](Self::stop) shuts every handle and pool down within one
/// shared graceful budget.
pub struct PoolOrchestrator {
    config: PoolsConfig,
    policy: Arc<dyn AdmissionPolicy>,
    namer: Arc<dyn HandleNamer>,
    state: Mutex<LifecycleState>,
    pools: RwLock<Option<SharedPools>>,
    custom_pools: CustomPools,
    registry: Arc<HandleRegistry>,
    next_custom: AtomicU64,
}

impl PoolOrchestrator {
    pub fn new(config: PoolsConfig) -> Self {
        Self {
            config,
            policy: Arc::new(WaitCapablePolicy),
            namer: Arc::new(CallSiteNamer),
            state: Mutex::new(LifecycleState::Created),
            pools: RwLock::new(None),
            custom_pools: Arc::new(Mutex::new(HashMap::new())),
            registry: Arc::new(HandleRegistry::new()),
            next_custom: AtomicU64::new(1),
        }
    }

    /// Replace the admission policy used by handles created from now on.
    pub fn with_policy(mut self, policy: impl AdmissionPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn with_namer(mut self, namer: impl HandleNamer + 'static) -> Self {
        self.namer = Arc::new(namer);
        self
    }

    pub fn config(&self) -> &PoolsConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// Build the shared pools with all core threads running and start the
    /// trigger engine.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        if *state != LifecycleState::Created {
            return Err(SchedulerError::InvalidState {
                operation: "start",
                state: *state,
            });
        }

        let mut opened = Vec::with_capacity(3);
        let built = self.open_shared(&mut opened);
        let shared = match built {
            Ok(shared) => shared,
            Err(e) => {
                for pool in &opened {
                    pool.shutdown();
                }
                return Err(e);
            }
        };
        *self.pools.write() = Some(shared);
        *state = LifecycleState::Started;

        self.config.log_summary();
        info!(prefix = %self.config.thread_name_prefix, "pool orchestrator started");
        Ok(())
    }

    fn open_shared(&self, opened: &mut Vec<Arc<BackingPool>>) -> Result<SharedPools, SchedulerError> {
        let prefix = &self.config.thread_name_prefix;
        let mut open = |class: PoolClass, sizing: &PoolSizing| -> Result<Arc<BackingPool>, SchedulerError> {
            let pool = BackingPool::new(Arc::new(ThreadCohort::for_class(prefix, class)), sizing.clone());
            opened.push(Arc::clone(&pool));
            pool.prestart_core_threads()?;
            Ok(pool)
        };
        let cpu_light = open(PoolClass::CpuLight, &self.config.cpu_light)?;
        let io = open(PoolClass::Io, &self.config.io)?;
        let cpu_intensive = open(PoolClass::CpuIntensive, &self.config.cpu_intensive)?;

        let timers = NamedThreadFactory::new(Arc::new(ThreadCohort::for_class(prefix, PoolClass::Timer)));
        let engine = TriggerEngine::start(&timers)?;

        Ok(SharedPools {
            cpu_light,
            io,
            cpu_intensive,
            engine,
        })
    }

    /// Shut everything down within the graceful budget.
    ///
    /// Handles are marked stopped, pending timers are discarded and every
    /// pool is closed to new work. Pools then drain one after another, in the
    /// order trigger engine, cpu-light, io, cpu-intensive, custom, each
    /// waiting only for what is left of the budget. A pool still busy when
    /// its wait ends has its queue discarded and its running tasks
    /// interrupted.
    pub fn stop(&self) -> Result<ShutdownReport, SchedulerError> {
        {
            let mut state = self.state.lock();
            if *state != LifecycleState::Started {
                return Err(SchedulerError::InvalidState {
                    operation: "stop",
                    state: *state,
                });
            }
            *state = LifecycleState::Stopping;
        }

        let began = Instant::now();
        let budget = self.config.graceful_shutdown_timeout;
        let remaining = || budget.saturating_sub(began.elapsed());

        let handles = self.registry.handles();
        let customs: Vec<Arc<BackingPool>> = self.custom_pools.lock().values().cloned().collect();
        let shared = self.pools.read().clone();
        info!(
            handles = handles.len(),
            custom_pools = customs.len(),
            ?budget,
            "stopping pool orchestrator"
        );

        for handle in &handles {
            handle.shutdown();
        }

        let mut report = ShutdownReport::default();
        if let Some(shared) = &shared {
            report.unfired = shared.engine.shutdown();
        }
        let pools: Vec<&Arc<BackingPool>> = shared
            .iter()
            .flat_map(|s| s.in_order())
            .chain(customs.iter())
            .collect();
        for pool in &pools {
            pool.shutdown();
        }

        if let Some(shared) = &shared {
            if !shared.engine.await_termination(remaining()) {
                warn!(engine = %shared.engine.name(), "trigger engine did not stop within the shutdown budget");
            }
        }
        for pool in pools {
            if pool.await_termination(remaining()) {
                debug!(pool = %pool.name(), "pool drained");
                continue;
            }
            // Idle workers may still be on their way out; only report pools
            // that actually had work taken away.
            if let Some(forced) = force_cancel(pool, &handles) {
                report.forced.push(forced);
            }
        }
        // A backlog waiting for a retry from the stopped trigger engine has
        // nobody left to feed it.
        for handle in &handles {
            let stranded = handle.discard_backlog();
            if stranded.is_empty() {
                continue;
            }
            warn!(scheduler = %handle.name(), cancelled = stranded.len(), "backlog left after pools drained, cancelled");
            report.forced.push(ForcedCancellation {
                pool: handle.pool_name().to_string(),
                cancelled: stranded,
                interrupted: 0,
            });
        }

        *self.pools.write() = None;
        self.custom_pools.lock().clear();
        self.registry.clear();
        *self.state.lock() = LifecycleState::Stopped;

        report.elapsed = began.elapsed();
        info!(
            elapsed = ?report.elapsed,
            forced = report.forced.len(),
            unfired = report.unfired.len(),
            "pool orchestrator stopped"
        );
        Ok(report)
    }

    // ── Handle factories ─────────────────────────────────────

    #[track_caller]
    pub fn create_cpu_light_scheduler(&self, config: SchedulerConfig) -> Result<SchedulerHandle, SchedulerError> {
        self.create_shared(PoolClass::CpuLight, config, Location::caller())
    }

    #[track_caller]
    pub fn create_io_scheduler(&self, config: SchedulerConfig) -> Result<SchedulerHandle, SchedulerError> {
        self.create_shared(PoolClass::Io, config, Location::caller())
    }

    #[track_caller]
    pub fn create_cpu_intensive_scheduler(&self, config: SchedulerConfig) -> Result<SchedulerHandle, SchedulerError> {
        self.create_shared(PoolClass::CpuIntensive, config, Location::caller())
    }

    /// Handle with a dedicated pool of `pool_size` threads. Shutting the
    /// handle down closes the pool and forgets it.
    #[track_caller]
    pub fn create_custom_scheduler(
        &self,
        config: SchedulerConfig,
        pool_size: usize,
        queue: QueueKind,
    ) -> Result<SchedulerHandle, SchedulerError> {
        let call_site = Location::caller();
        let state = self.state.lock();
        let shared = self.running_pools(*state, "create a custom scheduler")?;
        if pool_size == 0 {
            return Err(SchedulerError::InvalidArgument(
                "custom pool needs at least one thread".to_string(),
            ));
        }
        if queue == QueueKind::Bounded(0) {
            return Err(SchedulerError::InvalidArgument(
                "bounded queue capacity must be positive, use a rendezvous queue instead".to_string(),
            ));
        }
        check_ceiling(&config)?;

        let name = self.handle_name(PoolClass::Custom, &config, call_site);
        let cohort = ThreadCohort::new(
            format!("{}.custom.{}", self.config.thread_name_prefix, name),
            PoolClass::Custom,
            config.wait_allowed(),
        );
        let sizing = PoolSizing {
            core_size: pool_size,
            max_size: pool_size,
            queue,
            keep_alive: self.config.cpu_light.keep_alive,
        };
        let pool = BackingPool::new(Arc::new(cohort), sizing);
        if let Err(e) = pool.prestart_core_threads() {
            pool.shutdown();
            return Err(e.into());
        }

        let id = self.next_custom.fetch_add(1, Ordering::Relaxed);
        self.custom_pools.lock().insert(id, Arc::clone(&pool));
        let custom_pools = Arc::clone(&self.custom_pools);
        let on_pool_closed: Box<dyn FnOnce() + Send> = Box::new(move || {
            custom_pools.lock().remove(&id);
        });

        let handle = SchedulerHandle::new(HandleParts {
            name,
            pool,
            dedicated: true,
            engine: shared.engine,
            policy: Arc::clone(&self.policy),
            registry: Arc::downgrade(&self.registry),
            max_concurrent: config.max_concurrent(),
            shutdown_timeout: self.shutdown_timeout(&config),
            on_pool_closed: Some(on_pool_closed),
        });
        self.registry.register(handle.clone());
        debug!(
            scheduler = %handle.name(),
            pool = %handle.pool_name(),
            threads = pool_size,
            ?queue,
            "custom scheduler created"
        );
        Ok(handle)
    }

    fn create_shared(
        &self,
        class: PoolClass,
        config: SchedulerConfig,
        call_site: &'static Location<'static>,
    ) -> Result<SchedulerHandle, SchedulerError> {
        let state = self.state.lock();
        let shared = self.running_pools(*state, "create a scheduler")?;
        check_ceiling(&config)?;
        let pool = shared
            .pool(class)
            .cloned()
            .ok_or_else(|| SchedulerError::InvalidArgument(format!("`{}` is not a shared pool class", class)))?;

        let handle = SchedulerHandle::new(HandleParts {
            name: self.handle_name(class, &config, call_site),
            pool,
            dedicated: false,
            engine: shared.engine,
            policy: Arc::clone(&self.policy),
            registry: Arc::downgrade(&self.registry),
            max_concurrent: config.max_concurrent(),
            shutdown_timeout: self.shutdown_timeout(&config),
            on_pool_closed: None,
        });
        self.registry.register(handle.clone());
        debug!(scheduler = %handle.name(), pool = %handle.pool_name(), "scheduler created");
        Ok(handle)
    }

    fn running_pools(&self, state: LifecycleState, operation: &'static str) -> Result<SharedPools, SchedulerError> {
        let pools = self.pools.read();
        match (state, pools.as_ref()) {
            (LifecycleState::Started, Some(shared)) => Ok(shared.clone()),
            _ => Err(SchedulerError::InvalidState { operation, state }),
        }
    }

    fn handle_name(&self, class: PoolClass, config: &SchedulerConfig, call_site: &'static Location<'static>) -> String {
        match config.name() {
            Some(name) => name.to_string(),
            None => self.namer.name(class, call_site),
        }
    }

    fn shutdown_timeout(&self, config: &SchedulerConfig) -> ShutdownTimeout {
        let timeout = config
            .shutdown_timeout()
            .unwrap_or(self.config.graceful_shutdown_timeout);
        Arc::new(move || timeout)
    }

    // ── Introspection ────────────────────────────────────────

    /// Snapshot of every handle that has not been shut down.
    pub fn list_active_schedulers(&self) -> Vec<SchedulerInfo> {
        self.registry.snapshot()
    }

    /// Counters of the shared and custom pools; empty unless started.
    pub fn pool_stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = match self.pools.read().as_ref() {
            Some(shared) => shared.in_order().iter().map(|p| PoolStats::of(p)).collect(),
            None => return Vec::new(),
        };
        let mut customs: Vec<PoolStats> = self.custom_pools.lock().values().map(|p| PoolStats::of(p)).collect();
        customs.sort_by(|a, b| a.name.cmp(&b.name));
        stats.extend(customs);
        stats
    }

    /// Dedicated pools of custom handles that are still open.
    pub fn custom_pool_count(&self) -> usize {
        self.custom_pools.lock().len()
    }
}

impl Drop for PoolOrchestrator {
    fn drop(&mut self) {
        if self.state() == LifecycleState::Started {
            warn!("pool orchestrator dropped while started, stopping");
            if let Err(e) = self.stop() {
                warn!(error = %e, "stop on drop failed");
            }
        }
    }
}

impl fmt::Debug for PoolOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolOrchestrator")
            .field("state", &self.state())
            .field("handles", &self.registry.len())
            .field("custom_pools", &self.custom_pool_count())
            .finish()
    }
}

fn check_ceiling(config: &SchedulerConfig) -> Result<(), SchedulerError> {
    if config.max_concurrent() == Some(0) {
        return Err(SchedulerError::InvalidArgument(
            "max_concurrent must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Discard what `pool` still holds: backlogs of its handles first so they
/// cannot refill it, then its queue; then cancel running tasks.
fn force_cancel(pool: &Arc<BackingPool>, handles: &[SchedulerHandle]) -> Option<ForcedCancellation> {
    let mut cancelled: Vec<CancelledTask> = handles
        .iter()
        .filter(|h| Arc::ptr_eq(h.backing_pool(), pool))
        .flat_map(|h| h.discard_backlog())
        .collect();
    let (drained, interrupted) = pool.shutdown_now();
    cancelled.extend(drained.into_iter().map(|job| job.cancel(CancelledKind::Queued)));
    if cancelled.is_empty() && interrupted == 0 {
        return None;
    }
    warn!(
        pool = %pool.name(),
        cancelled = cancelled.len(),
        interrupted,
        "pool did not drain within the shutdown budget, cancelled remaining work"
    );
    Some(ForcedCancellation {
        pool: pool.name().to_string(),
        cancelled,
        interrupted,
    })
}

#[cfg(test)]
mod tests {
    use tidepool_core::FixedProbe;

    use super::*;
    use crate::naming::SequentialNamer;

    fn small_config() -> PoolsConfig {
        let mut config = PoolsConfig::defaults(&FixedProbe::new(2, 4 * 1024 * 1024)).unwrap();
        config.graceful_shutdown_timeout = Duration::from_millis(500);
        config
    }

    #[test]
    fn lifecycle_transitions() {
        let orchestrator = PoolOrchestrator::new(small_config());
        assert_eq!(orchestrator.state(), LifecycleState::Created);
        assert!(matches!(
            orchestrator.stop(),
            Err(SchedulerError::InvalidState {
                operation: "stop",
                state: LifecycleState::Created
            })
        ));

        orchestrator.start().unwrap();
        assert_eq!(orchestrator.state(), LifecycleState::Started);
        assert!(matches!(
            orchestrator.start(),
            Err(SchedulerError::InvalidState { operation: "start", .. })
        ));

        let report = orchestrator.stop().unwrap();
        assert!(report.is_clean());
        assert_eq!(orchestrator.state(), LifecycleState::Stopped);
        assert!(orchestrator.pool_stats().is_empty());
        assert!(matches!(orchestrator.start(), Err(SchedulerError::InvalidState { .. })));
        assert!(matches!(
            orchestrator.create_io_scheduler(SchedulerConfig::new()),
            Err(SchedulerError::InvalidState { .. })
        ));
    }

    #[test]
    fn start_prestarts_core_threads() {
        let orchestrator = PoolOrchestrator::new(small_config());
        orchestrator.start().unwrap();
        let stats = orchestrator.pool_stats();
        let threads: Vec<(&str, usize)> = stats.iter().map(|s| (s.name.as_str(), s.threads)).collect();
        assert_eq!(
            threads,
            vec![
                ("tidepool.cpu-light", 4),
                ("tidepool.io", 2),
                ("tidepool.cpu-intensive", 4)
            ]
        );
        orchestrator.stop().unwrap();
    }

    #[test]
    fn handles_are_named_and_listed() {
        let orchestrator = PoolOrchestrator::new(small_config()).with_namer(SequentialNamer::new());
        orchestrator.start().unwrap();
        let light = orchestrator.create_cpu_light_scheduler(SchedulerConfig::new()).unwrap();
        let io = orchestrator
            .create_io_scheduler(SchedulerConfig::new().with_name("http-client"))
            .unwrap();
        assert_eq!(light.name(), "cpu-light-1");
        assert_eq!(io.name(), "http-client");
        assert_eq!(io.pool_name(), "tidepool.io");

        let names: Vec<String> = orchestrator
            .list_active_schedulers()
            .into_iter()
            .map(|info| info.name)
            .collect();
        assert_eq!(names, vec!["cpu-light-1", "http-client"]);

        light.shutdown();
        assert_eq!(orchestrator.list_active_schedulers().len(), 1);
        orchestrator.stop().unwrap();
        assert!(orchestrator.list_active_schedulers().is_empty());
        assert!(io.is_shutdown());
    }

    #[test]
    fn default_names_use_call_site() {
        let orchestrator = PoolOrchestrator::new(small_config());
        orchestrator.start().unwrap();
        let line = line!() + 1;
        let handle = orchestrator.create_cpu_intensive_scheduler(SchedulerConfig::new()).unwrap();
        assert_eq!(handle.name(), format!("cpu-intensive@orchestrator.rs:{}", line));
        orchestrator.stop().unwrap();
    }

    #[test]
    fn invalid_arguments() {
        let orchestrator = PoolOrchestrator::new(small_config());
        orchestrator.start().unwrap();
        assert!(matches!(
            orchestrator.create_cpu_light_scheduler(SchedulerConfig::new().with_max_concurrent(0)),
            Err(SchedulerError::InvalidArgument(_))
        ));
        assert!(matches!(
            orchestrator.create_custom_scheduler(SchedulerConfig::new(), 0, QueueKind::Rendezvous),
            Err(SchedulerError::InvalidArgument(_))
        ));
        assert!(matches!(
            orchestrator.create_custom_scheduler(SchedulerConfig::new(), 2, QueueKind::Bounded(0)),
            Err(SchedulerError::InvalidArgument(_))
        ));
        assert_eq!(orchestrator.custom_pool_count(), 0);
        orchestrator.stop().unwrap();
    }

    #[test]
    fn dropping_a_started_orchestrator_stops_it() {
        let orchestrator = PoolOrchestrator::new(small_config());
        orchestrator.start().unwrap();
        let handle = orchestrator.create_cpu_light_scheduler(SchedulerConfig::new()).unwrap();
        drop(orchestrator);
        assert!(handle.is_shutdown());
        assert!(handle.await_termination(Duration::from_secs(1)));
    }
}
