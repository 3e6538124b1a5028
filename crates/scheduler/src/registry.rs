//! Live scheduler handles known to one orchestrator.

use parking_lot::Mutex;

use crate::handle::{SchedulerHandle, SchedulerInfo};

#[derive(Default)]
pub struct HandleRegistry {
    handles: Mutex<Vec<SchedulerHandle>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, handle: SchedulerHandle) {
        self.handles.lock().push(handle);
    }

    /// Forget a handle. Returns false if it was not registered.
    pub(crate) fn unregister(&self, handle: &SchedulerHandle) -> bool {
        let mut handles = self.handles.lock();
        let before = handles.len();
        handles.retain(|h| !h.same_handle(handle));
        handles.len() != before
    }

    /// Handles registered right now, in creation order.
    pub fn handles(&self) -> Vec<SchedulerHandle> {
        self.handles.lock().clone()
    }

    pub fn snapshot(&self) -> Vec<SchedulerInfo> {
        self.handles().iter().map(SchedulerHandle::info).collect()
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    pub(crate) fn clear(&self) {
        let drained = std::mem::take(&mut *self.handles.lock());
        drop(drained);
    }
}

impl std::fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleRegistry").field("live", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use tidepool_core::{FixedProbe, PoolsConfig};

    use super::*;
    use crate::handle::SchedulerConfig;
    use crate::orchestrator::PoolOrchestrator;

    #[test]
    fn register_and_unregister() {
        let orchestrator = PoolOrchestrator::new(PoolsConfig::defaults(&FixedProbe::new(1, 1024 * 1024)).unwrap());
        orchestrator.start().unwrap();
        let a = orchestrator
            .create_cpu_light_scheduler(SchedulerConfig::new().with_name("a"))
            .unwrap();
        let b = orchestrator
            .create_io_scheduler(SchedulerConfig::new().with_name("b"))
            .unwrap();

        let registry = HandleRegistry::new();
        assert!(registry.is_empty());
        registry.register(a.clone());
        registry.register(b.clone());
        let names: Vec<String> = registry.snapshot().into_iter().map(|info| info.name).collect();
        assert_eq!(names, vec!["a", "b"]);

        assert!(registry.unregister(&a));
        assert!(!registry.unregister(&a));
        assert_eq!(registry.len(), 1);
        assert!(registry.handles()[0].same_handle(&b));

        registry.clear();
        assert!(registry.is_empty());
        orchestrator.stop().unwrap();
    }
}
