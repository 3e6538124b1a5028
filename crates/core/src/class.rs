//! Workload classes served by the orchestrator.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A workload category with its own sizing and queueing discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolClass {
    /// Short, non-blocking work. Bounded FIFO queue.
    CpuLight,
    /// Blocking I/O. Rendezvous hand-off, grows up to its max size.
    Io,
    /// CPU-bound computation. Bounded FIFO queue.
    CpuIntensive,
    /// Dedicated pools created per custom scheduler.
    Custom,
    /// The shared trigger engine thread.
    Timer,
}

impl PoolClass {
    /// Classes backed by a shared, configured pool.
    pub const SHARED: [PoolClass; 3] = [PoolClass::CpuLight, PoolClass::Io, PoolClass::CpuIntensive];

    /// Diagnostic name, used in thread names and scheduler names.
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolClass::CpuLight => "cpu-light",
            PoolClass::Io => "io",
            PoolClass::CpuIntensive => "cpu-intensive",
            PoolClass::Custom => "custom",
            PoolClass::Timer => "timer",
        }
    }

    /// Prefix used by configuration keys (`cpuLight.poolSize`).
    pub fn config_prefix(&self) -> &'static str {
        match self {
            PoolClass::CpuLight => "cpuLight",
            PoolClass::Io => "io",
            PoolClass::CpuIntensive => "cpuIntensive",
            PoolClass::Custom => "custom",
            PoolClass::Timer => "timer",
        }
    }

    /// Whether worker threads of this class may block waiting on other pools.
    ///
    /// Only I/O threads are wait-capable by default; custom pools opt in
    /// when they are created.
    pub fn wait_capable(&self) -> bool {
        matches!(self, PoolClass::Io)
    }

    /// Whether the class hands work over without an intermediate queue.
    pub fn is_rendezvous(&self) -> bool {
        matches!(self, PoolClass::Io)
    }
}

impl fmt::Display for PoolClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_kebab_case() {
        assert_eq!(PoolClass::CpuLight.to_string(), "cpu-light");
        assert_eq!(PoolClass::CpuIntensive.as_str(), "cpu-intensive");
        assert_eq!(
            serde_json::to_string(&PoolClass::CpuIntensive).unwrap(),
            "\"cpu-intensive\""
        );
    }

    #[test]
    fn only_io_waits_by_default() {
        assert!(PoolClass::Io.wait_capable());
        assert!(!PoolClass::CpuLight.wait_capable());
        assert!(!PoolClass::CpuIntensive.wait_capable());
        assert!(!PoolClass::Custom.wait_capable());
    }
}
