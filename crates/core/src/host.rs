//! Host capability probe feeding the sizing expressions.

use serde::Serialize;

/// Memory assumed when the platform offers no way to read it.
const FALLBACK_MEM_KB: u64 = 8 * 1024 * 1024;

/// Facts about the machine that sizing expressions may refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HostFacts {
    /// Available parallelism (`cores`).
    pub cores: usize,
    /// Available memory in KB (`mem`).
    pub mem_kb: u64,
}

/// Source of [`HostFacts`].
pub trait HostProbe: Send + Sync {
    fn facts(&self) -> HostFacts;
}

/// Probe that asks the running system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl HostProbe for SystemProbe {
    fn facts(&self) -> HostFacts {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let mem_kb = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|content| parse_meminfo(&content))
            .unwrap_or(FALLBACK_MEM_KB);
        HostFacts { cores, mem_kb }
    }
}

/// Probe returning fixed values, for tests and reproducible reports.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub HostFacts);

impl FixedProbe {
    pub fn new(cores: usize, mem_kb: u64) -> Self {
        Self(HostFacts { cores, mem_kb })
    }
}

impl HostProbe for FixedProbe {
    fn facts(&self) -> HostFacts {
        self.0
    }
}

/// Extract available memory (KB) from `/proc/meminfo` content.
///
/// Prefers `MemAvailable`; older kernels only report free, buffers and cached.
fn parse_meminfo(content: &str) -> Option<u64> {
    let mut available = None;
    let mut free = 0u64;
    let mut buffers = 0u64;
    let mut cached = 0u64;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(value) = value.parse::<u64>() else {
            continue;
        };
        match key {
            "MemAvailable:" => available = Some(value),
            "MemFree:" => free = value,
            "Buffers:" => buffers = value,
            "Cached:" => cached = value,
            _ => {}
        }
    }

    match available {
        Some(kb) if kb > 0 => Some(kb),
        _ => {
            let sum = free + buffers + cached;
            (sum > 0).then_some(sum)
        }
    }
}
