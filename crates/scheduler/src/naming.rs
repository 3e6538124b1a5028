//! Names for scheduler handles created without an explicit one.

use std::panic::Location;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use tidepool_core::PoolClass;

/// Derives a handle name from its pool class and the factory call site.
pub trait HandleNamer: Send + Sync {
    fn name(&self, class: PoolClass, call_site: &'static Location<'static>) -> String;
}

/// `<pool-class>@<file>:<line>` of the code that created the handle.
#[derive(Debug, Default, Clone, Copy)]
pub struct CallSiteNamer;

impl HandleNamer for CallSiteNamer {
    fn name(&self, class: PoolClass, call_site: &'static Location<'static>) -> String {
        let file = Path::new(call_site.file())
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or(call_site.file());
        format!("{}@{}:{}", class.as_str(), file, call_site.line())
    }
}

/// `<pool-class>-<n>` with one counter shared across classes.
#[derive(Debug, Default)]
pub struct SequentialNamer {
    next: AtomicUsize,
}

impl SequentialNamer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HandleNamer for SequentialNamer {
    fn name(&self, class: PoolClass, _call_site: &'static Location<'static>) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}", class.as_str(), n)
    }
}
