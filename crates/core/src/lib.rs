//! Configuration layer for the tidepool orchestrator: pool classes, the
//! sizing expression language, host probing and validated [`PoolsConfig`].

pub mod class;
pub mod config;
pub mod error;
pub mod expr;
pub mod host;

pub use class::PoolClass;
pub use config::{load_dotenv, ConfigSource, PoolSizing, PoolsConfig, QueueKind};
pub use error::*;
pub use host::{FixedProbe, HostFacts, HostProbe, SystemProbe};
