use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};

use crate::class::PoolClass;
use crate::error::ConfigError;
use crate::expr;
use crate::host::{HostFacts, HostProbe, SystemProbe};

/// Prefix of every environment variable the loader looks at.
pub const ENV_PREFIX: &str = "TIDEPOOL_";

/// Environment variable naming a properties file to load.
pub const CONFIG_PATH_ENV: &str = "TIDEPOOL_CONFIG";

const POOL_SIZE: &str = "poolSize";
const MAX_POOL_SIZE: &str = "maxPoolSize";
const QUEUE_CAPACITY: &str = "queueCapacity";
const KEEP_ALIVE: &str = "keepAliveMillis";
const SHUTDOWN_TIMEOUT: &str = "gracefulShutdownTimeoutMillis";
const THREAD_NAME_PREFIX: &str = "threadNamePrefix";

const POOL_FIELDS: [&str; 4] = [POOL_SIZE, MAX_POOL_SIZE, QUEUE_CAPACITY, KEEP_ALIVE];

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// `cpuLight.poolSize` -> `TIDEPOOL_CPU_LIGHT_POOL_SIZE`.
fn env_name(key: &str) -> String {
    let mut name = String::from(ENV_PREFIX);
    for c in key.chars() {
        match c {
            '.' => name.push('_'),
            c if c.is_ascii_uppercase() => {
                name.push('_');
                name.push(c);
            }
            c => name.push(c.to_ascii_uppercase()),
        }
    }
    name
}

/// Every key the loader understands, in a stable order.
fn known_keys() -> Vec<String> {
    let mut keys = Vec::new();
    for class in PoolClass::SHARED {
        for field in POOL_FIELDS {
            if class.is_rendezvous() && field == QUEUE_CAPACITY {
                continue;
            }
            keys.push(format!("{}.{}", class.config_prefix(), field));
        }
    }
    keys.push(SHUTDOWN_TIMEOUT.to_string());
    keys.push(THREAD_NAME_PREFIX.to_string());
    keys
}

// ── Raw key/value source ─────────────────────────────────────

/// Raw configuration pairs, before any expression is evaluated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSource {
    entries: BTreeMap<String, String>,
}

impl ConfigSource {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Parse properties-style text: `key=value` or `key: value` per line,
    /// `#` and `!` start comments.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut entries = BTreeMap::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let split = line
                .find(['=', ':'])
                .filter(|&at| at > 0)
                .ok_or_else(|| ConfigError::Syntax {
                    line: idx + 1,
                    content: raw.to_string(),
                })?;
            let key = line[..split].trim();
            let value = line[split + 1..].trim();
            entries.insert(key.to_string(), value.to_string());
        }
        Ok(Self { entries })
    }

    /// Read and parse a properties file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&text)
    }

    /// Collect `TIDEPOOL_*` variables (call [`load_dotenv`] first, or use
    /// [`ConfigSource::discover`]). Returns `None` when none is set.
    pub fn from_env() -> Option<Self> {
        let entries: BTreeMap<String, String> = known_keys()
            .into_iter()
            .filter_map(|key| env_opt(&env_name(&key)).map(|value| (key, value)))
            .collect();
        if entries.is_empty() {
            None
        } else {
            Some(Self { entries })
        }
    }

    /// Locate configuration the way the runtime does at startup:
    /// `TIDEPOOL_CONFIG` file first, then environment variables.
    /// Absence is not an error.
    pub fn discover() -> Result<Option<Self>, ConfigError> {
        load_dotenv();
        if let Some(path) = env_opt(CONFIG_PATH_ENV) {
            tracing::debug!(path = %path, "loading pool configuration file");
            return Self::from_file(path).map(Some);
        }
        Ok(Self::from_env())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Fail on keys that look valid but are not supported; warn on the rest.
    fn check_keys(&self) -> Result<(), ConfigError> {
        let known = known_keys();
        for key in self.entries.keys() {
            if known.iter().any(|k| k == key) {
                continue;
            }
            let io_queue = format!("{}.{}", PoolClass::Io.config_prefix(), QUEUE_CAPACITY);
            if *key == io_queue {
                return Err(ConfigError::UnsupportedKey(key.clone()));
            }
            tracing::warn!(key = %key, "ignoring unknown pool configuration key");
        }
        Ok(())
    }
}

// ── Resolved configuration ───────────────────────────────────

/// How a pool buffers work its threads cannot pick up immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    /// FIFO queue holding up to `n` tasks.
    Bounded(usize),
    /// No queue: a task is only accepted if a thread is idle or can be added.
    Rendezvous,
}

impl QueueKind {
    /// Channel capacity backing this queue (zero means rendezvous).
    pub fn capacity(&self) -> usize {
        match self {
            QueueKind::Bounded(n) => *n,
            QueueKind::Rendezvous => 0,
        }
    }
}

fn serialize_millis<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
}

/// Sizing of one backing pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolSizing {
    /// Threads started eagerly and kept alive while idle.
    pub core_size: usize,
    /// Upper bound on threads; extra threads die after `keep_alive` idle.
    pub max_size: usize,
    pub queue: QueueKind,
    #[serde(rename = "keep_alive_ms", serialize_with = "serialize_millis")]
    pub keep_alive: Duration,
}

/// Resolved, validated pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolsConfig {
    pub cpu_light: PoolSizing,
    pub io: PoolSizing,
    pub cpu_intensive: PoolSizing,
    #[serde(rename = "graceful_shutdown_timeout_ms", serialize_with = "serialize_millis")]
    pub graceful_shutdown_timeout: Duration,
    pub thread_name_prefix: String,
    /// Host facts the expressions were evaluated against.
    pub host: HostFacts,
}

/// Built-in expressions per class: (poolSize, maxPoolSize, queueCapacity, keepAliveMillis).
/// `None` for maxPoolSize means "same as poolSize".
fn class_defaults(class: PoolClass) -> (&'static str, Option<&'static str>, Option<&'static str>, &'static str) {
    match class {
        PoolClass::CpuLight => ("2*cores", None, Some("1024"), "30000"),
        PoolClass::Io => ("cores", Some("cores*cores"), None, "30000"),
        _ => ("2*cores", None, Some("2*cores"), "30000"),
    }
}

const DEFAULT_SHUTDOWN_TIMEOUT: &str = "15000";
const DEFAULT_THREAD_NAME_PREFIX: &str = "tidepool";

struct Resolver<'a> {
    source: &'a ConfigSource,
    facts: HostFacts,
}

impl Resolver<'_> {
    /// Evaluate `key` (or its default) to a positive integer.
    fn positive(&self, key: &str, default: &str) -> Result<usize, ConfigError> {
        let text = self.source.get(key).unwrap_or(default);
        let value = expr::evaluate(text, &self.facts).map_err(|e| ConfigError::Expression {
            key: key.to_string(),
            expr: text.to_string(),
            reason: e.to_string(),
        })?;
        let floored = value.floor();
        if floored < 1.0 {
            return Err(ConfigError::NonPositive {
                key: key.to_string(),
                value,
            });
        }
        if floored > u32::MAX as f64 {
            return Err(ConfigError::Expression {
                key: key.to_string(),
                expr: text.to_string(),
                reason: format!("value {} is too large", value),
            });
        }
        Ok(floored as usize)
    }

    fn sizing(&self, class: PoolClass) -> Result<PoolSizing, ConfigError> {
        let prefix = class.config_prefix();
        let key = |field: &str| format!("{}.{}", prefix, field);
        let (core_default, max_default, queue_default, keep_alive_default) = class_defaults(class);

        let core_size = self.positive(&key(POOL_SIZE), core_default)?;
        let max_size = match (self.source.get(&key(MAX_POOL_SIZE)), max_default) {
            (None, None) => core_size,
            (_, default) => self.positive(&key(MAX_POOL_SIZE), default.unwrap_or("0"))?,
        };
        if max_size < core_size {
            return Err(ConfigError::MaxBelowCore {
                class: prefix.to_string(),
                core: core_size,
                max: max_size,
            });
        }
        let queue = match queue_default {
            Some(default) => QueueKind::Bounded(self.positive(&key(QUEUE_CAPACITY), default)?),
            None => QueueKind::Rendezvous,
        };
        let keep_alive =
            Duration::from_millis(self.positive(&key(KEEP_ALIVE), keep_alive_default)? as u64);

        Ok(PoolSizing {
            core_size,
            max_size,
            queue,
            keep_alive,
        })
    }
}

impl PoolsConfig {
    /// Resolve configuration from `source` against the probed host.
    ///
    /// Without a source the built-in defaults apply. Any invalid value fails
    /// the whole load; nothing is filled in silently.
    pub fn load(source: Option<&ConfigSource>, probe: &dyn HostProbe) -> Result<Self, ConfigError> {
        let empty = ConfigSource::default();
        let source = source.unwrap_or(&empty);
        source.check_keys()?;

        let resolver = Resolver {
            source,
            facts: probe.facts(),
        };

        let thread_name_prefix = source
            .get(THREAD_NAME_PREFIX)
            .unwrap_or(DEFAULT_THREAD_NAME_PREFIX)
            .trim()
            .to_string();
        if thread_name_prefix.is_empty() {
            return Err(ConfigError::EmptyValue(THREAD_NAME_PREFIX.to_string()));
        }

        Ok(Self {
            cpu_light: resolver.sizing(PoolClass::CpuLight)?,
            io: resolver.sizing(PoolClass::Io)?,
            cpu_intensive: resolver.sizing(PoolClass::CpuIntensive)?,
            graceful_shutdown_timeout: Duration::from_millis(
                resolver.positive(SHUTDOWN_TIMEOUT, DEFAULT_SHUTDOWN_TIMEOUT)? as u64,
            ),
            thread_name_prefix,
            host: resolver.facts,
        })
    }

    /// Built-in defaults for the given host.
    pub fn defaults(probe: &dyn HostProbe) -> Result<Self, ConfigError> {
        Self::load(None, probe)
    }

    /// Discover a source (file or env) and resolve it against this machine.
    pub fn from_env() -> Result<Self, ConfigError> {
        let source = ConfigSource::discover()?;
        Self::load(source.as_ref(), &SystemProbe)
    }

    /// Sizing of a shared pool class; `None` for custom and timer.
    pub fn sizing(&self, class: PoolClass) -> Option<&PoolSizing> {
        match class {
            PoolClass::CpuLight => Some(&self.cpu_light),
            PoolClass::Io => Some(&self.io),
            PoolClass::CpuIntensive => Some(&self.cpu_intensive),
            PoolClass::Custom | PoolClass::Timer => None,
        }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!(
            "Pools config loaded (cores={}, mem={}KB, shutdown timeout={:?}):",
            self.host.cores,
            self.host.mem_kb,
            self.graceful_shutdown_timeout
        );
        for class in PoolClass::SHARED {
            if let Some(s) = self.sizing(class) {
                tracing::info!(
                    "  {:<14} core={}, max={}, queue={:?}, keep_alive={:?}",
                    class.as_str(),
                    s.core_size,
                    s.max_size,
                    s.queue,
                    s.keep_alive
                );
            }
        }
    }

    /// JSON view for diagnostics tooling.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
