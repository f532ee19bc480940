//! Pool configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How the pool maps jobs onto execution units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolMode {
    /// One fresh unit per job, bounded by a concurrency cap.
    Ephemeral,
    /// A fixed set of long-lived units, each fed one job at a time.
    Persistent,
}

impl PoolMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ephemeral => "ephemeral",
            Self::Persistent => "persistent",
        }
    }
}

impl std::fmt::Display for PoolMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Bounds on replacing crashed persistent units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// Replacements allowed per window; `None` means unlimited.
    pub max_restarts: Option<u32>,

    /// Length of the restart window.
    #[serde(with = "duration_millis")]
    pub window: Duration,

    /// Pause before a replacement unit is spawned.
    #[serde(with = "duration_millis")]
    pub delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: Some(5),
            window: Duration::from_secs(60),
            delay: Duration::ZERO,
        }
    }
}

impl RestartPolicy {
    /// Never give up replacing units.
    pub fn unlimited() -> Self {
        Self {
            max_restarts: None,
            ..Self::default()
        }
    }

    /// Set the number of replacements allowed per window.
    pub const fn with_max_restarts(mut self, max: Option<u32>) -> Self {
        self.max_restarts = max;
        self
    }

    /// Set the restart window.
    pub const fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Set the delay before a replacement is spawned.
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Pool configuration, fixed once the pool is built.
///
/// # Example
///
/// ```
/// use jobpool::{PoolConfig, RestartPolicy};
/// use std::time::Duration;
///
/// let config = PoolConfig::persistent(4)
///     .with_default_timeout(Duration::from_secs(30))
///     .with_restart(RestartPolicy::default().with_max_restarts(Some(3)));
/// assert_eq!(config.size, 4);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Ephemeral or persistent.
    pub mode: PoolMode,

    /// Concurrency cap (ephemeral) or worker count (persistent). At least 1.
    pub size: usize,

    /// Timeout applied to jobs that don't set their own.
    #[serde(default, with = "duration_millis_opt")]
    pub default_timeout: Option<Duration>,

    /// Restart policy for persistent units.
    #[serde(default)]
    pub restart: RestartPolicy,

    /// Opaque value handed to every unit when it is spawned.
    #[serde(default)]
    pub init_data: Value,
}

impl PoolConfig {
    /// Configuration for a persistent pool of `workers` units.
    pub fn persistent(workers: usize) -> Self {
        Self::new(PoolMode::Persistent, workers)
    }

    /// Configuration for an ephemeral pool running up to `concurrency` jobs.
    pub fn ephemeral(concurrency: usize) -> Self {
        Self::new(PoolMode::Ephemeral, concurrency)
    }

    fn new(mode: PoolMode, size: usize) -> Self {
        Self {
            mode,
            size: size.max(1),
            default_timeout: None,
            restart: RestartPolicy::default(),
            init_data: Value::Null,
        }
    }

    /// Set the default per-job timeout. Zero disables it.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout).filter(|t| !t.is_zero());
        self
    }

    /// Set the restart policy.
    #[must_use]
    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    /// Set the data passed to every unit at spawn.
    #[must_use]
    pub fn with_init_data(mut self, init_data: Value) -> Self {
        self.init_data = init_data;
        self
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod duration_millis_opt {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    #[allow(clippy::ref_option)]
    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.filter(|ms| *ms > 0).map(Duration::from_millis))
    }
}
