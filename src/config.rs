//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Default number of tasks allowed in flight at once.
pub const DEFAULT_BATCH_LIMIT: usize = 2;

/// Default broadcast channel capacity for runner events.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Runner configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Runner name, attached to log lines.
    pub name: String,
    /// Maximum number of tasks in the `running` state at any time.
    pub batch_limit: usize,
    /// Per-task watchdog. `None` disables it.
    pub task_timeout: Option<Duration>,
    /// Capacity of the lifecycle event channel.
    pub event_capacity: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            name: "batch-runner".to_string(),
            batch_limit: DEFAULT_BATCH_LIMIT,
            task_timeout: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl RunnerConfig {
    /// Load configuration from `BATCH_RUNNER_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let name = lookup("BATCH_RUNNER_NAME")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.name);

        let batch_limit = match lookup("BATCH_RUNNER_LIMIT") {
            Some(raw) => parse_number("BATCH_RUNNER_LIMIT", &raw)?,
            None => defaults.batch_limit,
        };

        let task_timeout = match lookup("BATCH_RUNNER_TASK_TIMEOUT_SECS") {
            Some(raw) => match parse_number::<u64>("BATCH_RUNNER_TASK_TIMEOUT_SECS", &raw)? {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            None => defaults.task_timeout,
        };

        let event_capacity = match lookup("BATCH_RUNNER_EVENT_CAPACITY") {
            Some(raw) => parse_number("BATCH_RUNNER_EVENT_CAPACITY", &raw)?,
            None => defaults.event_capacity,
        };

        let config = Self {
            name,
            batch_limit,
            task_timeout,
            event_capacity,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runner cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "batch_limit".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "event_capacity".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.task_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidValue {
                key: "task_timeout".to_string(),
                message: "must be non-zero (use None to disable)".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_number<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?}: {e}"),
    })
}
