//! Error types for the batch runner.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Failure recorded on a single task.
///
/// Stored on the task itself and handed back through the finish summary, so it
/// has to be cheap to clone and serializable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskError {
    #[error("Task failed: {reason}")]
    Failed { reason: String },

    #[error("Task timed out after {timeout:?}")]
    TimedOut { timeout: Duration },

    #[error("Task completion handle dropped without reporting an outcome")]
    Abandoned,
}

impl TaskError {
    /// Build a `Failed` error from anything displayable.
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        Self::Failed {
            reason: reason.to_string(),
        }
    }
}

/// Errors from building or awaiting a runner.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Runner dropped before the run finished")]
    Closed,

    #[error("Invalid runner configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Job file errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Failed to read job file {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid job file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Job {index} is invalid: {reason}")]
    Invalid { index: usize, reason: String },
}
