//! Task and run status state machines.

use serde::{Deserialize, Serialize};

/// Status of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// In the backlog, not yet dispatched.
    Waiting,
    /// Dispatched and awaiting its completion.
    Running,
    /// Completed without error.
    Success,
    /// Completed with an error.
    Error,
    /// Stopped by runner cancellation.
    Canceled,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another one.
    ///
    /// A task moves forward exactly once: `Waiting → Running → terminal`.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Waiting, Running) | (Running, Success) | (Running, Error) | (Running, Canceled)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Canceled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

/// Overall status of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Not started yet.
    #[default]
    Waiting,
    /// Dispatching tasks.
    Running,
    /// Backlog drained, nothing in flight.
    Finish,
    /// Stopped by `cancel()`.
    Canceled,
}

impl RunStatus {
    /// Whether a run has concluded (and its finish callback fired).
    pub fn is_concluded(&self) -> bool {
        matches!(self, Self::Finish | Self::Canceled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Finish => "finish",
            Self::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}
