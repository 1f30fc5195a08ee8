//! Lifecycle events broadcast by a runner.
//!
//! Subscribers get a `RunnerEvent` for every run start, dispatch, task
//! outcome, cancellation and run end. Sending with no subscribers is fine.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::runner::status::{RunStatus, TaskStatus};
use crate::runner::task::TaskId;

/// Events emitted while a runner executes its backlog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerEvent {
    /// `start()` began a new run.
    RunStarted { run_id: Uuid },
    /// A task was dispatched to the work function.
    TaskStarted { run_id: Uuid, task_id: TaskId },
    /// A task reached `success` or `error`.
    TaskFinished {
        run_id: Uuid,
        task_id: TaskId,
        status: TaskStatus,
    },
    /// An in-flight task was canceled.
    TaskCanceled { run_id: Uuid, task_id: TaskId },
    /// The run concluded and the finish callback fired.
    RunFinished {
        run_id: Uuid,
        status: RunStatus,
        succeeded: usize,
        failed: usize,
        canceled: usize,
    },
}

impl RunnerEvent {
    /// Get the run ID from any variant.
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::RunStarted { run_id }
            | Self::TaskStarted { run_id, .. }
            | Self::TaskFinished { run_id, .. }
            | Self::TaskCanceled { run_id, .. }
            | Self::RunFinished { run_id, .. } => *run_id,
        }
    }

    /// Get the task ID for task-level variants.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::TaskStarted { task_id, .. }
            | Self::TaskFinished { task_id, .. }
            | Self::TaskCanceled { task_id, .. } => Some(*task_id),
            Self::RunStarted { .. } | Self::RunFinished { .. } => None,
        }
    }
}
