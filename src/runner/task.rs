//! Task records and run summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaskError;
use crate::runner::status::{RunStatus, TaskStatus};

/// Identifier of a task, unique within one runner.
///
/// Assigned from a per-runner counter, so ids also reflect submission order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One unit of work in a runner's backlog.
#[derive(Debug, Clone, Serialize)]
pub struct Task<P, R> {
    /// Identifier assigned at submission.
    pub id: TaskId,
    /// Current status.
    pub status: TaskStatus,
    /// Caller-supplied payload.
    pub payload: P,
    /// Result value, set when the task ends in `success`.
    pub result: Option<R>,
    /// Error value, set when the task ends in `error`.
    pub error: Option<TaskError>,
    /// When the task was added to the backlog.
    pub created_at: DateTime<Utc>,
    /// When the task was dispatched.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
}

impl<P, R> Task<P, R> {
    pub(crate) fn new(id: TaskId, payload: P) -> Self {
        Self {
            id,
            status: TaskStatus::Waiting,
            payload,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Transition to a new status, stamping the matching timestamp.
    pub(crate) fn transition_to(&mut self, new_status: TaskStatus) -> Result<(), String> {
        if !self.status.can_transition_to(new_status) {
            return Err(format!(
                "Cannot transition task {} from {} to {}",
                self.id, self.status, new_status
            ));
        }

        self.status = new_status;
        match new_status {
            TaskStatus::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }
        Ok(())
    }

    /// Record an outcome and move to `success` or `error`.
    pub(crate) fn settle(&mut self, outcome: Result<R, TaskError>) -> Result<(), String> {
        let target = if outcome.is_ok() {
            TaskStatus::Success
        } else {
            TaskStatus::Error
        };
        self.transition_to(target)?;
        match outcome {
            Ok(result) => self.result = Some(result),
            Err(error) => self.error = Some(error),
        }
        Ok(())
    }
}

/// The view of a task handed to the work function on dispatch.
#[derive(Debug, Clone)]
pub struct DispatchedTask<P> {
    /// Task identifier.
    pub id: TaskId,
    /// Run the task was dispatched in.
    pub run_id: Uuid,
    /// Caller-supplied payload.
    pub payload: P,
}

/// Final state of a run, passed to the finish callback.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary<P, R> {
    /// Run identifier.
    pub run_id: Uuid,
    /// `finish` or `canceled`.
    pub status: RunStatus,
    /// The whole backlog, in insertion order.
    pub tasks: Vec<Task<P, R>>,
}

impl<P, R> RunSummary<P, R> {
    /// Number of tasks in the given status.
    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(TaskStatus::Success)
    }

    pub fn failed(&self) -> usize {
        self.count(TaskStatus::Error)
    }

    pub fn canceled(&self) -> usize {
        self.count(TaskStatus::Canceled)
    }

    /// True when the run finished and every task succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.status == RunStatus::Finish
            && self.tasks.iter().all(|t| t.status == TaskStatus::Success)
    }

    /// Look up a task by id.
    pub fn task(&self, id: TaskId) -> Option<&Task<P, R>> {
        self.tasks.iter().find(|t| t.id == id)
    }
}
