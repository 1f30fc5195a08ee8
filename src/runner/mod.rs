//! Bounded-concurrency task runner.
//!
//! Core components:
//! - `status`: task and run status (Waiting → Running → Success/Error/Canceled)
//! - `task`: task records and run summaries
//! - `scheduler`: backlog, FIFO dispatch and cancellation
//! - `handler`: async work functions spawned on tokio
//! - `events`: lifecycle event broadcast

pub mod events;
pub mod handler;
pub mod scheduler;
pub mod status;
pub mod task;

pub use events::RunnerEvent;
pub use handler::TaskHandler;
pub use scheduler::{Completion, TaskData, TaskRunner, TaskRunnerBuilder};
pub use status::{RunStatus, TaskStatus};
pub use task::{DispatchedTask, RunSummary, Task, TaskId};
