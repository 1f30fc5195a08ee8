//! Batch Runner: bounded-concurrency task runner.
//!
//! Feed a backlog of jobs to a work function, at most `batch_limit` at a
//! time, and get a single notification when the backlog drains or the run is
//! canceled.
//!
//! ```rust,ignore
//! use batch_runner::runner::TaskRunner;
//!
//! let runner = TaskRunner::builder()
//!     .batch_limit(2)
//!     .tasks(["a.zip", "b.zip", "c.zip"])
//!     .on_start(|task, done| done.succeed(task.payload.len()))
//!     .on_finish(|summary| println!("{} succeeded", summary.succeeded()))
//!     .build()?;
//! runner.start();
//! ```

pub mod command;
pub mod config;
pub mod error;
pub mod runner;

pub use config::RunnerConfig;
pub use error::{ConfigError, JobError, RunnerError, TaskError};
pub use runner::{
    Completion, RunStatus, RunSummary, RunnerEvent, Task, TaskHandler, TaskId, TaskRunner,
    TaskStatus,
};
