//! Async work functions.
//!
//! [`TaskHandler`] lets the unit of work be an `async fn`. Wiring a handler
//! into a runner spawns one tokio task per dispatched task and aborts it when
//! the task is canceled or times out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::error::TaskError;
use crate::runner::scheduler::{Completion, TaskData, TaskRunnerBuilder};
use crate::runner::task::{DispatchedTask, TaskId};

/// Async unit of work executed for each dispatched task.
#[async_trait]
pub trait TaskHandler<P: TaskData, R: TaskData>: Send + Sync {
    /// Perform the work for one task.
    async fn run(&self, task: DispatchedTask<P>) -> Result<R, TaskError>;
}

/// Spawned work, keyed by task.
enum Slot {
    Running(AbortHandle),
    /// Work ended. Swept when the run concludes.
    Finished,
    /// Canceled before its work was spawned. Consumed by the matching dispatch.
    Canceled,
}

type Slots = Arc<Mutex<HashMap<TaskId, Slot>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Spawns handler work and tracks it so it can be aborted.
struct Spawner<H: ?Sized> {
    handler: Arc<H>,
    slots: Slots,
}

impl<H: ?Sized> Spawner<H> {
    fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn start<P, R>(&self, task: DispatchedTask<P>, done: Completion<P, R>)
    where
        P: TaskData,
        R: TaskData,
        H: TaskHandler<P, R> + 'static,
    {
        let id = task.id;
        let mut slots = lock(&self.slots);
        if let Some(Slot::Canceled) = slots.remove(&id) {
            drop(slots);
            debug!(task_id = %id, "Skipping handler for task canceled before spawn");
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            drop(slots);
            done.fail("no tokio runtime available for task handler");
            return;
        };

        let handler = Arc::clone(&self.handler);
        let settle = Settle {
            slots: Arc::clone(&self.slots),
            id,
            done: Some(done),
        };
        let join = runtime.spawn(async move {
            let outcome = handler.run(task).await;
            settle.report(outcome);
        });
        // Still holding the lock, so the spawned work cannot retire its slot
        // before it exists.
        slots.insert(id, Slot::Running(join.abort_handle()));
    }

    fn cancel(&self, id: TaskId) {
        let mut slots = lock(&self.slots);
        match slots.remove(&id) {
            Some(Slot::Running(handle)) => {
                handle.abort();
                debug!(task_id = %id, "Aborted handler");
            }
            Some(Slot::Finished) => {}
            Some(Slot::Canceled) | None => {
                slots.insert(id, Slot::Canceled);
            }
        }
    }

    fn finish(&self) {
        lock(&self.slots).retain(|_, slot| !matches!(slot, Slot::Finished));
    }

    fn attach<P, R>(self: Arc<Self>, builder: TaskRunnerBuilder<P, R>) -> TaskRunnerBuilder<P, R>
    where
        P: TaskData,
        R: TaskData,
        H: TaskHandler<P, R> + 'static,
    {
        let on_start = Arc::clone(&self);
        let on_cancel = Arc::clone(&self);
        let on_finish = self;
        builder
            .on_start(move |task, done| on_start.start(task, done))
            .on_cancel(move |task| on_cancel.cancel(task.id))
            .on_finish(move |_| on_finish.finish())
    }
}

/// Hands the outcome of spawned work to its completion.
///
/// The slot is retired before the completion settles. When the work panics or
/// is aborted, dropping this reports [`TaskError::Abandoned`].
struct Settle<P: TaskData, R: TaskData> {
    slots: Slots,
    id: TaskId,
    done: Option<Completion<P, R>>,
}

impl<P: TaskData, R: TaskData> Settle<P, R> {
    fn report(mut self, outcome: Result<R, TaskError>) {
        self.retire();
        if let Some(done) = self.done.take() {
            done.done(outcome);
        }
    }

    fn retire(&self) {
        let mut slots = lock(&self.slots);
        // An aborted task's slot is already gone.
        if matches!(slots.get(&self.id), Some(Slot::Running(_))) {
            slots.insert(self.id, Slot::Finished);
        }
    }
}

impl<P: TaskData, R: TaskData> Drop for Settle<P, R> {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            self.retire();
            drop(done);
        }
    }
}

impl<P: TaskData, R: TaskData> TaskRunnerBuilder<P, R> {
    /// Use an async handler as the work function.
    ///
    /// Each dispatched task runs `handler.run` on the current tokio runtime.
    /// Canceled or timed-out tasks have their spawned work aborted. A handler
    /// that panics settles its task as [`TaskError::Abandoned`].
    pub fn with_handler<H>(self, handler: Arc<H>) -> Self
    where
        H: TaskHandler<P, R> + ?Sized + 'static,
    {
        Arc::new(Spawner::new(handler)).attach(self)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::runner::scheduler::TaskRunner;
    use crate::runner::status::{RunStatus, TaskStatus};

    /// Sleeps for `payload` milliseconds, tracking peak concurrency.
    struct Sleeper {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl TaskHandler<u64, u64> for Sleeper {
        async fn run(&self, task: DispatchedTask<u64>) -> Result<u64, TaskError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(task.payload)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if task.payload == 13 {
                return Err(TaskError::failed("unlucky"));
            }
            Ok(task.payload * 2)
        }
    }

    /// Never finishes; records whether its future was dropped.
    struct Hang {
        dropped: Arc<AtomicBool>,
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl TaskHandler<u64, u64> for Hang {
        async fn run(&self, _task: DispatchedTask<u64>) -> Result<u64, TaskError> {
            let _guard = SetOnDrop(Arc::clone(&self.dropped));
            std::future::pending::<()>().await;
            Ok(0)
        }
    }

    /// Counts how many times its work actually ran; panics on payload 1.
    struct Counter {
        ran: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TaskHandler<u64, u64> for Counter {
        async fn run(&self, task: DispatchedTask<u64>) -> Result<u64, TaskError> {
            self.ran.fetch_add(1, Ordering::SeqCst);
            if task.payload == 1 {
                panic!("handler bug");
            }
            Ok(task.payload)
        }
    }

    #[tokio::test]
    async fn handler_runs_all_tasks_within_limit() {
        let handler = Arc::new(Sleeper {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let runner = TaskRunner::<u64, u64>::builder()
            .batch_limit(3)
            .tasks([20, 5, 13, 10, 1, 15])
            .with_handler(Arc::clone(&handler))
            .build()
            .unwrap();

        let summary = runner.run().await.unwrap();

        assert_eq!(summary.status, RunStatus::Finish);
        assert_eq!(summary.succeeded(), 5);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.tasks[0].result, Some(40));
        assert_eq!(summary.tasks[2].error, Some(TaskError::failed("unlucky")));
        assert!(handler.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn cancel_aborts_spawned_work() {
        let dropped = Arc::new(AtomicBool::new(false));
        let runner = TaskRunner::<u64, u64>::builder()
            .batch_limit(1)
            .tasks([0])
            .with_handler(Arc::new(Hang {
                dropped: Arc::clone(&dropped),
            }))
            .build()
            .unwrap();

        runner.start();
        // Let the spawned future reach its await point.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(runner.cancel());

        tokio::time::timeout(Duration::from_secs(2), async {
            while !dropped.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("handler future should be aborted");

        assert_eq!(runner.snapshot()[0].status, TaskStatus::Canceled);
    }

    #[tokio::test]
    async fn watchdog_times_out_and_aborts() {
        let dropped = Arc::new(AtomicBool::new(false));
        let runner = TaskRunner::<u64, u64>::builder()
            .batch_limit(1)
            .task_timeout(Duration::from_millis(30))
            .tasks([0, 1])
            .with_handler(Arc::new(Hang {
                dropped: Arc::clone(&dropped),
            }))
            .build()
            .unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(2), runner.run())
            .await
            .expect("run should finish once both tasks time out")
            .unwrap();

        assert_eq!(summary.status, RunStatus::Finish);
        for task in &summary.tasks {
            assert_eq!(task.status, TaskStatus::Error);
            assert!(matches!(task.error, Some(TaskError::TimedOut { .. })));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn without_runtime_tasks_fail() {
        let runner = TaskRunner::<u64, u64>::builder()
            .tasks([1])
            .with_handler(Arc::new(Sleeper {
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }))
            .build()
            .unwrap();

        runner.start();

        assert_eq!(runner.status(), RunStatus::Finish);
        let task = &runner.snapshot()[0];
        assert_eq!(task.status, TaskStatus::Error);
        assert!(matches!(task.error, Some(TaskError::Failed { .. })));
    }

    #[tokio::test]
    async fn cancel_before_spawn_skips_work() {
        let ran = Arc::new(AtomicUsize::new(0));
        let spawner = Spawner::new(Arc::new(Counter {
            ran: Arc::clone(&ran),
        }));

        // Hold the dispatch back so cancel and finish land before it.
        let parked = Arc::new(Mutex::new(Vec::new()));
        let p = Arc::clone(&parked);
        let runner = TaskRunner::<u64, u64>::builder()
            .tasks([0])
            .on_start(move |task, done| p.lock().unwrap().push((task, done)))
            .build()
            .unwrap();
        runner.start();
        let (task, done) = parked.lock().unwrap().pop().unwrap();

        assert!(runner.cancel());
        spawner.cancel(task.id);
        spawner.finish();
        spawner.start(task, done);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(lock(&spawner.slots).is_empty());
        assert_eq!(runner.snapshot()[0].status, TaskStatus::Canceled);
    }

    #[tokio::test]
    async fn panicking_handler_abandons_task() {
        let ran = Arc::new(AtomicUsize::new(0));
        let spawner = Arc::new(Spawner::new(Arc::new(Counter {
            ran: Arc::clone(&ran),
        })));
        let runner = Arc::clone(&spawner)
            .attach(TaskRunner::<u64, u64>::builder().tasks([0, 1, 2]))
            .build()
            .unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(2), runner.run())
            .await
            .expect("run should finish after the panic")
            .unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 3);
        assert_eq!(summary.status, RunStatus::Finish);
        assert_eq!(summary.succeeded(), 2);
        assert_eq!(summary.tasks[1].status, TaskStatus::Error);
        assert_eq!(summary.tasks[1].error, Some(TaskError::Abandoned));
        assert!(lock(&spawner.slots).is_empty());
    }
}
