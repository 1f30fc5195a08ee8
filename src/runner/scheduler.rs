//! Bounded-concurrency task runner.
//!
//! The runner owns an ordered backlog of tasks and hands them, oldest first,
//! to a caller-supplied `on_start` function while keeping at most
//! `batch_limit` of them in flight. Each dispatched task carries a
//! [`Completion`] that must be used exactly once to report the outcome; every
//! completion triggers another scheduling pass. The run ends with a single
//! `on_finish` call, either when the backlog is drained or on `cancel()`.
//!
//! Scheduling passes never nest: a completion reported from inside `on_start`
//! (or from another thread while a pass is underway) is picked up by the pass
//! already running. User callbacks are always invoked without the state lock
//! held, so they may call back into the runner.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RunnerConfig;
use crate::error::{ConfigError, RunnerError, TaskError};
use crate::runner::events::RunnerEvent;
use crate::runner::status::{RunStatus, TaskStatus};
use crate::runner::task::{DispatchedTask, RunSummary, Task, TaskId};

/// Bound shared by task payloads and results.
pub trait TaskData: Clone + Send + 'static {}

impl<T: Clone + Send + 'static> TaskData for T {}

type StartFn<P, R> = dyn Fn(DispatchedTask<P>, Completion<P, R>) + Send + Sync;
type CancelFn<P, R> = dyn Fn(&Task<P, R>) + Send + Sync;
type FinishFn<P, R> = dyn Fn(&RunSummary<P, R>) + Send + Sync;

struct Hooks<P: TaskData, R: TaskData> {
    on_start: Box<StartFn<P, R>>,
    on_cancel: Vec<Box<CancelFn<P, R>>>,
    on_finish: Vec<Box<FinishFn<P, R>>>,
}

struct RunState<P: TaskData, R: TaskData> {
    status: RunStatus,
    run_id: Uuid,
    /// Backlog in insertion order; ids are ascending.
    tasks: Vec<Task<P, R>>,
    in_flight: Vec<TaskId>,
    /// Every task before this index has left `waiting`.
    cursor: usize,
    next_id: u64,
    /// A scheduling pass is on some stack right now.
    pumping: bool,
    waiters: Vec<oneshot::Sender<RunSummary<P, R>>>,
}

impl<P: TaskData, R: TaskData> RunState<P, R> {
    fn push(&mut self, payload: P) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        self.tasks.push(Task::new(id, payload));
        id
    }

    fn task_mut(&mut self, id: TaskId) -> Option<&mut Task<P, R>> {
        let index = self.tasks.binary_search_by_key(&id, |t| t.id).ok()?;
        self.tasks.get_mut(index)
    }

    /// Move the first waiting task in backlog order into flight.
    fn take_next_waiting(&mut self) -> Option<DispatchedTask<P>> {
        while self
            .tasks
            .get(self.cursor)
            .is_some_and(|t| t.status != TaskStatus::Waiting)
        {
            self.cursor += 1;
        }

        let task = self.tasks.get_mut(self.cursor)?;
        task.transition_to(TaskStatus::Running).ok()?;
        let dispatched = DispatchedTask {
            id: task.id,
            run_id: self.run_id,
            payload: task.payload.clone(),
        };

        self.cursor += 1;
        self.in_flight.push(dispatched.id);
        Some(dispatched)
    }

    fn summary(&self) -> RunSummary<P, R> {
        RunSummary {
            run_id: self.run_id,
            status: self.status,
            tasks: self.tasks.clone(),
        }
    }
}

enum Step<P: TaskData, R: TaskData> {
    Dispatch(DispatchedTask<P>),
    Finish(RunSummary<P, R>, Vec<oneshot::Sender<RunSummary<P, R>>>),
    Idle,
}

struct Shared<P: TaskData, R: TaskData> {
    config: RunnerConfig,
    hooks: Hooks<P, R>,
    state: Mutex<RunState<P, R>>,
    events: broadcast::Sender<RunnerEvent>,
}

impl<P: TaskData, R: TaskData> Shared<P, R> {
    fn state(&self) -> MutexGuard<'_, RunState<P, R>> {
        // Callbacks never run under the lock, so a poisoned guard still holds
        // consistent state.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: RunnerEvent) {
        // Ok if nobody is subscribed
        let _ = self.events.send(event);
    }

    /// Run scheduling passes until nothing more can be dispatched.
    fn pump(self: &Arc<Self>) {
        {
            let mut st = self.state();
            if st.pumping {
                return;
            }
            st.pumping = true;
        }

        let guard = PumpGuard(self);
        loop {
            match self.next_step() {
                Step::Dispatch(task) => self.dispatch(task),
                Step::Finish(summary, waiters) => self.conclude(summary, waiters),
                Step::Idle => {
                    // next_step already cleared the flag under the lock.
                    std::mem::forget(guard);
                    return;
                }
            }
        }
    }

    fn next_step(&self) -> Step<P, R> {
        let mut st = self.state();

        if st.status == RunStatus::Running && st.in_flight.len() < self.config.batch_limit {
            if let Some(task) = st.take_next_waiting() {
                self.emit(RunnerEvent::TaskStarted {
                    run_id: task.run_id,
                    task_id: task.id,
                });
                return Step::Dispatch(task);
            }

            if st.in_flight.is_empty() {
                st.status = RunStatus::Finish;
                let summary = st.summary();
                self.emit(finished_event(&summary));
                let waiters = std::mem::take(&mut st.waiters);
                return Step::Finish(summary, waiters);
            }
        }

        st.pumping = false;
        Step::Idle
    }

    fn dispatch(self: &Arc<Self>, task: DispatchedTask<P>) {
        debug!(
            runner = %self.config.name,
            run_id = %task.run_id,
            task_id = %task.id,
            "Dispatching task"
        );

        if let Some(timeout) = self.config.task_timeout {
            self.arm_watchdog(task.id, timeout);
        }

        let completion = Completion {
            shared: Some(Arc::clone(self)),
            id: task.id,
        };
        (self.hooks.on_start)(task, completion);
    }

    fn arm_watchdog(self: &Arc<Self>, id: TaskId, timeout: Duration) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let weak = Arc::downgrade(self);
                handle.spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(shared) = weak.upgrade() {
                        shared.expire(id, timeout);
                    }
                });
            }
            Err(_) => {
                warn!(
                    runner = %self.config.name,
                    task_id = %id,
                    "No tokio runtime available, task watchdog disabled"
                );
            }
        }
    }

    /// Record an outcome for a running task. Returns a snapshot of the
    /// settled task, or `None` if the task was no longer running.
    fn settle(&self, id: TaskId, outcome: Result<R, TaskError>) -> Option<Task<P, R>> {
        let mut st = self.state();
        let run_id = st.run_id;

        let snapshot = {
            let task = st.task_mut(id)?;
            if task.status != TaskStatus::Running {
                debug!(
                    runner = %self.config.name,
                    task_id = %id,
                    status = %task.status,
                    "Ignoring completion for task that is no longer running"
                );
                return None;
            }
            if let Err(reason) = task.settle(outcome) {
                warn!(runner = %self.config.name, task_id = %id, %reason, "Failed to settle task");
                return None;
            }
            task.clone()
        };

        st.in_flight.retain(|t| *t != id);
        self.emit(RunnerEvent::TaskFinished {
            run_id,
            task_id: id,
            status: snapshot.status,
        });
        Some(snapshot)
    }

    fn complete(self: &Arc<Self>, id: TaskId, outcome: Result<R, TaskError>) {
        let Some(task) = self.settle(id, outcome) else {
            return;
        };

        match &task.error {
            None => debug!(runner = %self.config.name, task_id = %id, "Task succeeded"),
            Some(error) => {
                info!(runner = %self.config.name, task_id = %id, %error, "Task failed")
            }
        }

        self.pump();
    }

    fn expire(self: &Arc<Self>, id: TaskId, timeout: Duration) {
        let Some(task) = self.settle(id, Err(TaskError::TimedOut { timeout })) else {
            return;
        };

        warn!(
            runner = %self.config.name,
            task_id = %id,
            timeout = ?timeout,
            "Task timed out"
        );
        for hook in &self.hooks.on_cancel {
            hook(&task);
        }

        self.pump();
    }

    fn conclude(
        &self,
        summary: RunSummary<P, R>,
        waiters: Vec<oneshot::Sender<RunSummary<P, R>>>,
    ) {
        info!(
            runner = %self.config.name,
            run_id = %summary.run_id,
            status = %summary.status,
            succeeded = summary.succeeded(),
            failed = summary.failed(),
            canceled = summary.canceled(),
            "Run concluded"
        );

        for hook in &self.hooks.on_finish {
            hook(&summary);
        }
        for waiter in waiters {
            let _ = waiter.send(summary.clone());
        }
    }
}

/// Clears `pumping` when a callback unwinds out of a scheduling pass, so
/// later completions can schedule again.
struct PumpGuard<'a, P: TaskData, R: TaskData>(&'a Shared<P, R>);

impl<P: TaskData, R: TaskData> Drop for PumpGuard<'_, P, R> {
    fn drop(&mut self) {
        self.0.state().pumping = false;
    }
}

fn finished_event<P, R>(summary: &RunSummary<P, R>) -> RunnerEvent {
    RunnerEvent::RunFinished {
        run_id: summary.run_id,
        status: summary.status,
        succeeded: summary.succeeded(),
        failed: summary.failed(),
        canceled: summary.canceled(),
    }
}

/// One-shot handle for reporting a dispatched task's outcome.
///
/// Consumed by [`Completion::done`]. Dropping it unused settles the task as
/// [`TaskError::Abandoned`], so a lost handle never pins a concurrency slot.
pub struct Completion<P: TaskData, R: TaskData> {
    shared: Option<Arc<Shared<P, R>>>,
    id: TaskId,
}

impl<P: TaskData, R: TaskData> Completion<P, R> {
    /// Task this handle belongs to.
    pub fn task_id(&self) -> TaskId {
        self.id
    }

    /// Report the task's outcome.
    pub fn done(mut self, outcome: Result<R, TaskError>) {
        if let Some(shared) = self.shared.take() {
            shared.complete(self.id, outcome);
        }
    }

    /// Report success with a result value.
    pub fn succeed(self, result: R) {
        self.done(Ok(result));
    }

    /// Report failure with a displayable reason.
    pub fn fail(self, reason: impl std::fmt::Display) {
        self.done(Err(TaskError::failed(reason)));
    }
}

impl<P: TaskData, R: TaskData> Drop for Completion<P, R> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            debug!(task_id = %self.id, "Completion dropped without an outcome");
            shared.complete(self.id, Err(TaskError::Abandoned));
        }
    }
}

impl<P: TaskData, R: TaskData> std::fmt::Debug for Completion<P, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("task_id", &self.id)
            .field("pending", &self.shared.is_some())
            .finish()
    }
}

/// Runs a backlog of tasks with bounded concurrency.
///
/// Cheap to clone; clones share the same backlog.
pub struct TaskRunner<P: TaskData, R: TaskData> {
    shared: Arc<Shared<P, R>>,
}

impl<P: TaskData, R: TaskData> Clone for TaskRunner<P, R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P: TaskData, R: TaskData> std::fmt::Debug for TaskRunner<P, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.shared.state();
        f.debug_struct("TaskRunner")
            .field("name", &self.shared.config.name)
            .field("status", &st.status)
            .field("tasks", &st.tasks.len())
            .field("in_flight", &st.in_flight.len())
            .finish()
    }
}

impl<P: TaskData, R: TaskData> TaskRunner<P, R> {
    /// Start building a runner.
    pub fn builder() -> TaskRunnerBuilder<P, R> {
        TaskRunnerBuilder::new()
    }

    /// Append tasks to the backlog.
    ///
    /// During an active run the new tasks are picked up immediately if slots
    /// are free; otherwise they wait for the next `start()`.
    pub fn add_task_list<I>(&self, list: I) -> Vec<TaskId>
    where
        I: IntoIterator<Item = P>,
    {
        let (ids, active) = {
            let mut st = self.shared.state();
            let ids: Vec<TaskId> = list.into_iter().map(|p| st.push(p)).collect();
            (ids, st.status == RunStatus::Running)
        };

        debug!(
            runner = %self.shared.config.name,
            added = ids.len(),
            active,
            "Tasks added to backlog"
        );

        if active {
            self.shared.pump();
        }
        ids
    }

    /// Append a single task.
    pub fn add_task(&self, payload: P) -> TaskId {
        // add_task_list always returns one id per payload
        self.add_task_list(std::iter::once(payload))[0]
    }

    /// Begin a run. No-op while a run is already active.
    ///
    /// Calling `start()` after a run finished or was canceled begins a new run
    /// over the tasks still `waiting`.
    pub fn start(&self) {
        {
            let mut st = self.shared.state();
            if st.status == RunStatus::Running {
                return;
            }
            st.status = RunStatus::Running;
            st.run_id = Uuid::new_v4();

            info!(
                runner = %self.shared.config.name,
                run_id = %st.run_id,
                tasks = st.tasks.len(),
                batch_limit = self.shared.config.batch_limit,
                "Run started"
            );
            self.shared.emit(RunnerEvent::RunStarted { run_id: st.run_id });
        }

        self.shared.pump();
    }

    /// Start the run and wait for it to conclude.
    ///
    /// Resolves with the same summary the `on_finish` hooks receive, after they
    /// have run. If a run is already active, waits for that run instead.
    pub async fn run(&self) -> Result<RunSummary<P, R>, RunnerError> {
        let (tx, rx) = oneshot::channel();
        self.shared.state().waiters.push(tx);
        self.start();
        rx.await.map_err(|_| RunnerError::Closed)
    }

    /// Cancel the run.
    ///
    /// Every in-flight task is reported to the `on_cancel` hooks, as a
    /// snapshot still in `running`, and marked `canceled`; waiting tasks stay
    /// `waiting`. Returns `false` (and does nothing) if the runner is already
    /// canceled or its run finished.
    pub fn cancel(&self) -> bool {
        let (canceled, summary, waiters) = {
            let mut st = self.shared.state();
            if st.status.is_concluded() {
                return false;
            }
            st.status = RunStatus::Canceled;

            let run_id = st.run_id;
            let ids = std::mem::take(&mut st.in_flight);
            let mut canceled = Vec::with_capacity(ids.len());
            for id in ids {
                let Some(task) = st.task_mut(id) else {
                    continue;
                };
                // Hooks get the task as it was while running.
                let running = task.clone();
                if task.transition_to(TaskStatus::Canceled).is_ok() {
                    canceled.push(running);
                    self.shared.emit(RunnerEvent::TaskCanceled { run_id, task_id: id });
                }
            }

            let summary = st.summary();
            self.shared.emit(finished_event(&summary));
            (canceled, summary, std::mem::take(&mut st.waiters))
        };

        info!(
            runner = %self.shared.config.name,
            run_id = %summary.run_id,
            in_flight = canceled.len(),
            "Run canceled"
        );

        for task in &canceled {
            for hook in &self.shared.hooks.on_cancel {
                hook(task);
            }
        }
        self.shared.conclude(summary, waiters);
        true
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<RunnerEvent> {
        self.shared.events.subscribe()
    }

    /// Current run status.
    pub fn status(&self) -> RunStatus {
        self.shared.state().status
    }

    /// Identifier of the current (or last) run. Nil before the first start.
    pub fn run_id(&self) -> Uuid {
        self.shared.state().run_id
    }

    /// Snapshot of the whole backlog.
    pub fn snapshot(&self) -> Vec<Task<P, R>> {
        self.shared.state().tasks.clone()
    }

    /// Snapshot of a single task.
    pub fn task(&self, id: TaskId) -> Option<Task<P, R>> {
        self.shared.state().task_mut(id).cloned()
    }

    /// Number of tasks currently `running`.
    pub fn in_flight_count(&self) -> usize {
        self.shared.state().in_flight.len()
    }

    /// Number of tasks in the backlog.
    pub fn len(&self) -> usize {
        self.shared.state().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runner configuration.
    pub fn config(&self) -> &RunnerConfig {
        &self.shared.config
    }
}

/// Builder for [`TaskRunner`].
pub struct TaskRunnerBuilder<P: TaskData, R: TaskData> {
    config: RunnerConfig,
    status: RunStatus,
    tasks: Vec<P>,
    on_start: Option<Box<StartFn<P, R>>>,
    on_cancel: Vec<Box<CancelFn<P, R>>>,
    on_finish: Vec<Box<FinishFn<P, R>>>,
}

impl<P: TaskData, R: TaskData> Default for TaskRunnerBuilder<P, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: TaskData, R: TaskData> TaskRunnerBuilder<P, R> {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: RunnerConfig::default(),
            status: RunStatus::Waiting,
            tasks: Vec::new(),
            on_start: None,
            on_cancel: Vec::new(),
            on_finish: Vec::new(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the runner name used in log lines.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the maximum number of tasks in flight.
    pub fn batch_limit(mut self, limit: usize) -> Self {
        self.config.batch_limit = limit;
        self
    }

    /// Arm a watchdog for every dispatched task.
    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.config.task_timeout = Some(timeout);
        self
    }

    /// Set the initial run status. Normally left at `waiting`.
    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = status;
        self
    }

    /// Seed the backlog.
    pub fn tasks<I>(mut self, list: I) -> Self
    where
        I: IntoIterator<Item = P>,
    {
        self.tasks.extend(list);
        self
    }

    /// Set the work function. Required.
    pub fn on_start<F>(mut self, f: F) -> Self
    where
        F: Fn(DispatchedTask<P>, Completion<P, R>) + Send + Sync + 'static,
    {
        self.on_start = Some(Box::new(f));
        self
    }

    /// Add a hook called for each in-flight task on cancellation or timeout.
    pub fn on_cancel<F>(mut self, f: F) -> Self
    where
        F: Fn(&Task<P, R>) + Send + Sync + 'static,
    {
        self.on_cancel.push(Box::new(f));
        self
    }

    /// Add a hook called once when a run concludes.
    pub fn on_finish<F>(mut self, f: F) -> Self
    where
        F: Fn(&RunSummary<P, R>) + Send + Sync + 'static,
    {
        self.on_finish.push(Box::new(f));
        self
    }

    /// Build the runner.
    pub fn build(self) -> Result<TaskRunner<P, R>, RunnerError> {
        self.config.validate()?;
        let on_start = self.on_start.ok_or_else(|| ConfigError::MissingRequired {
            key: "on_start".to_string(),
            hint: "Provide a work function with on_start() or with_handler()".to_string(),
        })?;

        let mut state = RunState {
            status: self.status,
            run_id: Uuid::nil(),
            tasks: Vec::with_capacity(self.tasks.len()),
            in_flight: Vec::new(),
            cursor: 0,
            next_id: 0,
            pumping: false,
            waiters: Vec::new(),
        };
        for payload in self.tasks {
            state.push(payload);
        }

        let (events, _rx) = broadcast::channel(self.config.event_capacity);

        Ok(TaskRunner {
            shared: Arc::new(Shared {
                config: self.config,
                hooks: Hooks {
                    on_start,
                    on_cancel: self.on_cancel,
                    on_finish: self.on_finish,
                },
                state: Mutex::new(state),
                events,
            }),
        })
    }
}
