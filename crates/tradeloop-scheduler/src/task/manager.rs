/*
[INPUT]:  TaskRunner, Database, ConflictDetector, per-task schedules, CancellationToken
[OUTPUT]: Per (user, task) scheduled workers with start / stop / run-once / status
[POS]:    Execution layer - individual-path lifecycle orchestration
[UPDATE]: When changing start/stop guarantees, loop supervision or status fields
*/

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Once, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;

use super::state_machine::{TaskAction, TaskState, TaskStateMachine};
use super::{TaskName, TaskRunner};
use crate::config::{SchedulerConfig, TaskSchedule};
use crate::conflict::ConflictDetector;
use crate::db::{Database, ExecutionKind, ExecutionSource, ExecutionStatus};
use crate::error::{LifecycleError, is_fatal};
use crate::wrapper::{ExecutionScope, ExecutionTracker};

static PANIC_HOOK_ONCE: Once = Once::new();

fn ensure_panic_hook_installed() {
    PANIC_HOOK_ONCE.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            tracing::error!("panic in task: {info}");
            previous(info);
        }));
    });
}

type TaskKey = (String, TaskName);

/// State shared between the manager and one worker loop.
#[derive(Debug, Default)]
struct TaskSlot {
    inner: StdMutex<SlotInner>,
}

#[derive(Debug, Default)]
struct SlotInner {
    machine: TaskStateMachine,
    next_run_at: Option<DateTime<Utc>>,
}

impl TaskSlot {
    fn lock(&self) -> MutexGuard<'_, SlotInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn state(&self) -> TaskState {
        self.lock().machine.state()
    }

    fn transition(&self, action: TaskAction) -> Result<TaskState, LifecycleError> {
        Ok(self.lock().machine.transition(action)?)
    }

    fn set_next_run(&self, at: Option<DateTime<Utc>>) {
        self.lock().next_run_at = at;
    }

    /// Loop exited on its own or after cancellation.
    fn mark_stopped(&self) {
        let mut inner = self.lock();
        if inner.machine.state() == TaskState::Running {
            let _ = inner.machine.transition(TaskAction::Stop);
        }
        if inner.machine.state() == TaskState::Stopping {
            let _ = inner.machine.transition(TaskAction::Stopped);
        }
        inner.next_run_at = None;
    }

    fn mark_failed(&self, reason: String) {
        let mut inner = self.lock();
        if let Err(err) = inner.machine.transition(TaskAction::Fail(reason)) {
            tracing::warn!(error = %err, "worker failure after it already left the running states");
        }
        inner.next_run_at = None;
    }
}

#[derive(Debug)]
struct Worker {
    shutdown: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

#[derive(Debug)]
struct ManagedTask {
    slot: Arc<TaskSlot>,
    started_at: Option<DateTime<Utc>>,
    worker: Option<Worker>,
}

impl ManagedTask {
    fn is_live(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
    }
}

/// Result of a synchronous `run_once`.
#[derive(Debug, Clone, Serialize)]
pub struct RunOnceReport {
    pub execution_id: i64,
    pub status: ExecutionStatus,
    pub duration_seconds: f64,
    pub message: String,
}

/// One row of `status(user_id)`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusView {
    pub state: TaskState,
    pub is_running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub last_execution_at: Option<DateTime<Utc>>,
    pub next_execution_at: Option<DateTime<Utc>>,
    pub process_id: u32,
    pub schedule_enabled: bool,
    pub last_execution_status: Option<ExecutionStatus>,
    pub last_execution_duration: Option<f64>,
    pub last_error: Option<String>,
}

/// Individually started tasks of this process.
pub struct TaskManager {
    db: Database,
    detector: ConflictDetector,
    tracker: ExecutionTracker,
    runner: Arc<dyn TaskRunner>,
    schedules: BTreeMap<TaskName, TaskSchedule>,
    stop_timeout: Duration,
    shutdown: CancellationToken,
    tasks: Mutex<HashMap<TaskKey, ManagedTask>>,
}

impl TaskManager {
    pub fn new(db: Database, runner: Arc<dyn TaskRunner>, config: &SchedulerConfig) -> Self {
        Self {
            detector: ConflictDetector::with_window(db.clone(), config.conflict_window()),
            tracker: ExecutionTracker::new(db.clone()),
            db,
            runner,
            schedules: config.schedules(),
            stop_timeout: config.stop_timeout(),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_schedule(mut self, task: TaskName, schedule: TaskSchedule) -> Self {
        self.schedules.insert(task, schedule);
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn schedule(&self, task: TaskName) -> TaskSchedule {
        self.schedules
            .get(&task)
            .copied()
            .unwrap_or_else(|| TaskSchedule::default_for(task))
    }

    /// Start the scheduled loop of `task_name` for `user_id`.
    pub async fn start(&self, user_id: &str, task_name: &str) -> Result<String, LifecycleError> {
        let task: TaskName = task_name.parse()?;
        ensure_panic_hook_installed();

        let mut tasks = self.tasks.lock().await;
        let key = (user_id.to_string(), task);
        if tasks.get(&key).is_some_and(ManagedTask::is_live) {
            return Err(LifecycleError::conflict(format!(
                "{task} is already running for user {user_id} in this process"
            )));
        }

        let check = self.detector.can_start_individual_service(user_id)?;
        if check.has_conflict {
            return Err(LifecycleError::conflict(check.reason_or_default()));
        }
        let check = self.detector.check_conflict(user_id, task.as_str())?;
        if check.has_conflict {
            return Err(LifecycleError::conflict(check.reason_or_default()));
        }

        let slot = tasks
            .get(&key)
            .map(|managed| managed.slot.clone())
            .unwrap_or_default();
        slot.transition(TaskAction::Start)?;
        slot.transition(TaskAction::Started)?;

        let schedule = self.schedule(task);
        let shutdown = self.shutdown.child_token();
        let worker_loop = WorkerLoop {
            user_id: user_id.to_string(),
            task,
            interval: schedule.interval(),
            default_enabled: schedule.enabled,
            db: self.db.clone(),
            detector: self.detector.clone(),
            tracker: self.tracker.clone(),
            runner: self.runner.clone(),
            slot: slot.clone(),
            shutdown: shutdown.clone(),
        };
        let handle = worker_loop.spawn();

        tasks.insert(
            key,
            ManagedTask {
                slot,
                started_at: Some(Utc::now()),
                worker: Some(Worker { shutdown, handle }),
            },
        );

        tracing::info!(user_id, task = %task, interval_secs = schedule.interval_secs, "task started");
        Ok(format!(
            "{task} started for user {user_id} (every {}s)",
            schedule.interval_secs
        ))
    }

    /// Cooperative stop. Waits up to the stop timeout; a worker still busy
    /// after that keeps running until its next checkpoint.
    pub async fn stop(&self, user_id: &str, task_name: &str) -> Result<String, LifecycleError> {
        let task: TaskName = task_name.parse()?;
        let key = (user_id.to_string(), task);
        let not_running = || LifecycleError::NotRunning {
            user_id: user_id.to_string(),
            task: task.to_string(),
        };

        let (slot, mut worker) = {
            let mut tasks = self.tasks.lock().await;
            let managed = tasks.get_mut(&key).ok_or_else(not_running)?;
            if !managed.is_live() {
                managed.worker = None;
                return Err(not_running());
            }
            let worker = managed.worker.take().ok_or_else(not_running)?;
            (managed.slot.clone(), worker)
        };

        if let Err(err) = slot.transition(TaskAction::Stop) {
            tracing::debug!(user_id, task = %task, error = %err, "stop requested outside running state");
        }
        worker.shutdown.cancel();

        let sleep = tokio::time::sleep(self.stop_timeout);
        tokio::select! {
            res = &mut worker.handle => {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::warn!(user_id, task = %task, error = %format!("{err:#}"), "worker ended with error");
                    }
                    Err(join_err) => {
                        tracing::error!(user_id, task = %task, error = %join_err, "worker join error");
                        slot.mark_failed(format!("worker join error: {join_err}"));
                    }
                }
                slot.mark_stopped();
                tracing::info!(user_id, task = %task, "task stopped");
                Ok(format!("{task} stopped for user {user_id}"))
            }
            _ = sleep => {
                tracing::warn!(
                    user_id,
                    task = %task,
                    timeout_secs = self.stop_timeout.as_secs(),
                    "worker did not finish before the stop timeout; it will exit at its next checkpoint"
                );
                let mut tasks = self.tasks.lock().await;
                if let Some(managed) = tasks.get_mut(&key) {
                    managed.worker = Some(worker);
                }
                Ok(format!("{task} stopping for user {user_id}; worker still finishing"))
            }
        }
    }

    /// Run one tracked execution now, ignoring the schedule flag.
    pub async fn run_once(
        &self,
        user_id: &str,
        task_name: &str,
        kind: ExecutionKind,
    ) -> Result<RunOnceReport, LifecycleError> {
        let task: TaskName = task_name.parse()?;
        let check = self.detector.check_conflict(user_id, task.as_str())?;
        if check.has_conflict {
            return Err(LifecycleError::conflict(check.reason_or_default()));
        }

        let scope = ExecutionScope::new(user_id, task.as_str(), kind, ExecutionSource::Individual);
        let runner = self.runner.clone();
        let owner = user_id.to_string();
        let tracked = self
            .tracker
            .run_tracked(scope, self.shutdown.child_token(), |ctx| async move {
                runner.run(&owner, task, &ctx).await
            })
            .await?;

        let message = match &tracked.result {
            Ok(()) => format!("{task} completed in {:.2}s", tracked.duration_seconds),
            Err(err) => format!("{task} failed: {err:#}"),
        };
        Ok(RunOnceReport {
            execution_id: tracked.execution_id,
            status: tracked.status,
            duration_seconds: tracked.duration_seconds,
            message,
        })
    }

    /// Per-task view for one user, keyed by task name.
    pub async fn status(&self, user_id: &str) -> Result<BTreeMap<String, TaskStatusView>, LifecycleError> {
        let tasks = self.tasks.lock().await;
        let mut views = BTreeMap::new();

        for task in TaskName::ALL {
            let managed = tasks.get(&(user_id.to_string(), task));
            let last = self.db.latest_finished_execution(user_id, task.as_str())?;
            let (state, last_error, next_execution_at) = match managed {
                Some(managed) => {
                    let inner = managed.slot.lock();
                    (
                        inner.machine.state(),
                        inner.machine.last_error().map(str::to_string),
                        inner.next_run_at,
                    )
                }
                None => (TaskState::Stopped, None, None),
            };
            let is_running = managed.is_some_and(ManagedTask::is_live)
                || self.detector.is_task_running(user_id, task.as_str())?;

            views.insert(
                task.to_string(),
                TaskStatusView {
                    state,
                    is_running,
                    started_at: managed.and_then(|managed| managed.started_at),
                    last_execution_at: last.as_ref().map(|row| row.executed_at),
                    next_execution_at,
                    process_id: std::process::id(),
                    schedule_enabled: self.schedule_enabled(user_id, task)?,
                    last_execution_status: last.as_ref().map(|row| row.status),
                    last_execution_duration: last.as_ref().map(|row| row.duration_seconds),
                    last_error,
                },
            );
        }
        Ok(views)
    }

    /// Persisted flag; scheduled loops in any process pick it up on their next tick.
    pub fn set_schedule_enabled(
        &self,
        user_id: &str,
        task_name: &str,
        enabled: bool,
    ) -> Result<(), LifecycleError> {
        let task: TaskName = task_name.parse()?;
        self.db.set_schedule_enabled(user_id, task.as_str(), enabled)?;
        tracing::info!(user_id, task = %task, enabled, "schedule flag updated");
        Ok(())
    }

    pub fn schedule_enabled(&self, user_id: &str, task: TaskName) -> Result<bool, LifecycleError> {
        Ok(self
            .db
            .schedule_enabled_or(user_id, task.as_str(), self.schedule(task).enabled)?)
    }

    /// Request graceful shutdown and wait for all workers to exit.
    ///
    /// Bounded by the stop timeout; remaining workers are aborted on timeout.
    pub async fn shutdown_and_wait(&self) -> Result<()> {
        self.shutdown.cancel();
        self.join_all_with_deadline(self.stop_timeout).await
    }

    async fn join_all_with_deadline(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        let mut workers: Vec<(TaskKey, Arc<TaskSlot>, Worker)> = {
            let mut tasks = self.tasks.lock().await;
            tasks
                .iter_mut()
                .filter_map(|(key, managed)| {
                    managed
                        .worker
                        .take()
                        .map(|worker| (key.clone(), managed.slot.clone(), worker))
                })
                .collect()
        };

        while let Some(((user_id, task), slot, worker)) = workers.pop() {
            let mut handle = worker.handle;
            let sleep = sleep_until_deadline(deadline);

            tokio::select! {
                res = &mut handle => {
                    match res {
                        Ok(Ok(())) => slot.mark_stopped(),
                        Ok(Err(err)) => {
                            // already recorded as failed by the worker itself
                            tracing::warn!(user_id = %user_id, task = %task, error = %format!("{err:#}"), "worker had ended with error");
                        }
                        Err(join_err) => {
                            abort_all(workers);
                            if join_err.is_panic() {
                                return Err(anyhow!("task {task} of user {user_id} panicked: {join_err}"));
                            }
                            return Err(anyhow!("task {task} of user {user_id} join error: {join_err}"));
                        }
                    }
                }
                _ = sleep => {
                    handle.abort();
                    abort_all(workers);
                    return Err(anyhow!("shutdown timed out after {timeout:?}"));
                }
            }
        }

        Ok(())
    }
}

fn sleep_until_deadline(deadline: Instant) -> Sleep {
    tokio::time::sleep_until(deadline)
}

fn abort_all(workers: Vec<(TaskKey, Arc<TaskSlot>, Worker)>) {
    for (_key, slot, worker) in workers {
        worker.handle.abort();
        slot.mark_failed("aborted during shutdown".to_string());
    }
}

/// One scheduled worker.
struct WorkerLoop {
    user_id: String,
    task: TaskName,
    interval: Duration,
    default_enabled: bool,
    db: Database,
    detector: ConflictDetector,
    tracker: ExecutionTracker,
    runner: Arc<dyn TaskRunner>,
    slot: Arc<TaskSlot>,
    shutdown: CancellationToken,
}

enum Tick {
    Done,
    Fatal(anyhow::Error),
}

impl WorkerLoop {
    fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            let slot = self.slot.clone();
            match AssertUnwindSafe(self.run()).catch_unwind().await {
                Ok(Ok(())) => {
                    slot.mark_stopped();
                    Ok(())
                }
                Ok(Err(err)) => {
                    slot.mark_failed(format!("{err:#}"));
                    Err(err)
                }
                Err(panic) => {
                    slot.mark_failed("worker panicked".to_string());
                    std::panic::resume_unwind(panic)
                }
            }
        })
    }

    async fn run(self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.slot
                .set_next_run(chrono::Duration::from_std(self.interval).ok().map(|step| Utc::now() + step));

            match self.tick().await {
                Ok(Tick::Done) => {}
                Ok(Tick::Fatal(err)) => {
                    tracing::error!(
                        user_id = %self.user_id,
                        task = %self.task,
                        error = %format!("{err:#}"),
                        "fatal task error, worker stopping"
                    );
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(
                        user_id = %self.user_id,
                        task = %self.task,
                        error = %format!("{err:#}"),
                        "scheduler tick failed"
                    );
                }
            }
        }

        tracing::info!(user_id = %self.user_id, task = %self.task, "worker loop exited");
        Ok(())
    }

    async fn tick(&self) -> Result<Tick> {
        if !self
            .db
            .schedule_enabled_or(&self.user_id, self.task.as_str(), self.default_enabled)?
        {
            tracing::debug!(user_id = %self.user_id, task = %self.task, "schedule disabled, tick skipped");
            return Ok(Tick::Done);
        }

        let scope = ExecutionScope::new(
            self.user_id.clone(),
            self.task.as_str(),
            ExecutionKind::Scheduled,
            ExecutionSource::Individual,
        );
        if self.detector.is_unified_running(&self.user_id)? {
            self.tracker.skip(&scope, "unified service is running")?;
            return Ok(Tick::Done);
        }

        let runner = self.runner.clone();
        let user_id = self.user_id.clone();
        let task = self.task;
        let tracked = self
            .tracker
            .run_tracked(scope, self.shutdown.child_token(), |ctx| async move {
                runner.run(&user_id, task, &ctx).await
            })
            .await?;

        match tracked.result {
            Ok(()) => Ok(Tick::Done),
            Err(err) if is_fatal(&err) => Ok(Tick::Fatal(err)),
            Err(err) => {
                tracing::warn!(
                    user_id = %self.user_id,
                    task = %self.task,
                    execution_id = tracked.execution_id,
                    error = %format!("{err:#}"),
                    "execution failed, retrying next tick"
                );
                Ok(Tick::Done)
            }
        }
    }
}
