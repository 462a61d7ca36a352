/*
[INPUT]:  TaskRunner, Database, per-task schedules, CancellationToken
[OUTPUT]: One long-running loop per user executing every due task in sequence
[POS]:    Execution layer - unified path, mutually exclusive with individual workers
[UPDATE]: When the unified loop's due/skip rules or service flag handling change
*/

use anyhow::Result;
use chrono::Utc;
use futures_util::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{SchedulerConfig, TaskSchedule};
use crate::conflict::ConflictDetector;
use crate::db::{Database, ExecutionKind, ExecutionSource};
use crate::error::{LifecycleError, is_fatal};
use crate::task::{TaskName, TaskRunner};
use crate::wrapper::{ExecutionScope, ExecutionTracker};

/// Runs all scheduled tasks of a user from one loop.
pub struct UnifiedService {
    db: Database,
    detector: ConflictDetector,
    tracker: ExecutionTracker,
    runner: Arc<dyn TaskRunner>,
    schedules: BTreeMap<TaskName, TaskSchedule>,
    tick: Duration,
}

impl UnifiedService {
    pub fn new(db: Database, runner: Arc<dyn TaskRunner>, config: &SchedulerConfig) -> Self {
        Self {
            detector: ConflictDetector::with_window(db.clone(), config.conflict_window()),
            tracker: ExecutionTracker::new(db.clone()),
            db,
            runner,
            schedules: config.schedules(),
            tick: config.unified_tick(),
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_schedule(mut self, task: TaskName, schedule: TaskSchedule) -> Self {
        self.schedules.insert(task, schedule);
        self
    }

    fn schedule(&self, task: TaskName) -> TaskSchedule {
        self.schedules
            .get(&task)
            .copied()
            .unwrap_or_else(|| TaskSchedule::default_for(task))
    }

    /// Run until `shutdown` fires. The heartbeat flag is set for the lifetime
    /// of the loop and cleared on every exit path.
    ///
    /// `force` clears a `service_running` flag left behind by a crashed
    /// process; running individual executions still refuse the start.
    ///
    /// A fatal task error ends the loop and is returned after the flag is cleared.
    pub async fn run(
        &self,
        user_id: &str,
        shutdown: CancellationToken,
        force: bool,
    ) -> Result<(), LifecycleError> {
        if force && self.detector.is_unified_running(user_id)? {
            tracing::warn!(user_id, "clearing service_running flag on request");
            self.db.set_service_running(user_id, false, Utc::now())?;
        }
        let check = self.detector.can_start_unified_service(user_id)?;
        if check.has_conflict {
            return Err(LifecycleError::conflict(check.reason_or_default()));
        }

        self.db.set_service_running(user_id, true, Utc::now())?;
        tracing::info!(user_id, tick_secs = self.tick.as_secs(), "unified service started");

        let outcome = AssertUnwindSafe(self.run_loop(user_id, &shutdown))
            .catch_unwind()
            .await;

        if let Err(err) = self.db.set_service_running(user_id, false, Utc::now()) {
            tracing::error!(user_id, error = %format!("{err:#}"), "failed to clear service_running flag");
        }
        match outcome {
            Ok(Ok(())) => {
                tracing::info!(user_id, "unified service stopped");
                Ok(())
            }
            Ok(Err(err)) => {
                tracing::error!(user_id, error = %err, "unified service stopped on fatal task error");
                Err(err)
            }
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn run_loop(&self, user_id: &str, shutdown: &CancellationToken) -> Result<(), LifecycleError> {
        let mut last_run: HashMap<TaskName, Instant> = HashMap::new();
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(err) = self.db.beat(user_id, Utc::now()) {
                tracing::warn!(user_id, error = %format!("{err:#}"), "heartbeat update failed");
            }

            for task in TaskName::ALL {
                if shutdown.is_cancelled() {
                    break;
                }
                let schedule = self.schedule(task);
                let due = last_run
                    .get(&task)
                    .is_none_or(|at| at.elapsed() >= schedule.interval());
                if !due {
                    continue;
                }

                match self.db.schedule_enabled_or(user_id, task.as_str(), schedule.enabled) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(err) => {
                        tracing::warn!(user_id, task = %task, error = %format!("{err:#}"), "schedule lookup failed");
                        continue;
                    }
                }
                last_run.insert(task, Instant::now());

                match self.run_task(user_id, task, shutdown).await {
                    Ok(()) => {}
                    Err(err) if is_fatal(&err) => {
                        return Err(LifecycleError::TaskFailed {
                            user_id: user_id.to_string(),
                            task: task.to_string(),
                            message: format!("{err:#}"),
                        });
                    }
                    Err(err) => {
                        tracing::warn!(user_id, task = %task, error = %format!("{err:#}"), "unified task failed");
                    }
                }
            }
        }
        Ok(())
    }

    /// One due task. Only errors classified fatal end the loop.
    async fn run_task(&self, user_id: &str, task: TaskName, shutdown: &CancellationToken) -> Result<()> {
        let scope = ExecutionScope::new(
            user_id,
            task.as_str(),
            ExecutionKind::Scheduled,
            ExecutionSource::Unified,
        );

        let check = self.detector.check_individual_conflict(user_id, task.as_str())?;
        if check.has_conflict {
            self.tracker.skip(&scope, check.reason_or_default())?;
            return Ok(());
        }

        let runner = self.runner.clone();
        let owner = user_id.to_string();
        self.tracker
            .track(scope, shutdown.child_token(), |ctx| async move {
                runner.run(&owner, task, &ctx).await
            })
            .await
    }
}
