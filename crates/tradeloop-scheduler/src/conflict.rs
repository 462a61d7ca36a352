/*
[INPUT]:  Ledger rows and service heartbeat of one user
[OUTPUT]: Start/run decisions with a human-readable conflict reason
[POS]:    Coordination layer - keeps the unified and individual paths off the same work
[UPDATE]: When conflict windows or the order of checks change
*/

use crate::db::{Database, ExecutionSource, ExecutionStatus, TaskExecution};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

pub const DEFAULT_CONFLICT_WINDOW: Duration = Duration::from_secs(120);

/// A unified row this fresh means the unified loop is on the task right now.
pub const RUNNING_PROBE_WINDOW: Duration = Duration::from_secs(30);

/// Outcome of a conflict check. `has_conflict` means the caller must not proceed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictCheck {
    pub has_conflict: bool,
    pub reason: Option<String>,
}

impl ConflictCheck {
    pub fn clear() -> Self {
        Self {
            has_conflict: false,
            reason: None,
        }
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        Self {
            has_conflict: true,
            reason: Some(reason.into()),
        }
    }

    pub fn reason_or_default(&self) -> &str {
        self.reason.as_deref().unwrap_or("no conflict")
    }
}

#[derive(Debug, Clone)]
pub struct ConflictDetector {
    db: Database,
    window: Duration,
}

impl ConflictDetector {
    pub fn new(db: Database) -> Self {
        Self::with_window(db, DEFAULT_CONFLICT_WINDOW)
    }

    pub fn with_window(db: Database, window: Duration) -> Self {
        Self { db, window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn is_unified_running(&self, user_id: &str) -> Result<bool> {
        Ok(self.db.get_or_create_heartbeat(user_id)?.service_running)
    }

    pub fn check_conflict(&self, user_id: &str, task_name: &str) -> Result<ConflictCheck> {
        self.check_conflict_at(user_id, task_name, self.window, Utc::now())
    }

    /// Checks, first hit wins:
    /// 1. unified service running and a unified row inside the window
    /// 2. an individual row still `running`
    /// 3. an individual row inside the window
    pub fn check_conflict_at(
        &self,
        user_id: &str,
        task_name: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<ConflictCheck> {
        if self.is_unified_running(user_id)? {
            let rows = self.recent_rows(user_id, task_name, window, now, ExecutionSource::Unified)?;
            if let Some(row) = rows.first() {
                return Ok(ConflictCheck::conflict(format!(
                    "unified service is running and executed {task_name} {}s ago",
                    age_secs(row, now)
                )));
            }
        }
        self.check_individual_conflict_at(user_id, task_name, window, now)
    }

    /// Individual-path checks only; the unified loop calls this before each task.
    pub fn check_individual_conflict(&self, user_id: &str, task_name: &str) -> Result<ConflictCheck> {
        self.check_individual_conflict_at(user_id, task_name, self.window, Utc::now())
    }

    pub fn check_individual_conflict_at(
        &self,
        user_id: &str,
        task_name: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<ConflictCheck> {
        let running = self
            .db
            .running_executions(user_id, Some(task_name), Some(ExecutionSource::Individual))?;
        if let Some(row) = running.first() {
            return Ok(ConflictCheck::conflict(format!(
                "individual {task_name} execution {} is still running (started {}s ago)",
                row.id,
                age_secs(row, now)
            )));
        }

        let rows = self.recent_rows(user_id, task_name, window, now, ExecutionSource::Individual)?;
        if let Some(row) = rows.first() {
            return Ok(ConflictCheck::conflict(format!(
                "{task_name} ran individually {}s ago, inside the {}s conflict window",
                age_secs(row, now),
                window.as_secs()
            )));
        }

        Ok(ConflictCheck::clear())
    }

    pub fn is_task_running(&self, user_id: &str, task_name: &str) -> Result<bool> {
        self.is_task_running_at(user_id, task_name, Utc::now())
    }

    pub fn is_task_running_at(
        &self,
        user_id: &str,
        task_name: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let unified = self.recent_rows(
            user_id,
            task_name,
            RUNNING_PROBE_WINDOW,
            now,
            ExecutionSource::Unified,
        )?;
        if !unified.is_empty() {
            return Ok(true);
        }
        let running = self
            .db
            .running_executions(user_id, Some(task_name), Some(ExecutionSource::Individual))?;
        Ok(!running.is_empty())
    }

    /// Individual tasks are refused while the unified service runs.
    pub fn can_start_individual_service(&self, user_id: &str) -> Result<ConflictCheck> {
        if self.is_unified_running(user_id)? {
            return Ok(ConflictCheck::conflict(format!(
                "unified service is running for user {user_id}"
            )));
        }
        Ok(ConflictCheck::clear())
    }

    /// The unified service is refused while it is flagged running or any
    /// individual execution is in progress.
    pub fn can_start_unified_service(&self, user_id: &str) -> Result<ConflictCheck> {
        if self.is_unified_running(user_id)? {
            return Ok(ConflictCheck::conflict(format!(
                "unified service is already flagged running for user {user_id}"
            )));
        }
        let running = self
            .db
            .running_executions(user_id, None, Some(ExecutionSource::Individual))?;
        if !running.is_empty() {
            let mut tasks: Vec<&str> = running.iter().map(|row| row.task_name.as_str()).collect();
            tasks.sort_unstable();
            tasks.dedup();
            return Ok(ConflictCheck::conflict(format!(
                "individual executions still running: {}",
                tasks.join(", ")
            )));
        }
        Ok(ConflictCheck::clear())
    }

    /// Non-skipped rows from `source` written at or after `now - window`.
    fn recent_rows(
        &self,
        user_id: &str,
        task_name: &str,
        window: Duration,
        now: DateTime<Utc>,
        source: ExecutionSource,
    ) -> Result<Vec<TaskExecution>> {
        let window = chrono::Duration::from_std(window).context("conflict window out of range")?;
        let rows = self
            .db
            .executions_since(user_id, task_name, now - window, Some(source))?;
        Ok(rows
            .into_iter()
            .filter(|row| row.status != ExecutionStatus::Skipped)
            .collect())
    }
}

fn age_secs(row: &TaskExecution, now: DateTime<Utc>) -> i64 {
    (now - row.executed_at).num_seconds().max(0)
}
