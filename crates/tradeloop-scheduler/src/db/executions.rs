/*
[INPUT]:  Execution outcomes from the wrapper, heartbeat updates, history filters
[OUTPUT]: Append-only task_executions rows and one service_heartbeats row per user
[POS]:    Persistence layer - audit trail that feeds conflict detection
[UPDATE]: When ledger columns, statuses or heartbeat semantics change
*/

use super::{Database, decode_enum, encode_enum, from_millis, from_millis_opt, to_millis};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{OptionalExtension, params, params_from_iter};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Skipped,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    Scheduled,
    RunOnce,
    Manual,
}

/// Which execution path wrote a ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionSource {
    Unified,
    Individual,
}

macro_rules! text_enum {
    ($ty:ty) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let text = encode_enum(self).map_err(|_| fmt::Error)?;
                f.pad(&text)
            }
        }

        impl FromStr for $ty {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self> {
                decode_enum(&s.trim().to_ascii_lowercase().replace('-', "_"))
            }
        }
    };
}

text_enum!(ExecutionStatus);
text_enum!(ExecutionKind);
text_enum!(ExecutionSource);

/// Ledger row about to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct NewExecution {
    pub user_id: String,
    pub task_name: String,
    pub executed_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub duration_seconds: f64,
    pub details: serde_json::Value,
    pub kind: ExecutionKind,
    pub source: ExecutionSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskExecution {
    pub id: i64,
    pub user_id: String,
    pub task_name: String,
    pub executed_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub duration_seconds: f64,
    pub details: serde_json::Value,
    pub kind: ExecutionKind,
    pub source: ExecutionSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceHeartbeat {
    pub user_id: String,
    pub service_running: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_task_execution: Option<DateTime<Utc>>,
    pub error_count: i64,
    pub last_error: Option<String>,
}

/// History filter, most recent rows first.
#[derive(Debug, Clone)]
pub struct ExecutionQuery {
    pub user_id: String,
    pub task_name: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub kind: Option<ExecutionKind>,
    pub limit: usize,
}

impl ExecutionQuery {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            task_name: None,
            status: None,
            kind: None,
            limit: 50,
        }
    }
}

const EXECUTION_COLUMNS: &str = "id, user_id, task_name, executed_at, status, duration_seconds, details, execution_kind, source";

impl Database {
    pub fn record_execution(&self, execution: &NewExecution) -> Result<i64> {
        let conn = self.conn()?;
        let details = serde_json::to_string(&execution.details).context("serialize details")?;

        conn.execute(
            "INSERT INTO task_executions (user_id, task_name, executed_at, status, duration_seconds, details, execution_kind, source) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                execution.user_id,
                execution.task_name,
                to_millis(execution.executed_at),
                encode_enum(&execution.status)?,
                execution.duration_seconds.max(0.0),
                details,
                encode_enum(&execution.kind)?,
                encode_enum(&execution.source)?,
            ],
        )
        .context("insert task execution")?;

        Ok(conn.last_insert_rowid())
    }

    /// Finish a `running` row in place. `executed_at` keeps the start time.
    ///
    /// Returns false when the row is missing or already finished.
    pub fn complete_running(
        &self,
        execution_id: i64,
        status: ExecutionStatus,
        duration_seconds: f64,
        details: &serde_json::Value,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let details = serde_json::to_string(details).context("serialize details")?;
        let updated = conn
            .execute(
                "UPDATE task_executions SET status = ?2, duration_seconds = ?3, details = ?4 WHERE id = ?1 AND status = 'running'",
                params![
                    execution_id,
                    encode_enum(&status)?,
                    duration_seconds.max(0.0),
                    details
                ],
            )
            .context("complete running execution")?;
        Ok(updated == 1)
    }

    pub fn get_execution(&self, execution_id: i64) -> Result<Option<TaskExecution>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {EXECUTION_COLUMNS} FROM task_executions WHERE id = ?1"),
                params![execution_id],
                ExecutionRow::from_row,
            )
            .optional()
            .context("fetch task execution")?;
        row.map(TaskExecution::try_from).transpose()
    }

    pub fn list_executions(&self, query: &ExecutionQuery) -> Result<Vec<TaskExecution>> {
        let mut sql = format!("SELECT {EXECUTION_COLUMNS} FROM task_executions WHERE user_id = ?");
        let mut args = vec![Value::Text(query.user_id.clone())];

        if let Some(task_name) = &query.task_name {
            sql.push_str(" AND task_name = ?");
            args.push(Value::Text(task_name.clone()));
        }
        if let Some(status) = &query.status {
            sql.push_str(" AND status = ?");
            args.push(Value::Text(encode_enum(status)?));
        }
        if let Some(kind) = &query.kind {
            sql.push_str(" AND execution_kind = ?");
            args.push(Value::Text(encode_enum(kind)?));
        }
        sql.push_str(" ORDER BY executed_at DESC, id DESC LIMIT ?");
        args.push(Value::Integer(i64::try_from(query.limit).unwrap_or(i64::MAX)));

        self.query_executions(&sql, args)
    }

    /// Rows for `task_name` written at or after `cutoff`.
    pub fn executions_since(
        &self,
        user_id: &str,
        task_name: &str,
        cutoff: DateTime<Utc>,
        source: Option<ExecutionSource>,
    ) -> Result<Vec<TaskExecution>> {
        let mut sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM task_executions WHERE user_id = ? AND task_name = ? AND executed_at >= ?"
        );
        let mut args = vec![
            Value::Text(user_id.to_string()),
            Value::Text(task_name.to_string()),
            Value::Integer(to_millis(cutoff)),
        ];
        if let Some(source) = &source {
            sql.push_str(" AND source = ?");
            args.push(Value::Text(encode_enum(source)?));
        }
        sql.push_str(" ORDER BY executed_at DESC, id DESC");

        self.query_executions(&sql, args)
    }

    pub fn running_executions(
        &self,
        user_id: &str,
        task_name: Option<&str>,
        source: Option<ExecutionSource>,
    ) -> Result<Vec<TaskExecution>> {
        let mut sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM task_executions WHERE user_id = ? AND status = 'running'"
        );
        let mut args = vec![Value::Text(user_id.to_string())];
        if let Some(task_name) = task_name {
            sql.push_str(" AND task_name = ?");
            args.push(Value::Text(task_name.to_string()));
        }
        if let Some(source) = &source {
            sql.push_str(" AND source = ?");
            args.push(Value::Text(encode_enum(source)?));
        }
        sql.push_str(" ORDER BY executed_at DESC, id DESC");

        self.query_executions(&sql, args)
    }

    /// Most recent finished row for a task, if any.
    pub fn latest_finished_execution(
        &self,
        user_id: &str,
        task_name: &str,
    ) -> Result<Option<TaskExecution>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {EXECUTION_COLUMNS} FROM task_executions WHERE user_id = ?1 AND task_name = ?2 AND status != 'running' ORDER BY executed_at DESC, id DESC LIMIT 1"
                ),
                params![user_id, task_name],
                ExecutionRow::from_row,
            )
            .optional()
            .context("fetch latest execution")?;
        row.map(TaskExecution::try_from).transpose()
    }

    fn query_executions(&self, sql: &str, args: Vec<Value>) -> Result<Vec<TaskExecution>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).context("prepare execution query")?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), ExecutionRow::from_row)
            .context("query task executions")?;

        let mut executions = Vec::new();
        for row in rows {
            executions.push(TaskExecution::try_from(row?)?);
        }
        Ok(executions)
    }

    pub fn get_or_create_heartbeat(&self, user_id: &str) -> Result<ServiceHeartbeat> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO service_heartbeats (user_id) VALUES (?1)",
            params![user_id],
        )
        .context("create heartbeat")?;

        let row = conn
            .query_row(
                "SELECT user_id, service_running, last_heartbeat, last_task_execution, error_count, last_error FROM service_heartbeats WHERE user_id = ?1",
                params![user_id],
                HeartbeatRow::from_row,
            )
            .context("fetch heartbeat")?;
        ServiceHeartbeat::try_from(row)
    }

    /// Record a finished task execution on the heartbeat.
    pub fn touch_heartbeat(&self, user_id: &str, executed_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO service_heartbeats (user_id, last_heartbeat, last_task_execution) VALUES (?1, ?2, ?2)
             ON CONFLICT(user_id) DO UPDATE SET last_heartbeat = excluded.last_heartbeat, last_task_execution = excluded.last_task_execution",
            params![user_id, to_millis(executed_at)],
        )
        .context("touch heartbeat")?;
        Ok(())
    }

    /// Liveness beat without a task execution (unified loop idle ticks).
    pub fn beat(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO service_heartbeats (user_id, last_heartbeat) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET last_heartbeat = excluded.last_heartbeat",
            params![user_id, to_millis(at)],
        )
        .context("beat heartbeat")?;
        Ok(())
    }

    pub fn increment_error(&self, user_id: &str, message: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO service_heartbeats (user_id, error_count, last_error) VALUES (?1, 1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET error_count = error_count + 1, last_error = excluded.last_error",
            params![user_id, message],
        )
        .context("increment heartbeat error count")?;
        Ok(())
    }

    pub fn set_service_running(
        &self,
        user_id: &str,
        running: bool,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO service_heartbeats (user_id, service_running, last_heartbeat) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET service_running = excluded.service_running, last_heartbeat = excluded.last_heartbeat",
            params![user_id, running, to_millis(at)],
        )
        .context("set service running flag")?;
        Ok(())
    }

    pub fn reset_error_count(&self, user_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE service_heartbeats SET error_count = 0, last_error = NULL WHERE user_id = ?1",
            params![user_id],
        )
        .context("reset heartbeat error count")?;
        Ok(())
    }
}

struct ExecutionRow {
    id: i64,
    user_id: String,
    task_name: String,
    executed_at: i64,
    status: String,
    duration_seconds: f64,
    details: String,
    execution_kind: String,
    source: String,
}

impl ExecutionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            task_name: row.get(2)?,
            executed_at: row.get(3)?,
            status: row.get(4)?,
            duration_seconds: row.get(5)?,
            details: row.get(6)?,
            execution_kind: row.get(7)?,
            source: row.get(8)?,
        })
    }
}

impl TryFrom<ExecutionRow> for TaskExecution {
    type Error = anyhow::Error;

    fn try_from(row: ExecutionRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            task_name: row.task_name,
            executed_at: from_millis(row.executed_at)?,
            status: decode_enum(&row.status)?,
            duration_seconds: row.duration_seconds,
            details: serde_json::from_str(&row.details)
                .with_context(|| format!("parse details of execution {}", row.id))?,
            kind: decode_enum(&row.execution_kind)?,
            source: decode_enum(&row.source)?,
        })
    }
}

struct HeartbeatRow {
    user_id: String,
    service_running: bool,
    last_heartbeat: Option<i64>,
    last_task_execution: Option<i64>,
    error_count: i64,
    last_error: Option<String>,
}

impl HeartbeatRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            user_id: row.get(0)?,
            service_running: row.get(1)?,
            last_heartbeat: row.get(2)?,
            last_task_execution: row.get(3)?,
            error_count: row.get(4)?,
            last_error: row.get(5)?,
        })
    }
}

impl TryFrom<HeartbeatRow> for ServiceHeartbeat {
    type Error = anyhow::Error;

    fn try_from(row: HeartbeatRow) -> Result<Self> {
        Ok(Self {
            user_id: row.user_id,
            service_running: row.service_running,
            last_heartbeat: from_millis_opt(row.last_heartbeat)?,
            last_task_execution: from_millis_opt(row.last_task_execution)?,
            error_count: row.error_count,
            last_error: row.last_error,
        })
    }
}
