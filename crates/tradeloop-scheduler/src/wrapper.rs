/*
[INPUT]:  Execution scope (user, task, kind, source), a task body future, cancellation token
[OUTPUT]: Exactly one ledger row per execution plus the heartbeat update, on every exit path
[POS]:    Execution layer - scope every task body runs inside
[UPDATE]: When ledger row contents or panic/error handling of task bodies change
*/

use crate::db::{Database, ExecutionKind, ExecutionSource, ExecutionStatus, NewExecution};
use crate::error::error_type;
use anyhow::{Context as _, Result};
use chrono::Utc;
use futures_util::FutureExt;
use serde_json::{Map, Value, json};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Mutable key/value details shared with a running task body.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    details: Arc<Mutex<Map<String, Value>>>,
    cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            details: Arc::new(Mutex::new(Map::new())),
            cancel,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Map<String, Value>> {
        self.details.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, key: &str, value: impl Into<Value>) {
        self.lock().insert(key.to_string(), value.into());
    }

    /// Add one to a numeric counter, creating it at 1.
    pub fn increment(&self, key: &str) -> i64 {
        let mut details = self.lock();
        let next = details.get(key).and_then(Value::as_i64).unwrap_or(0) + 1;
        details.insert(key.to_string(), Value::from(next));
        next
    }

    /// Append to an array entry, creating it when missing.
    pub fn push(&self, key: &str, value: impl Into<Value>) {
        let mut details = self.lock();
        let entry = details
            .entry(key.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        match entry {
            Value::Array(items) => items.push(value.into()),
            other => *other = Value::Array(vec![other.take(), value.into()]),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    pub fn snapshot(&self) -> Value {
        Value::Object(self.lock().clone())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Who is running what, for the ledger row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionScope {
    pub user_id: String,
    pub task_name: String,
    pub kind: ExecutionKind,
    pub source: ExecutionSource,
}

impl ExecutionScope {
    pub fn new(
        user_id: impl Into<String>,
        task_name: impl Into<String>,
        kind: ExecutionKind,
        source: ExecutionSource,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            task_name: task_name.into(),
            kind,
            source,
        }
    }
}

/// Body outcome together with the ledger row that recorded it.
#[derive(Debug)]
pub struct Tracked<T> {
    pub execution_id: i64,
    pub status: ExecutionStatus,
    pub duration_seconds: f64,
    pub result: Result<T>,
}

enum Outcome<T> {
    Done(T),
    Error(anyhow::Error),
    Panic(Box<dyn Any + Send>),
}

#[derive(Debug, Clone)]
pub struct ExecutionTracker {
    db: Database,
}

impl ExecutionTracker {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Run `body` inside a tracked scope and hand back its result unchanged.
    pub async fn track<T, F, Fut>(
        &self,
        scope: ExecutionScope,
        cancel: CancellationToken,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce(ExecutionContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_tracked(scope, cancel, body).await?.result
    }

    /// Like [`track`](Self::track) but also reports the ledger row.
    ///
    /// The outer error is a ledger write failure; body errors live in
    /// [`Tracked::result`]. A panicking body is recorded as failed and the
    /// panic is resumed.
    pub async fn run_tracked<T, F, Fut>(
        &self,
        scope: ExecutionScope,
        cancel: CancellationToken,
        body: F,
    ) -> Result<Tracked<T>>
    where
        F: FnOnce(ExecutionContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started_at = Utc::now();
        let clock = Instant::now();

        let running_id = match scope.source {
            ExecutionSource::Individual => Some(
                self.db
                    .record_execution(&NewExecution {
                        user_id: scope.user_id.clone(),
                        task_name: scope.task_name.clone(),
                        executed_at: started_at,
                        status: ExecutionStatus::Running,
                        duration_seconds: 0.0,
                        details: json!({}),
                        kind: scope.kind,
                        source: scope.source,
                    })
                    .context("record running execution")?,
            ),
            ExecutionSource::Unified => None,
        };

        let ctx = ExecutionContext::new(cancel);
        let outcome = match AssertUnwindSafe(body(ctx.clone())).catch_unwind().await {
            Ok(Ok(value)) => Outcome::Done(value),
            Ok(Err(err)) => Outcome::Error(err),
            Err(panic) => Outcome::Panic(panic),
        };
        let duration_seconds = clock.elapsed().as_secs_f64();

        let (status, error_message) = match &outcome {
            Outcome::Done(_) => (ExecutionStatus::Success, None),
            Outcome::Error(err) => {
                ctx.insert("error_type", error_type(err));
                ctx.insert("error_message", format!("{err:#}"));
                (ExecutionStatus::Failed, Some(format!("{err:#}")))
            }
            Outcome::Panic(panic) => {
                let message = panic_message(panic.as_ref());
                ctx.insert("error_type", "panic");
                ctx.insert("error_message", message.clone());
                (ExecutionStatus::Failed, Some(message))
            }
        };

        let recorded = self.finish(
            &scope,
            running_id,
            started_at,
            status,
            duration_seconds,
            ctx.snapshot(),
            error_message.as_deref(),
        );

        tracing::info!(
            user_id = %scope.user_id,
            task = %scope.task_name,
            kind = %scope.kind,
            source = %scope.source,
            status = %status,
            duration_seconds,
            "task execution finished"
        );

        let result = match outcome {
            Outcome::Panic(panic) => {
                if let Err(err) = recorded {
                    tracing::error!(
                        user_id = %scope.user_id,
                        task = %scope.task_name,
                        error = %format!("{err:#}"),
                        "failed to record panicked execution"
                    );
                }
                std::panic::resume_unwind(panic);
            }
            Outcome::Done(value) => Ok(value),
            Outcome::Error(err) => Err(err),
        };

        Ok(Tracked {
            execution_id: recorded?,
            status,
            duration_seconds,
            result,
        })
    }

    /// Ledger row first, then the heartbeat.
    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        scope: &ExecutionScope,
        running_id: Option<i64>,
        started_at: chrono::DateTime<Utc>,
        status: ExecutionStatus,
        duration_seconds: f64,
        details: Value,
        error_message: Option<&str>,
    ) -> Result<i64> {
        let execution_id = match running_id {
            Some(id) => {
                let completed = self
                    .db
                    .complete_running(id, status, duration_seconds, &details)
                    .context("complete running execution")?;
                if !completed {
                    tracing::warn!(
                        execution_id = id,
                        task = %scope.task_name,
                        "running row was already finished"
                    );
                }
                id
            }
            None => self
                .db
                .record_execution(&NewExecution {
                    user_id: scope.user_id.clone(),
                    task_name: scope.task_name.clone(),
                    executed_at: started_at,
                    status,
                    duration_seconds,
                    details,
                    kind: scope.kind,
                    source: scope.source,
                })
                .context("record execution")?,
        };

        if let Some(message) = error_message {
            self.db
                .increment_error(&scope.user_id, &format!("{}: {message}", scope.task_name))
                .context("increment heartbeat error count")?;
        }
        self.db
            .touch_heartbeat(&scope.user_id, Utc::now())
            .context("touch heartbeat")?;
        Ok(execution_id)
    }

    /// Record a `skipped` row without running anything.
    pub fn skip(&self, scope: &ExecutionScope, reason: &str) -> Result<i64> {
        tracing::info!(
            user_id = %scope.user_id,
            task = %scope.task_name,
            reason,
            "task execution skipped"
        );
        self.db
            .record_execution(&NewExecution {
                user_id: scope.user_id.clone(),
                task_name: scope.task_name.clone(),
                executed_at: Utc::now(),
                status: ExecutionStatus::Skipped,
                duration_seconds: 0.0,
                details: json!({ "reason": reason }),
                kind: scope.kind,
                source: scope.source,
            })
            .context("record skipped execution")
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panic: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panic: {message}")
    } else {
        "panic: <non-string payload>".to_string()
    }
}
