/*
[INPUT]:  Failures raised by the lifecycle manager and task bodies
[OUTPUT]: Typed errors for callers plus transient/fatal classification for the scheduler loop
[POS]:    Error handling layer - shared by lifecycle manager, wrapper and trading passes
[UPDATE]: When adding new refusal reasons or changing how task failures are classified
*/

use thiserror::Error;
use tradeloop_adapter::GatewayError;

use crate::task::state_machine::StateError;

/// Refusals and failures surfaced by start / stop / run-once.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Task name is not one of the known tasks
    #[error("unknown task: {0}")]
    UnknownTask(String),

    /// No services are registered for the user
    #[error("unknown user: {0}")]
    UnknownUser(String),

    /// Start refused because the same work may already be in progress
    #[error("conflict: {reason}")]
    Conflict { reason: String },

    /// Stop requested for a task with no live worker
    #[error("task {task} is not running for user {user_id}")]
    NotRunning { user_id: String, task: String },

    /// A task body raised a fatal error inside the unified loop
    #[error("{task} failed fatally for user {user_id}: {message}")]
    TaskFailed {
        user_id: String,
        task: String,
        message: String,
    },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl LifecycleError {
    pub fn conflict(reason: impl Into<String>) -> Self {
        LifecycleError::Conflict {
            reason: reason.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, LifecycleError::Conflict { .. })
    }
}

/// Failure raised from inside a task body.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Worth retrying on the next tick
    #[error("transient failure: {0}")]
    Transient(String),

    /// Broker session could not be re-established within the pass
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Scheduled worker must stop and report `failed`
    #[error("fatal failure: {0}")]
    Fatal(String),
}

impl TaskError {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskError::Transient(_) => "transient",
            TaskError::Authentication(_) => "authentication",
            TaskError::Fatal(_) => "fatal",
        }
    }
}

/// Whether a failed execution should end the scheduled worker.
///
/// Only an explicit [`TaskError::Fatal`] anywhere in the chain is fatal.
pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<TaskError>(), Some(TaskError::Fatal(_))))
}

/// Short classification recorded as `error_type` in ledger details.
pub fn error_type(err: &anyhow::Error) -> &'static str {
    for cause in err.chain() {
        if let Some(task_err) = cause.downcast_ref::<TaskError>() {
            return task_err.kind();
        }
        if let Some(gateway_err) = cause.downcast_ref::<GatewayError>() {
            if gateway_err.is_auth_error() {
                return "authentication";
            }
            if gateway_err.is_retryable() {
                return "transient";
            }
            return "gateway";
        }
    }
    "internal"
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context as _;

    #[test]
    fn test_fatal_detected_through_context() {
        let err = anyhow::Error::new(TaskError::Fatal("no broker configured".to_string()))
            .context("premarket_retry");
        assert!(is_fatal(&err));
        assert_eq!(error_type(&err), "fatal");
    }

    #[test]
    fn test_gateway_errors_are_not_fatal() {
        let result: Result<(), GatewayError> = Err(GatewayError::Timeout { duration: 30 });
        let err = result.context("fetch price").unwrap_err();
        assert!(!is_fatal(&err));
        assert_eq!(error_type(&err), "transient");

        let auth = anyhow::Error::new(GatewayError::TwoFactorRequired);
        assert_eq!(error_type(&auth), "authentication");
    }

    #[test]
    fn test_plain_errors_are_internal() {
        let err = anyhow::anyhow!("sqlite busy");
        assert!(!is_fatal(&err));
        assert_eq!(error_type(&err), "internal");
    }
}
