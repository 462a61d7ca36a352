/*
[INPUT]:  ServiceRegistry (per-user gateways + limits), Database, ExecutionContext
[OUTPUT]: TaskRunner that dispatches each TaskName to its trading pass
[POS]:    Trading layer - task bodies for retry, re-entry, exit and cleanup
[UPDATE]: When adding a task body or changing re-login rules
*/

pub mod cleanup;
pub mod exit;
pub mod reentry;
pub mod retry;

use anyhow::Result;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tradeloop_adapter::{BrokerGateway, GatewayError};

use crate::db::Database;
use crate::error::TaskError;
use crate::registry::ServiceRegistry;
use crate::task::{TaskName, TaskRunner};
use crate::wrapper::ExecutionContext;

/// Production [`TaskRunner`]: resolves the user's services and runs the pass.
#[derive(Clone)]
pub struct TradingTasks {
    db: Database,
    registry: Arc<ServiceRegistry>,
}

impl TradingTasks {
    pub fn new(db: Database, registry: Arc<ServiceRegistry>) -> Self {
        Self { db, registry }
    }
}

#[async_trait]
impl TaskRunner for TradingTasks {
    async fn run(&self, user_id: &str, task: TaskName, ctx: &ExecutionContext) -> Result<()> {
        let services = self.registry.get(user_id).ok_or_else(|| {
            TaskError::Fatal(format!("no broker services registered for user {user_id}"))
        })?;

        match task {
            TaskName::PremarketRetry => {
                let summary = retry::run_retry_pass(&self.db, &services, user_id, ctx).await?;
                ctx.insert("summary", serde_json::to_value(&summary)?);
            }
            TaskName::PositionMonitor => {
                let summary = reentry::run_reentry_pass(&self.db, &services, user_id, ctx).await?;
                ctx.insert("summary", serde_json::to_value(&summary)?);
            }
            TaskName::SellMonitor => {
                let summary = exit::run_exit_pass(&self.db, &services, user_id, ctx).await?;
                ctx.insert("summary", serde_json::to_value(&summary)?);
            }
            TaskName::EodCleanup => {
                let summary = cleanup::run_cleanup_pass(&self.db, &services, user_id, ctx).await?;
                ctx.insert("summary", serde_json::to_value(&summary)?);
            }
        }
        Ok(())
    }
}

/// Why a broker step did not produce a value.
#[derive(Debug)]
pub(crate) enum StepError {
    /// Per-symbol failure; the pass moves on to the next symbol
    Gateway(GatewayError),
    /// Session is gone for this pass; nothing further may be placed
    Abort(TaskError),
}

impl From<StepError> for anyhow::Error {
    fn from(err: StepError) -> Self {
        match err {
            StepError::Gateway(err) => anyhow::Error::new(err),
            StepError::Abort(err) => anyhow::Error::new(err),
        }
    }
}

/// Broker calls of one pass, allowing exactly one forced re-login.
pub(crate) struct SessionGuard<'a> {
    broker: &'a dyn BrokerGateway,
    relogin_used: bool,
}

impl<'a> SessionGuard<'a> {
    pub(crate) fn new(broker: &'a dyn BrokerGateway) -> Self {
        Self {
            broker,
            relogin_used: false,
        }
    }

    pub(crate) fn broker(&self) -> &'a dyn BrokerGateway {
        self.broker
    }

    /// Run `op`; on an authentication error re-login once per pass and retry it.
    /// A second authentication error, or a refused re-login, aborts the pass.
    pub(crate) async fn call<T, F, Fut>(&mut self, mut op: F) -> Result<T, StepError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = tradeloop_adapter::Result<T>>,
    {
        match op().await {
            Ok(value) => Ok(value),
            Err(err) if err.is_auth_error() => {
                self.relogin(&err).await?;
                match op().await {
                    Ok(value) => Ok(value),
                    Err(err) if err.is_auth_error() => Err(StepError::Abort(
                        TaskError::Authentication(format!("rejected after re-login: {err}")),
                    )),
                    Err(err) => Err(StepError::Gateway(err)),
                }
            }
            Err(err) => Err(StepError::Gateway(err)),
        }
    }

    async fn relogin(&mut self, cause: &GatewayError) -> Result<(), StepError> {
        if self.relogin_used {
            return Err(StepError::Abort(TaskError::Authentication(format!(
                "session lost again after re-login: {cause}"
            ))));
        }
        self.relogin_used = true;
        tracing::warn!(error = %cause, "broker session rejected, forcing re-login");

        match self.broker.force_relogin().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(StepError::Abort(TaskError::Authentication(
                "broker refused re-login".to_string(),
            ))),
            Err(err) => Err(StepError::Abort(TaskError::Authentication(format!(
                "re-login failed: {err}"
            )))),
        }
    }

    #[cfg(test)]
    fn relogin_used(&self) -> bool {
        self.relogin_used
    }
}
