/*
[INPUT]:  Task names from config and the CLI, task bodies from the trading layer
[OUTPUT]: Known task names, the TaskRunner capability and the lifecycle manager
[POS]:    Execution layer - task identity and orchestration
[UPDATE]: When adding a task or changing the runner contract
*/

mod manager;
pub mod state_machine;

pub use manager::{RunOnceReport, TaskManager, TaskStatusView};
pub use state_machine::{StateError, TaskAction, TaskState, TaskStateMachine};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::LifecycleError;
use crate::wrapper::ExecutionContext;

/// Tasks the scheduler knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskName {
    /// Re-attempt orders queued as `retry_pending`
    PremarketRetry,
    /// Re-entry (averaging) buys on open positions
    PositionMonitor,
    /// Exit open positions once RSI recovers
    SellMonitor,
    /// Reset daily counters and reconcile positions with holdings
    EodCleanup,
}

impl TaskName {
    pub const ALL: [TaskName; 4] = [
        TaskName::PremarketRetry,
        TaskName::PositionMonitor,
        TaskName::SellMonitor,
        TaskName::EodCleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskName::PremarketRetry => "premarket_retry",
            TaskName::PositionMonitor => "position_monitor",
            TaskName::SellMonitor => "sell_monitor",
            TaskName::EodCleanup => "eod_cleanup",
        }
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskName {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        TaskName::ALL
            .into_iter()
            .find(|task| task.as_str() == normalized)
            .ok_or_else(|| LifecycleError::UnknownTask(s.to_string()))
    }
}

/// Fixed capability every task body implementation provides.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Run one pass of `task` for `user_id`, writing progress into `ctx`.
    async fn run(&self, user_id: &str, task: TaskName, ctx: &ExecutionContext) -> anyhow::Result<()>;
}
