/*
[INPUT]:  Public API exports for the tradeloop-scheduler crate
[OUTPUT]: Module declarations and public re-exports
[POS]:    Crate root - library entry point
[UPDATE]: When adding new modules or public exports
*/

pub mod config;
pub mod conflict;
pub mod db;
pub mod error;
pub mod registry;
pub mod sizing;
pub mod task;
pub mod telemetry;
pub mod trading;
pub mod unified;
pub mod wrapper;

// Re-export main types for convenience
pub use config::SchedulerConfig;
pub use conflict::{ConflictCheck, ConflictDetector};
pub use db::Database;
pub use error::{LifecycleError, TaskError};
pub use registry::{ServiceRegistry, UserServices};
pub use task::{TaskManager, TaskName, TaskRunner};
pub use trading::TradingTasks;
pub use unified::UnifiedService;
pub use wrapper::{ExecutionContext, ExecutionScope, ExecutionTracker};
