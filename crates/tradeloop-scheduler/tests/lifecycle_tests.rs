/*
[INPUT]:  Scripted TaskRunner, in-memory ledger, paused tokio clock
[OUTPUT]: Test results for start/stop/run-once/status and the unified service
[POS]:    Integration tests - lifecycle manager and unified loop
[UPDATE]: When lifecycle guarantees or conflict rules change
*/

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{Script, ScriptedRunner, USER, test_config, wait_until};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;
use tradeloop_scheduler::config::TaskSchedule;
use tradeloop_scheduler::db::{
    ExecutionKind, ExecutionQuery, ExecutionSource, ExecutionStatus, NewExecution, TaskExecution,
};
use tradeloop_scheduler::task::TaskState;
use tradeloop_scheduler::{Database, LifecycleError, TaskManager, TaskName, UnifiedService};

fn manager(db: &Database, runner: &Arc<ScriptedRunner>) -> TaskManager {
    TaskManager::new(db.clone(), runner.clone(), &test_config())
}

fn rows(db: &Database, task: TaskName) -> Vec<TaskExecution> {
    db.list_executions(&ExecutionQuery {
        task_name: Some(task.to_string()),
        ..ExecutionQuery::for_user(USER)
    })
    .unwrap()
}

fn seed_row(db: &Database, task: TaskName, source: ExecutionSource, status: ExecutionStatus, age_secs: i64) {
    db.record_execution(&NewExecution {
        user_id: USER.to_string(),
        task_name: task.to_string(),
        executed_at: Utc::now() - ChronoDuration::seconds(age_secs),
        status,
        duration_seconds: 0.5,
        details: json!({}),
        kind: ExecutionKind::Scheduled,
        source,
    })
    .unwrap();
}

// ---- individual path ----

#[tokio::test]
async fn test_start_runs_immediately_and_stop_ends_worker() {
    let db = Database::open_in_memory().unwrap();
    let runner = ScriptedRunner::new(Script::Succeed);
    let manager = manager(&db, &runner);

    let message = assert_ok!(manager.start(USER, "sell_monitor").await);
    assert!(message.contains("sell_monitor started"));
    assert!(wait_until(Duration::from_secs(2), || runner.calls() >= 1).await);

    let status = manager.status(USER).await.unwrap();
    let view = &status["sell_monitor"];
    assert_eq!(view.state, TaskState::Running);
    assert!(view.is_running);
    assert!(view.started_at.is_some());
    assert_eq!(view.process_id, std::process::id());
    assert_eq!(status["eod_cleanup"].state, TaskState::Stopped);

    manager.stop(USER, "sell_monitor").await.unwrap();
    let status = manager.status(USER).await.unwrap();
    assert_eq!(status["sell_monitor"].state, TaskState::Stopped);
    assert_eq!(status["sell_monitor"].last_execution_status, Some(ExecutionStatus::Success));

    let ledger = rows(&db, TaskName::SellMonitor);
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].kind, ExecutionKind::Scheduled);
    assert_eq!(ledger[0].source, ExecutionSource::Individual);
    assert_eq!(ledger[0].details["task"], "sell_monitor");
}

#[tokio::test]
async fn test_unknown_task_is_rejected_without_ledger_rows() {
    let db = Database::open_in_memory().unwrap();
    let runner = ScriptedRunner::new(Script::Succeed);
    let manager = manager(&db, &runner);

    let err = manager.start(USER, "daily_report").await.unwrap_err();
    assert!(matches!(err, LifecycleError::UnknownTask(_)));
    let err = manager
        .run_once(USER, "daily_report", ExecutionKind::RunOnce)
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::UnknownTask(_)));

    assert!(db.list_executions(&ExecutionQuery::for_user(USER)).unwrap().is_empty());
    assert_eq!(runner.calls(), 0);
}

#[tokio::test]
async fn test_second_start_in_same_process_conflicts() {
    let db = Database::open_in_memory().unwrap();
    let runner = ScriptedRunner::new(Script::Block);
    let manager = manager(&db, &runner);

    manager.start(USER, "position_monitor").await.unwrap();
    let err = manager.start(USER, "position_monitor").await.unwrap_err();
    assert!(err.is_conflict());

    manager.shutdown_and_wait().await.unwrap();
}

#[tokio::test]
async fn test_start_refused_while_unified_runs_with_recent_row() {
    let db = Database::open_in_memory().unwrap();
    db.set_service_running(USER, true, Utc::now()).unwrap();
    seed_row(&db, TaskName::SellMonitor, ExecutionSource::Unified, ExecutionStatus::Success, 30);
    let runner = ScriptedRunner::new(Script::Succeed);
    let manager = manager(&db, &runner);

    let err = manager.start(USER, "sell_monitor").await.unwrap_err();
    match err {
        LifecycleError::Conflict { reason } => assert!(reason.contains("unified"), "{reason}"),
        other => panic!("expected conflict, got {other:?}"),
    }

    let err = manager
        .run_once(USER, "sell_monitor", ExecutionKind::Manual)
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(runner.calls(), 0);
}

#[tokio::test]
async fn test_run_once_records_one_row() {
    let db = Database::open_in_memory().unwrap();
    let runner = ScriptedRunner::new(Script::Succeed);
    let manager = manager(&db, &runner);

    let report = manager
        .run_once(USER, "premarket_retry", ExecutionKind::RunOnce)
        .await
        .unwrap();
    assert_eq!(report.status, ExecutionStatus::Success);

    let ledger = rows(&db, TaskName::PremarketRetry);
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].id, report.execution_id);
    assert_eq!(ledger[0].kind, ExecutionKind::RunOnce);
    assert!(db.running_executions(USER, None, None).unwrap().is_empty());

    // a second run inside the window is refused
    let err = manager
        .run_once(USER, "premarket_retry", ExecutionKind::RunOnce)
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(runner.calls(), 1);
}

#[tokio::test]
async fn test_run_once_failure_is_recorded() {
    let db = Database::open_in_memory().unwrap();
    let runner = ScriptedRunner::new(Script::FailTransient);
    let manager = manager(&db, &runner);

    let report = manager
        .run_once(USER, "eod_cleanup", ExecutionKind::Manual)
        .await
        .unwrap();
    assert_eq!(report.status, ExecutionStatus::Failed);
    assert!(report.message.contains("broker timeout"));

    let ledger = rows(&db, TaskName::EodCleanup);
    assert_eq!(ledger[0].status, ExecutionStatus::Failed);
    assert_eq!(ledger[0].details["error_type"], "transient");
    assert_eq!(db.get_or_create_heartbeat(USER).unwrap().error_count, 1);
}

#[tokio::test]
async fn test_run_once_ignores_disabled_schedule() {
    let db = Database::open_in_memory().unwrap();
    let runner = ScriptedRunner::new(Script::Succeed);
    let manager = manager(&db, &runner);
    manager.set_schedule_enabled(USER, "sell_monitor", false).unwrap();

    let report = manager
        .run_once(USER, "sell_monitor", ExecutionKind::RunOnce)
        .await
        .unwrap();
    assert_eq!(report.status, ExecutionStatus::Success);
    assert!(!manager.schedule_enabled(USER, TaskName::SellMonitor).unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_fatal_error_moves_worker_to_failed() {
    let db = Database::open_in_memory().unwrap();
    let runner = ScriptedRunner::new(Script::FailFatal);
    let manager = manager(&db, &runner);

    manager.start(USER, "position_monitor").await.unwrap();
    let mut failed = false;
    for _ in 0..50 {
        let status = manager.status(USER).await.unwrap();
        if status["position_monitor"].state == TaskState::Failed {
            let last_error = status["position_monitor"].last_error.clone().unwrap();
            assert!(last_error.contains("account disabled"));
            failed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(failed);
    assert_eq!(runner.calls(), 1);

    let err = manager.stop(USER, "position_monitor").await.unwrap_err();
    assert!(matches!(err, LifecycleError::NotRunning { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_transient_errors_keep_worker_running() {
    let db = Database::open_in_memory().unwrap();
    let runner = ScriptedRunner::new(Script::FailTransient);
    let manager = manager(&db, &runner).with_schedule(
        TaskName::SellMonitor,
        TaskSchedule {
            interval_secs: 1,
            enabled: true,
        },
    );

    manager.start(USER, "sell_monitor").await.unwrap();
    assert!(wait_until(Duration::from_secs(10), || runner.calls() >= 3).await);
    let status = manager.status(USER).await.unwrap();
    assert_eq!(status["sell_monitor"].state, TaskState::Running);

    manager.shutdown_and_wait().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_disabled_schedule_skips_ticks() {
    let db = Database::open_in_memory().unwrap();
    let runner = ScriptedRunner::new(Script::Succeed);
    let manager = manager(&db, &runner);
    manager.set_schedule_enabled(USER, "sell_monitor", false).unwrap();

    manager.start(USER, "sell_monitor").await.unwrap();
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(runner.calls(), 0);
    assert!(!manager.status(USER).await.unwrap()["sell_monitor"].schedule_enabled);

    manager.stop(USER, "sell_monitor").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_loop_skips_while_unified_runs() {
    let db = Database::open_in_memory().unwrap();
    let runner = ScriptedRunner::new(Script::Succeed);
    let manager = manager(&db, &runner).with_schedule(
        TaskName::SellMonitor,
        TaskSchedule {
            interval_secs: 1,
            enabled: true,
        },
    );

    manager.start(USER, "sell_monitor").await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || runner.calls() >= 1).await);
    db.set_service_running(USER, true, Utc::now()).unwrap();

    let skipped = wait_until(Duration::from_secs(10), || {
        rows(&db, TaskName::SellMonitor)
            .iter()
            .any(|row| row.status == ExecutionStatus::Skipped)
    })
    .await;
    assert!(skipped);
    let calls = runner.calls();

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(runner.calls(), calls);
    manager.stop(USER, "sell_monitor").await.unwrap();
}

#[tokio::test]
async fn test_stop_cancels_in_flight_execution() {
    let db = Database::open_in_memory().unwrap();
    let runner = ScriptedRunner::new(Script::Block);
    let manager = manager(&db, &runner);

    manager.start(USER, "eod_cleanup").await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || runner.calls() >= 1).await);
    assert_eq!(db.running_executions(USER, None, None).unwrap().len(), 1);

    manager.stop(USER, "eod_cleanup").await.unwrap();
    assert!(db.running_executions(USER, None, None).unwrap().is_empty());
    assert_eq!(rows(&db, TaskName::EodCleanup)[0].status, ExecutionStatus::Success);
}

#[tokio::test]
async fn test_stop_without_worker() {
    let db = Database::open_in_memory().unwrap();
    let runner = ScriptedRunner::new(Script::Succeed);
    let manager = manager(&db, &runner);

    let err = manager.stop(USER, "sell_monitor").await.unwrap_err();
    assert!(matches!(err, LifecycleError::NotRunning { .. }));
}

#[tokio::test]
async fn test_shutdown_and_wait_stops_every_worker() {
    let db = Database::open_in_memory().unwrap();
    let runner = ScriptedRunner::new(Script::Block);
    let manager = manager(&db, &runner);

    manager.start(USER, "sell_monitor").await.unwrap();
    manager.start(USER, "position_monitor").await.unwrap();
    assert_ok!(manager.shutdown_and_wait().await);

    let status = manager.status(USER).await.unwrap();
    assert_eq!(status["sell_monitor"].state, TaskState::Stopped);
    assert_eq!(status["position_monitor"].state, TaskState::Stopped);
}

// ---- unified path ----

#[tokio::test]
async fn test_unified_runs_every_task_and_clears_flag() {
    let db = Database::open_in_memory().unwrap();
    let runner = ScriptedRunner::new(Script::Succeed);
    let service = Arc::new(UnifiedService::new(db.clone(), runner.clone(), &test_config()));
    let shutdown = CancellationToken::new();

    let handle = {
        let service = service.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { service.run(USER, shutdown, false).await })
    };
    assert!(wait_until(Duration::from_secs(2), || runner.calls() >= 4).await);
    assert!(db.get_or_create_heartbeat(USER).unwrap().service_running);

    shutdown.cancel();
    handle.await.unwrap().unwrap();

    let heartbeat = db.get_or_create_heartbeat(USER).unwrap();
    assert!(!heartbeat.service_running);
    assert!(heartbeat.last_task_execution.is_some());
    for task in TaskName::ALL {
        let ledger = rows(&db, task);
        assert_eq!(ledger.len(), 1, "{task}");
        assert_eq!(ledger[0].source, ExecutionSource::Unified);
    }
}

#[tokio::test]
async fn test_unified_skips_task_with_recent_individual_run() {
    let db = Database::open_in_memory().unwrap();
    seed_row(&db, TaskName::SellMonitor, ExecutionSource::Individual, ExecutionStatus::Success, 10);
    let runner = ScriptedRunner::new(Script::Succeed);
    let service = Arc::new(UnifiedService::new(db.clone(), runner.clone(), &test_config()));
    let shutdown = CancellationToken::new();

    let handle = {
        let service = service.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { service.run(USER, shutdown, false).await })
    };
    assert!(wait_until(Duration::from_secs(2), || runner.calls() >= 3).await);
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    assert!(runner.seen().iter().all(|(_, task)| *task != TaskName::SellMonitor));
    let skipped: Vec<_> = rows(&db, TaskName::SellMonitor)
        .into_iter()
        .filter(|row| row.status == ExecutionStatus::Skipped)
        .collect();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].source, ExecutionSource::Unified);
}

#[tokio::test]
async fn test_unified_refused_while_individual_execution_runs() {
    let db = Database::open_in_memory().unwrap();
    seed_row(&db, TaskName::PremarketRetry, ExecutionSource::Individual, ExecutionStatus::Running, 5);
    let runner = ScriptedRunner::new(Script::Succeed);
    let service = UnifiedService::new(db.clone(), runner.clone(), &test_config());

    let err = service
        .run(USER, CancellationToken::new(), false)
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert!(!db.get_or_create_heartbeat(USER).unwrap().service_running);
    assert_eq!(runner.calls(), 0);
}

#[tokio::test]
async fn test_unified_force_clears_stale_flag() {
    let db = Database::open_in_memory().unwrap();
    db.set_service_running(USER, true, Utc::now() - ChronoDuration::hours(6)).unwrap();
    let runner = ScriptedRunner::new(Script::Succeed);
    let service = UnifiedService::new(db.clone(), runner.clone(), &test_config());

    let err = service
        .run(USER, CancellationToken::new(), false)
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    let shutdown = CancellationToken::new();
    shutdown.cancel();
    assert_ok!(service.run(USER, shutdown, true).await);
    assert!(!db.get_or_create_heartbeat(USER).unwrap().service_running);
}

#[tokio::test]
async fn test_unified_transient_errors_do_not_stop_loop() {
    let db = Database::open_in_memory().unwrap();
    let runner = ScriptedRunner::new(Script::FailTransient);
    let service = Arc::new(
        UnifiedService::new(db.clone(), runner.clone(), &test_config())
            .with_tick(Duration::from_millis(50)),
    );
    let shutdown = CancellationToken::new();

    let handle = {
        let service = service.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { service.run(USER, shutdown, false).await })
    };
    assert!(wait_until(Duration::from_secs(2), || runner.calls() >= 4).await);
    assert!(!handle.is_finished());

    shutdown.cancel();
    assert_ok!(handle.await.unwrap());
    assert_eq!(db.get_or_create_heartbeat(USER).unwrap().error_count, 4);
}

#[tokio::test]
async fn test_unified_fatal_error_ends_service() {
    let db = Database::open_in_memory().unwrap();
    let runner = ScriptedRunner::new(Script::FailFatal);
    let service = UnifiedService::new(db.clone(), runner.clone(), &test_config())
        .with_tick(Duration::from_millis(50));

    let err = tokio::time::timeout(
        Duration::from_secs(2),
        service.run(USER, CancellationToken::new(), false),
    )
    .await
    .expect("fatal error ends the loop")
    .unwrap_err();
    match err {
        LifecycleError::TaskFailed { task, message, .. } => {
            assert_eq!(task, "premarket_retry");
            assert!(message.contains("account disabled"), "{message}");
        }
        other => panic!("expected fatal task error, got {other:?}"),
    }
    assert_eq!(runner.calls(), 1);

    let heartbeat = db.get_or_create_heartbeat(USER).unwrap();
    assert!(!heartbeat.service_running);
    assert_eq!(heartbeat.error_count, 1);
    let ledger = rows(&db, TaskName::PremarketRetry);
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].status, ExecutionStatus::Failed);
    assert_eq!(ledger[0].details["error_type"], "fatal");
    assert!(rows(&db, TaskName::SellMonitor).is_empty());
}

#[tokio::test]
async fn test_unified_panic_clears_flag() {
    let db = Database::open_in_memory().unwrap();
    let runner = ScriptedRunner::new(Script::Panic);
    let service = Arc::new(UnifiedService::new(db.clone(), runner.clone(), &test_config()));

    let handle = {
        let service = service.clone();
        tokio::spawn(async move { service.run(USER, CancellationToken::new(), false).await })
    };
    let err = handle.await.unwrap_err();
    assert!(err.is_panic());

    assert!(!db.get_or_create_heartbeat(USER).unwrap().service_running);
    let ledger = rows(&db, TaskName::PremarketRetry);
    assert_eq!(ledger[0].status, ExecutionStatus::Failed);
    assert_eq!(ledger[0].details["error_type"], "panic");
}
