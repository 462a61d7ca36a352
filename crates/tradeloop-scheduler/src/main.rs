/*
[INPUT]:  CLI arguments, YAML configuration file, OS shutdown signals
[OUTPUT]: Unified or individual task services, one-off runs, status/history/log reports
[POS]:    Binary entry point
[UPDATE]: When changing CLI subcommands, startup flow, or shutdown handling
*/

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tradeloop_scheduler::db::{ExecutionKind, ExecutionQuery, ExecutionStatus};
use tradeloop_scheduler::telemetry::{self, LogQuery};
use tradeloop_scheduler::{
    Database, LifecycleError, SchedulerConfig, ServiceRegistry, TaskManager, TaskName,
    TradingTasks, UnifiedService,
};

#[derive(Parser, Debug)]
#[command(name = "tradeloop", version, about = "Scheduled order retry and position re-entry")]
struct Cli {
    /// Defaults to <config dir>/tradeloop/config.yaml
    #[arg(long = "config", value_name = "PATH", global = true)]
    config_path: Option<PathBuf>,
    /// Overrides `log_level` from the config file
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every scheduled task from one loop per user
    Unified {
        /// Limit to these users; defaults to all configured users
        #[arg(long = "user")]
        users: Vec<String>,
        /// Clear a stale service_running flag left by a crashed process
        #[arg(long)]
        force: bool,
    },
    /// Start individual scheduled tasks and run until SIGINT/SIGTERM
    Start {
        #[arg(long)]
        user: String,
        #[arg(long = "task", required = true)]
        tasks: Vec<TaskName>,
    },
    /// Execute one task immediately
    RunOnce {
        #[arg(long)]
        user: String,
        #[arg(long)]
        task: TaskName,
        #[arg(long, default_value = "run_once")]
        kind: ExecutionKind,
    },
    /// Per-task state, last and next execution
    Status {
        #[arg(long)]
        user: String,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Execution ledger, most recent first
    History {
        #[arg(long)]
        user: String,
        #[arg(long)]
        task: Option<TaskName>,
        #[arg(long)]
        status: Option<ExecutionStatus>,
        #[arg(long)]
        kind: Option<ExecutionKind>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Query the JSON log file
    Logs {
        #[arg(long)]
        level: Option<String>,
        #[arg(long)]
        module: Option<String>,
        #[arg(long)]
        hours: Option<u32>,
        #[arg(long, default_value_t = 100)]
        limit: usize,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Enable or disable a task's schedule for a user
    Schedule {
        #[arg(long)]
        user: String,
        #[arg(long)]
        task: TaskName,
        #[arg(long, conflicts_with = "disable", required_unless_present = "disable")]
        enable: bool,
        #[arg(long)]
        disable: bool,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
    Yaml,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let config_path = args.config_path.clone().unwrap_or_else(default_config_path);
    let config = SchedulerConfig::from_file(&config_path)
        .with_context(|| format!("load config {}", config_path.display()))?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log_level);
    telemetry::init_tracing(log_level, config.log_path.as_deref())?;

    match args.command {
        Command::Unified { users, force } => run_unified(&config, users, force).await,
        Command::Start { user, tasks } => run_individual(&config, &user, &tasks).await,
        Command::RunOnce { user, task, kind } => {
            ensure_user(&config, &user)?;
            let manager = build_manager(&config)?;
            let report = manager.run_once(&user, task.as_str(), kind).await?;
            println!(
                "execution {} {} ({:.2}s): {}",
                report.execution_id, report.status, report.duration_seconds, report.message
            );
            if report.status == ExecutionStatus::Failed {
                bail!("execution {} failed", report.execution_id);
            }
            Ok(())
        }
        Command::Status { user, format } => {
            let manager = build_manager(&config)?;
            let views = manager.status(&user).await?;
            match format {
                OutputFormat::Text => {
                    println!(
                        "{:<18} {:<9} {:<8} {:<8} {:<10} {:<26} {:<26}",
                        "TASK", "STATE", "RUNNING", "ENABLED", "LAST", "LAST AT", "NEXT AT"
                    );
                    for (task, view) in &views {
                        println!(
                            "{:<18} {:<9} {:<8} {:<8} {:<10} {:<26} {:<26}",
                            task,
                            format!("{:?}", view.state).to_lowercase(),
                            view.is_running,
                            view.schedule_enabled,
                            view.last_execution_status
                                .map(|status| status.to_string())
                                .unwrap_or_else(|| "-".to_string()),
                            view.last_execution_at
                                .map(|at| at.to_rfc3339())
                                .unwrap_or_else(|| "-".to_string()),
                            view.next_execution_at
                                .map(|at| at.to_rfc3339())
                                .unwrap_or_else(|| "-".to_string()),
                        );
                    }
                    Ok(())
                }
                other => print_structured(&views, other),
            }
        }
        Command::History {
            user,
            task,
            status,
            kind,
            limit,
            format,
        } => {
            let db = Database::open(&config.database_path)?;
            let rows = db.list_executions(&ExecutionQuery {
                task_name: task.map(|task| task.to_string()),
                status,
                kind,
                limit,
                ..ExecutionQuery::for_user(user)
            })?;
            match format {
                OutputFormat::Text => {
                    for row in &rows {
                        println!(
                            "{:>6} {} {:<18} {:<8} {:<9} {:<10} {:>8.2}s",
                            row.id,
                            row.executed_at.to_rfc3339(),
                            row.task_name,
                            row.status,
                            row.kind,
                            row.source,
                            row.duration_seconds
                        );
                    }
                    Ok(())
                }
                other => print_structured(&rows, other),
            }
        }
        Command::Logs {
            level,
            module,
            hours,
            limit,
            format,
        } => {
            let Some(log_path) = config.log_path.as_deref() else {
                bail!("log_path is not configured; nothing to query");
            };
            let entries = telemetry::query_logs(
                log_path,
                &LogQuery {
                    level,
                    module,
                    hours,
                    limit,
                },
            )?;
            match format {
                OutputFormat::Text => {
                    for entry in &entries {
                        println!(
                            "{} {:<5} {} {}",
                            entry.timestamp.to_rfc3339(),
                            entry.level,
                            entry.target,
                            entry.message
                        );
                    }
                    Ok(())
                }
                other => print_structured(&entries, other),
            }
        }
        Command::Schedule {
            user,
            task,
            enable,
            disable,
        } => {
            ensure_user(&config, &user)?;
            let manager = build_manager(&config)?;
            let enabled = enable && !disable;
            manager.set_schedule_enabled(&user, task.as_str(), enabled)?;
            println!(
                "{task} schedule {} for user {user}",
                if enabled { "enabled" } else { "disabled" }
            );
            Ok(())
        }
        Command::Config => {
            print!("{}", config.to_yaml()?);
            Ok(())
        }
    }
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tradeloop")
        .join("config.yaml")
}

fn ensure_user(config: &SchedulerConfig, user_id: &str) -> Result<(), LifecycleError> {
    match config.user(user_id) {
        Some(_) => Ok(()),
        None => Err(LifecycleError::UnknownUser(user_id.to_string())),
    }
}

fn build_runner(config: &SchedulerConfig, db: &Database) -> Result<Arc<TradingTasks>> {
    let registry = ServiceRegistry::from_config(config).context("build user services")?;
    Ok(Arc::new(TradingTasks::new(db.clone(), Arc::new(registry))))
}

fn build_manager(config: &SchedulerConfig) -> Result<TaskManager> {
    let db = Database::open(&config.database_path)?;
    let runner = build_runner(config, &db)?;
    Ok(TaskManager::new(db, runner, config))
}

async fn run_unified(config: &SchedulerConfig, users: Vec<String>, force: bool) -> Result<()> {
    let users = if users.is_empty() {
        config.users.iter().map(|user| user.id.clone()).collect()
    } else {
        users
    };
    if users.is_empty() {
        bail!("no users configured");
    }
    for user in &users {
        ensure_user(config, user)?;
    }

    let db = Database::open(&config.database_path)?;
    let runner = build_runner(config, &db)?;
    let service = Arc::new(UnifiedService::new(db, runner, config));

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());

    info!(users = users.len(), "starting unified services");
    let mut handles = Vec::with_capacity(users.len());
    for user in users {
        let service = service.clone();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let result = service.run(&user, shutdown, force).await;
            (user, result)
        }));
    }

    let mut failed = false;
    for handle in handles {
        match handle.await {
            Ok((_, Ok(()))) => {}
            Ok((user, Err(err))) => {
                warn!(user_id = %user, error = %err, "unified service refused or failed");
                failed = true;
            }
            Err(join_err) => {
                warn!(error = %join_err, "unified service task panicked");
                failed = true;
            }
        }
    }
    info!("unified services shutdown complete");
    if failed {
        bail!("one or more unified services did not run cleanly");
    }
    Ok(())
}

async fn run_individual(config: &SchedulerConfig, user: &str, tasks: &[TaskName]) -> Result<()> {
    ensure_user(config, user)?;
    let manager = build_manager(config)?;
    let shutdown = manager.shutdown_token();
    setup_signal_handlers(shutdown.clone());

    for task in tasks {
        let message = manager.start(user, task.as_str()).await?;
        info!("{message}");
    }

    shutdown.cancelled().await;
    info!("shutdown signal received");

    manager
        .shutdown_and_wait()
        .await
        .context("shutdown tasks")?;
    info!("tasks shutdown complete");
    Ok(())
}

fn print_structured<T: Serialize>(value: &T, format: OutputFormat) -> Result<()> {
    let rendered = match format {
        OutputFormat::Yaml => serde_yaml::to_string(value).context("render yaml")?,
        _ => serde_json::to_string_pretty(value).context("render json")?,
    };
    println!("{rendered}");
    Ok(())
}

fn setup_signal_handlers(shutdown: CancellationToken) {
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install SIGINT handler");
            return;
        }
        info!("received SIGINT");
        shutdown_clone.cancel();
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let shutdown_clone = shutdown.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    info!("received SIGTERM");
                    shutdown_clone.cancel();
                }
                Err(err) => {
                    warn!(error = %err, "failed to install SIGTERM handler");
                }
            }
        });
    }
}
