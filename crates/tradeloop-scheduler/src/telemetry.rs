/*
[INPUT]:  Log filter and optional log file path from config/CLI; JSON log lines for queries
[OUTPUT]: Global tracing subscriber (stdout + JSON file) and filtered log reads
[POS]:    Observability layer - logging setup and `tradeloop logs`
[UPDATE]: When log format, layers or log query filters change
*/

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global tracing subscriber with optional JSON file logging.
pub fn init_tracing(filter: &str, log_path: Option<&Path>) -> Result<()> {
    let env_filter = || EnvFilter::try_new(filter).context("invalid log level");
    let stdout_layer = fmt::layer().with_target(false).with_filter(env_filter()?);

    if let Some(path) = log_path {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        let (writer, guard) = tracing_appender::non_blocking(file);
        let _ = FILE_GUARD.set(guard);
        let file_layer = fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(true)
            .with_writer(writer)
            .with_filter(env_filter()?);
        tracing_subscriber::registry()
            .with(stdout_layer)
            .with(file_layer)
            .try_init()
            .context("initialize tracing subscriber")?;
    } else {
        tracing_subscriber::registry()
            .with(stdout_layer)
            .try_init()
            .context("initialize tracing subscriber")?;
    }

    Ok(())
}

/// Filters for [`query_logs`].
#[derive(Debug, Clone)]
pub struct LogQuery {
    /// Exact level, case-insensitive
    pub level: Option<String>,
    /// Target prefix or `::module` path segment
    pub module: Option<String>,
    pub hours: Option<u32>,
    pub limit: usize,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            level: None,
            module: None,
            hours: None,
            limit: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawLine {
    timestamp: String,
    level: String,
    #[serde(default)]
    target: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

/// Read the JSON log file and return matching entries, newest first.
///
/// Lines that are not JSON log records are skipped. A missing file yields no entries.
pub fn query_logs(path: &Path, query: &LogQuery) -> Result<Vec<LogEntry>> {
    query_logs_at(path, query, Utc::now())
}

pub fn query_logs_at(path: &Path, query: &LogQuery, now: DateTime<Utc>) -> Result<Vec<LogEntry>> {
    if query.limit == 0 || !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).with_context(|| format!("open log file {}", path.display()))?;
    let cutoff = query
        .hours
        .map(|hours| now - ChronoDuration::hours(i64::from(hours)));

    let mut newest: VecDeque<LogEntry> = VecDeque::with_capacity(query.limit);
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("read log file {}", path.display()))?;
        let Some(entry) = parse_line(&line) else {
            continue;
        };
        if !matches(&entry, query, cutoff) {
            continue;
        }
        if newest.len() == query.limit {
            newest.pop_front();
        }
        newest.push_back(entry);
    }

    let mut entries: Vec<LogEntry> = newest.into_iter().collect();
    entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    Ok(entries)
}

fn parse_line(line: &str) -> Option<LogEntry> {
    let raw: RawLine = serde_json::from_str(line.trim()).ok()?;
    let timestamp = DateTime::parse_from_rfc3339(&raw.timestamp)
        .ok()?
        .with_timezone(&Utc);
    let mut fields = raw.fields;
    let message = match fields.remove("message") {
        Some(Value::String(message)) => message,
        Some(other) => other.to_string(),
        None => String::new(),
    };
    Some(LogEntry {
        timestamp,
        level: raw.level,
        target: raw.target,
        message,
        fields,
    })
}

fn matches(entry: &LogEntry, query: &LogQuery, cutoff: Option<DateTime<Utc>>) -> bool {
    if let Some(level) = &query.level {
        if !entry.level.eq_ignore_ascii_case(level) {
            return false;
        }
    }
    if let Some(module) = &query.module {
        let module = module.trim_start_matches("::");
        let segment = format!("::{module}");
        if !(entry.target.starts_with(module) || entry.target.contains(&segment)) {
            return false;
        }
    }
    if let Some(cutoff) = cutoff {
        if entry.timestamp < cutoff {
            return false;
        }
    }
    true
}
