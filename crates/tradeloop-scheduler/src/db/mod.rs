/*
[INPUT]:  schema.sql, ledger/order/position row types, database path from config
[OUTPUT]: SQLite-backed Database pool shared by every task of the process
[POS]:    Persistence layer - ledger, heartbeat, retry queue, positions and schedule overrides
[UPDATE]: When schema.sql or persisted row shapes change
*/

mod executions;
mod orders;
mod positions;
mod schedules;

pub use executions::{
    ExecutionKind, ExecutionQuery, ExecutionSource, ExecutionStatus, NewExecution,
    ServiceHeartbeat, TaskExecution,
};
pub use orders::{NewOrder, Order, OrderStatus};
pub use positions::{NewPosition, PositionEntry, PositionStatus};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Serialize, de::DeserializeOwned};
use std::path::Path;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Cloneable handle to the SQLite pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: r2d2::Pool<SqliteConnectionManager>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create database directory {}", dir.display()))?;
        }

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            Ok(())
        });

        let pool = r2d2::Pool::new(manager).context("create sqlite pool")?;
        let db = Self { pool };
        db.run_migrations()?;
        tracing::debug!(path = %path.display(), "database opened");
        Ok(db)
    }

    /// Private in-memory database. Every pooled connection would see its own
    /// empty database, so the pool is pinned to a single connection.
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory().with_init(|conn| {
            conn.pragma_update(None, "foreign_keys", "ON")?;
            Ok(())
        });

        let pool = r2d2::Pool::builder()
            .max_size(1)
            .build(manager)
            .context("create in-memory sqlite pool")?;
        let db = Self { pool };
        db.run_migrations()?;
        Ok(db)
    }

    fn conn(&self) -> Result<PooledConnection> {
        self.pool.get().context("get sqlite connection")
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(include_str!("schema.sql"))
            .context("apply schema.sql")?;
        Ok(())
    }
}

fn encode_enum<T: Serialize>(value: &T) -> Result<String> {
    let serialized = serde_json::to_value(value).context("serialize enum")?;
    serialized
        .as_str()
        .map(str::to_string)
        .context("enum serialized as non-string")
}

fn decode_enum<T: DeserializeOwned>(value: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .with_context(|| format!("deserialize enum value {value:?}"))
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| anyhow!("timestamp out of range: {millis}"))
}

fn from_millis_opt(millis: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    millis.map(from_millis).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_database_applies_schema_twice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.db");

        let db = Database::open(&path).unwrap();
        db.get_or_create_heartbeat("u1").unwrap();
        drop(db);

        let reopened = Database::open(&path).unwrap();
        let heartbeat = reopened.get_or_create_heartbeat("u1").unwrap();
        assert_eq!(heartbeat.error_count, 0);
    }

    #[test]
    fn test_enum_helpers_round_trip_snake_case() {
        let encoded = encode_enum(&ExecutionKind::RunOnce).unwrap();
        assert_eq!(encoded, "run_once");
        let decoded: ExecutionKind = decode_enum(&encoded).unwrap();
        assert_eq!(decoded, ExecutionKind::RunOnce);
        assert!(decode_enum::<ExecutionKind>("hourly").is_err());
    }

    #[test]
    fn test_millis_conversion_keeps_millisecond_precision() {
        let at = DateTime::from_timestamp_millis(1_760_000_000_123).unwrap();
        assert_eq!(from_millis(to_millis(at)).unwrap(), at);
    }
}
