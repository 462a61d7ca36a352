/*
[INPUT]:  Schedule switches from `tradeloop schedule` and running task loops
[OUTPUT]: Persisted per-user enable/disable overrides
[POS]:    Persistence layer - schedule overrides shared across processes
[UPDATE]: When schedule overrides gain new fields
*/

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use super::{Database, to_millis};

impl Database {
    pub fn set_schedule_enabled(&self, user_id: &str, task_name: &str, enabled: bool) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO task_schedules (user_id, task_name, enabled, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, task_name) DO UPDATE SET enabled = excluded.enabled, updated_at = excluded.updated_at",
            params![user_id, task_name, enabled, to_millis(Utc::now())],
        )
        .context("save schedule override")?;
        Ok(())
    }

    /// `None` when no override was ever stored.
    pub fn schedule_override(&self, user_id: &str, task_name: &str) -> Result<Option<bool>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT enabled FROM task_schedules WHERE user_id = ?1 AND task_name = ?2",
            params![user_id, task_name],
            |row| row.get(0),
        )
        .optional()
        .context("load schedule override")
    }

    /// Stored override, else `default` from config.
    pub fn schedule_enabled_or(&self, user_id: &str, task_name: &str, default: bool) -> Result<bool> {
        Ok(self.schedule_override(user_id, task_name)?.unwrap_or(default))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_round_trip_and_isolation() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.schedule_override("u1", "sell_monitor").unwrap(), None);
        assert!(db.schedule_enabled_or("u1", "sell_monitor", true).unwrap());

        db.set_schedule_enabled("u1", "sell_monitor", false).unwrap();
        assert_eq!(db.schedule_override("u1", "sell_monitor").unwrap(), Some(false));
        assert_eq!(db.schedule_override("u2", "sell_monitor").unwrap(), None);
        assert!(!db.schedule_enabled_or("u1", "sell_monitor", true).unwrap());

        db.set_schedule_enabled("u1", "sell_monitor", true).unwrap();
        assert_eq!(db.schedule_override("u1", "sell_monitor").unwrap(), Some(true));
    }
}
