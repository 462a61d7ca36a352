/*
[INPUT]:  Open positions and re-entry state changes from the monitor passes
[OUTPUT]: positions rows with typed re-entry state and daily re-entry counters
[POS]:    Persistence layer - position tracking
[UPDATE]: When position fields or re-entry bookkeeping change
*/

use super::{Database, decode_enum, encode_enum, from_millis, from_millis_opt, to_millis};
use crate::trading::reentry::ReentryState;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{OptionalExtension, params};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionEntry {
    pub id: i64,
    pub user_id: String,
    pub symbol: String,
    pub quantity: i64,
    pub entry_price: Decimal,
    pub state: ReentryState,
    pub status: PositionStatus,
    pub reentries_today: u32,
    pub reentry_day: Option<NaiveDate>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl PositionEntry {
    pub fn levels_taken(&self) -> usize {
        self.state.levels_taken()
    }

    pub fn reset_ready(&self) -> bool {
        self.state == ReentryState::ResetReady
    }

    /// Re-entries placed on `today`; a counter from an earlier day reads as zero.
    pub fn reentries_on(&self, today: NaiveDate) -> u32 {
        if self.reentry_day == Some(today) {
            self.reentries_today
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPosition {
    pub user_id: String,
    pub symbol: String,
    pub quantity: i64,
    pub entry_price: Decimal,
    pub state: ReentryState,
}

const POSITION_COLUMNS: &str = "id, user_id, symbol, quantity, entry_price, reentry_state, status, reentries_today, reentry_day, opened_at, closed_at";

impl Database {
    pub fn insert_position(&self, position: &NewPosition) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO positions (user_id, symbol, quantity, entry_price, reentry_state, status, opened_at) VALUES (?1, ?2, ?3, ?4, ?5, 'open', ?6)",
            params![
                position.user_id,
                position.symbol,
                position.quantity,
                position.entry_price.to_string(),
                encode_enum(&position.state)?,
                to_millis(Utc::now())
            ],
        )
        .context("insert position")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_position(&self, position_id: i64) -> Result<Option<PositionEntry>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {POSITION_COLUMNS} FROM positions WHERE id = ?1"),
                params![position_id],
                PositionRow::from_row,
            )
            .optional()
            .context("fetch position")?;
        row.map(PositionEntry::try_from).transpose()
    }

    pub fn list_open_positions(&self, user_id: &str) -> Result<Vec<PositionEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {POSITION_COLUMNS} FROM positions WHERE user_id = ?1 AND status = 'open' ORDER BY symbol ASC, id ASC"
            ))
            .context("prepare open position list")?;
        let rows = stmt
            .query_map(params![user_id], PositionRow::from_row)
            .context("query open positions")?;

        let mut positions = Vec::new();
        for row in rows {
            positions.push(PositionEntry::try_from(row?)?);
        }
        Ok(positions)
    }

    /// Persist quantity, entry price, re-entry state and counters of an open position.
    pub fn save_position(&self, position: &PositionEntry) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE positions SET quantity = ?2, entry_price = ?3, reentry_state = ?4, reentries_today = ?5, reentry_day = ?6 WHERE id = ?1 AND status = 'open'",
                params![
                    position.id,
                    position.quantity,
                    position.entry_price.to_string(),
                    encode_enum(&position.state)?,
                    position.reentries_today,
                    position.reentry_day.map(|day| day.to_string()),
                ],
            )
            .context("save position")?;
        Ok(updated == 1)
    }

    pub fn close_position(&self, position_id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE positions SET status = 'closed', closed_at = ?2 WHERE id = ?1 AND status = 'open'",
                params![position_id, to_millis(Utc::now())],
            )
            .context("close position")?;
        Ok(updated == 1)
    }

    /// Zero the daily re-entry counters of every open position of the user.
    pub fn reset_daily_reentries(&self, user_id: &str) -> Result<usize> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE positions SET reentries_today = 0, reentry_day = NULL WHERE user_id = ?1 AND status = 'open' AND (reentries_today != 0 OR reentry_day IS NOT NULL)",
            params![user_id],
        )
        .context("reset daily re-entries")
    }
}

struct PositionRow {
    id: i64,
    user_id: String,
    symbol: String,
    quantity: i64,
    entry_price: String,
    reentry_state: String,
    status: String,
    reentries_today: u32,
    reentry_day: Option<String>,
    opened_at: i64,
    closed_at: Option<i64>,
}

impl PositionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            symbol: row.get(2)?,
            quantity: row.get(3)?,
            entry_price: row.get(4)?,
            reentry_state: row.get(5)?,
            status: row.get(6)?,
            reentries_today: row.get(7)?,
            reentry_day: row.get(8)?,
            opened_at: row.get(9)?,
            closed_at: row.get(10)?,
        })
    }
}

impl TryFrom<PositionRow> for PositionEntry {
    type Error = anyhow::Error;

    fn try_from(row: PositionRow) -> Result<Self> {
        let reentry_day = row
            .reentry_day
            .as_deref()
            .map(NaiveDate::from_str)
            .transpose()
            .context("parse reentry_day")?;

        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            symbol: row.symbol,
            quantity: row.quantity,
            entry_price: Decimal::from_str(&row.entry_price)
                .with_context(|| format!("parse entry_price of position {}", row.id))?,
            state: decode_enum(&row.reentry_state)?,
            status: decode_enum(&row.status)?,
            reentries_today: row.reentries_today,
            reentry_day,
            opened_at: from_millis(row.opened_at)?,
            closed_at: from_millis_opt(row.closed_at)?,
        })
    }
}
