/*
[INPUT]:  Orders queued for retry and the outcome of each retry attempt
[OUTPUT]: orders rows whose retry_pending transitions are conditional on the current status
[POS]:    Persistence layer - retry queue
[UPDATE]: When order statuses or retry bookkeeping change
*/

use super::{Database, decode_enum, encode_enum, from_millis, to_millis};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tradeloop_adapter::OrderType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Amo,
    Ongoing,
    RetryPending,
    Failed,
    Rejected,
    Cancelled,
    Closed,
}

impl OrderStatus {
    /// Status of an order the broker has just accepted.
    pub fn placed(order_type: OrderType) -> Self {
        match order_type {
            OrderType::Amo => OrderStatus::Amo,
            OrderType::Market | OrderType::Limit => OrderStatus::Ongoing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Order {
    pub id: i64,
    pub user_id: String,
    pub symbol: String,
    pub ticker: String,
    pub quantity: i64,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub retry_count: u32,
    pub broker_order_id: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewOrder {
    pub user_id: String,
    pub symbol: String,
    pub ticker: String,
    pub quantity: i64,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub last_error: Option<String>,
}

const ORDER_COLUMNS: &str = "id, user_id, symbol, ticker, quantity, order_type, status, retry_count, broker_order_id, last_error, created_at, updated_at";

impl Database {
    pub fn insert_order(&self, order: &NewOrder) -> Result<i64> {
        let conn = self.conn()?;
        let now = to_millis(Utc::now());
        conn.execute(
            "INSERT INTO orders (user_id, symbol, ticker, quantity, order_type, status, last_error, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                order.user_id,
                order.symbol,
                order.ticker,
                order.quantity,
                encode_enum(&order.order_type)?,
                encode_enum(&order.status)?,
                order.last_error,
                now
            ],
        )
        .context("insert order")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_order(&self, order_id: i64) -> Result<Option<Order>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1"),
                params![order_id],
                OrderRow::from_row,
            )
            .optional()
            .context("fetch order")?;
        row.map(Order::try_from).transpose()
    }

    /// Orders of one user in `status`, oldest first.
    pub fn list_orders(&self, user_id: &str, status: OrderStatus) -> Result<Vec<Order>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = ?1 AND status = ?2 ORDER BY created_at ASC, id ASC"
            ))
            .context("prepare order list")?;
        let rows = stmt
            .query_map(params![user_id, encode_enum(&status)?], OrderRow::from_row)
            .context("query order list")?;

        let mut orders = Vec::new();
        for row in rows {
            orders.push(Order::try_from(row?)?);
        }
        Ok(orders)
    }

    pub fn count_orders(&self, user_id: &str, status: OrderStatus) -> Result<i64> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT COUNT(*) FROM orders WHERE user_id = ?1 AND status = ?2",
            params![user_id, encode_enum(&status)?],
            |row| row.get(0),
        )
        .context("count orders")
    }

    /// Store a successful retry. No-op unless the order is still `retry_pending`.
    pub fn mark_order_placed(
        &self,
        order_id: i64,
        quantity: i64,
        broker_order_id: &str,
        status: OrderStatus,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE orders SET quantity = ?2, broker_order_id = ?3, status = ?4, retry_count = 0, last_error = NULL, updated_at = ?5 WHERE id = ?1 AND status = 'retry_pending'",
                params![
                    order_id,
                    quantity,
                    broker_order_id,
                    encode_enum(&status)?,
                    to_millis(Utc::now())
                ],
            )
            .context("mark order placed")?;
        Ok(updated == 1)
    }

    /// Count a failed retry attempt and move the order to `failed` once it
    /// reaches `max_attempts`. Returns the resulting status, or None when the
    /// order was no longer `retry_pending`.
    pub fn record_retry_failure(
        &self,
        order_id: i64,
        quantity: i64,
        error: &str,
        max_attempts: u32,
    ) -> Result<Option<OrderStatus>> {
        let conn = self.conn()?;
        let status: Option<String> = conn
            .query_row(
                "UPDATE orders SET retry_count = retry_count + 1,
                        status = CASE WHEN retry_count + 1 >= ?2 THEN 'failed' ELSE 'retry_pending' END,
                        quantity = ?3, last_error = ?4, updated_at = ?5
                 WHERE id = ?1 AND status = 'retry_pending'
                 RETURNING status",
                params![
                    order_id,
                    i64::from(max_attempts),
                    quantity,
                    error,
                    to_millis(Utc::now())
                ],
                |row| row.get(0),
            )
            .optional()
            .context("record retry failure")?;
        status.as_deref().map(decode_enum).transpose()
    }

    /// Drop a queued order that no longer needs placing.
    pub fn cancel_order(&self, order_id: i64, reason: &str) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE orders SET status = 'cancelled', last_error = ?2, updated_at = ?3 WHERE id = ?1 AND status = 'retry_pending'",
                params![order_id, reason, to_millis(Utc::now())],
            )
            .context("cancel order")?;
        Ok(updated == 1)
    }
}

struct OrderRow {
    id: i64,
    user_id: String,
    symbol: String,
    ticker: String,
    quantity: i64,
    order_type: String,
    status: String,
    retry_count: i64,
    broker_order_id: Option<String>,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl OrderRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            symbol: row.get(2)?,
            ticker: row.get(3)?,
            quantity: row.get(4)?,
            order_type: row.get(5)?,
            status: row.get(6)?,
            retry_count: row.get(7)?,
            broker_order_id: row.get(8)?,
            last_error: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }
}

impl TryFrom<OrderRow> for Order {
    type Error = anyhow::Error;

    fn try_from(row: OrderRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            symbol: row.symbol,
            ticker: row.ticker,
            quantity: row.quantity,
            order_type: decode_enum(&row.order_type)?,
            status: decode_enum(&row.status)?,
            retry_count: u32::try_from(row.retry_count).context("retry_count out of range")?,
            broker_order_id: row.broker_order_id,
            last_error: row.last_error,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
        })
    }
}
