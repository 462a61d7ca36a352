/*
[INPUT]:  Open positions, broker holdings, retry queue
[OUTPUT]: Reset daily counters, closed stale positions, pending retry count
[POS]:    Trading layer - eod_cleanup body
[UPDATE]: When end-of-day maintenance steps change
*/

use anyhow::Result;
use serde::Serialize;
use std::collections::HashSet;

use super::SessionGuard;
use crate::db::{Database, OrderStatus};
use crate::registry::UserServices;
use crate::wrapper::ExecutionContext;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupSummary {
    pub reentry_counters_reset: usize,
    pub positions_closed: Vec<String>,
    pub retry_pending: i64,
}

/// `eod_cleanup`: daily maintenance for one user.
pub async fn run_cleanup_pass(
    db: &Database,
    services: &UserServices,
    user_id: &str,
    ctx: &ExecutionContext,
) -> Result<CleanupSummary> {
    let mut summary = CleanupSummary {
        reentry_counters_reset: db.reset_daily_reentries(user_id)?,
        ..CleanupSummary::default()
    };
    ctx.insert("reentry_counters_reset", summary.reentry_counters_reset);

    let mut guard = SessionGuard::new(services.broker.as_ref());
    let broker = guard.broker();
    let holdings = guard.call(|| broker.get_holdings()).await?;
    let held: HashSet<&str> = holdings
        .iter()
        .filter(|holding| holding.quantity > 0)
        .map(|holding| holding.symbol.as_str())
        .collect();

    for position in db.list_open_positions(user_id)? {
        if held.contains(position.symbol.as_str()) {
            continue;
        }
        if db.close_position(position.id)? {
            tracing::info!(user_id, symbol = %position.symbol, "closed position missing from holdings");
            summary.positions_closed.push(position.symbol);
        }
    }
    ctx.insert("positions_closed", summary.positions_closed.clone());

    summary.retry_pending = db.count_orders(user_id, OrderStatus::RetryPending)?;
    if summary.retry_pending > 0 {
        tracing::warn!(user_id, retry_pending = summary.retry_pending, "orders still waiting for retry at end of day");
    }

    Ok(summary)
}
