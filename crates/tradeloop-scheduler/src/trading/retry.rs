/*
[INPUT]:  retry_pending orders, live price/volume, holdings, cash and active orders
[OUTPUT]: Re-sized order placements and conditional retry bookkeeping
[POS]:    Trading layer - premarket_retry body
[UPDATE]: When re-validation rules, their order, or retry limits change
*/

use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use tradeloop_adapter::GatewayError;

use super::{SessionGuard, StepError};
use crate::db::{Database, Order, OrderStatus};
use crate::registry::UserServices;
use crate::sizing::Sizing;
use crate::wrapper::ExecutionContext;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetrySummary {
    pub pending: usize,
    pub placed: usize,
    pub cancelled: usize,
    pub skipped: usize,
    pub requeued: usize,
    pub failed: usize,
}

#[derive(Debug)]
enum RetryOutcome {
    Placed {
        quantity: i64,
        broker_order_id: String,
        sizing: Sizing,
    },
    /// Order row cancelled; placing it would duplicate existing exposure
    Cancelled(String),
    /// Left in retry_pending for a later pass
    Skipped(String),
    /// Placement attempted and refused
    AttemptFailed {
        quantity: i64,
        error: String,
    },
}

/// `premarket_retry`: re-attempt every `retry_pending` order of the user.
///
/// Quantity is recomputed from live price, volume and capital on every
/// attempt. One failing symbol never stops the pass; a lost broker session does.
pub async fn run_retry_pass(
    db: &Database,
    services: &UserServices,
    user_id: &str,
    ctx: &ExecutionContext,
) -> Result<RetrySummary> {
    let orders = db.list_orders(user_id, OrderStatus::RetryPending)?;
    let mut summary = RetrySummary {
        pending: orders.len(),
        ..RetrySummary::default()
    };
    let mut guard = SessionGuard::new(services.broker.as_ref());
    let mut placed_symbols: HashSet<String> = HashSet::new();

    for order in orders {
        if ctx.is_cancelled() {
            ctx.insert("cancelled", true);
            break;
        }

        let outcome = match retry_order(services, &mut guard, &order, &placed_symbols).await {
            Ok(outcome) => outcome,
            Err(StepError::Gateway(err)) => RetryOutcome::Skipped(format!("broker check failed: {err}")),
            Err(abort @ StepError::Abort(_)) => {
                ctx.insert("summary", serde_json::to_value(&summary)?);
                return Err(abort.into());
            }
        };

        let entry = apply_outcome(db, services, &order, outcome, &mut summary, &mut placed_symbols)?;
        ctx.push("orders", entry);
    }

    tracing::info!(
        user_id,
        pending = summary.pending,
        placed = summary.placed,
        cancelled = summary.cancelled,
        skipped = summary.skipped,
        requeued = summary.requeued,
        failed = summary.failed,
        "retry pass finished"
    );
    Ok(summary)
}

async fn retry_order(
    services: &UserServices,
    guard: &mut SessionGuard<'_>,
    order: &Order,
    placed_symbols: &HashSet<String>,
) -> Result<RetryOutcome, StepError> {
    let trading = &services.trading;
    let market = services.market.as_ref();
    let liquidity = services.liquidity.as_ref();
    let broker = guard.broker();
    let symbol = order.symbol.as_str();

    let quote = async {
        let price = market.current_price(symbol).await?;
        let avg_volume = market.average_volume(symbol, trading.volume_lookback).await?;
        Ok::<_, GatewayError>((price, avg_volume))
    };
    let (price, avg_volume) = match quote.await {
        Ok(quote) => quote,
        Err(err) => return Ok(RetryOutcome::Skipped(format!("market data unavailable: {err}"))),
    };
    let sizing = match Sizing::compute(
        liquidity,
        trading.user_capital,
        trading.min_qty,
        price,
        avg_volume,
    ) {
        Ok(sizing) => sizing,
        Err(err) => return Ok(RetryOutcome::Skipped(err.to_string())),
    };
    let quantity = sizing.quantity;

    let holdings = guard.call(|| broker.get_holdings()).await?;
    if holdings
        .iter()
        .any(|holding| holding.symbol == order.symbol && holding.quantity > 0)
    {
        return Ok(RetryOutcome::Cancelled(format!("{symbol} is already held")));
    }

    if guard.call(|| broker.has_active_buy_order(symbol)).await? {
        return Ok(RetryOutcome::Cancelled(format!(
            "a buy order for {symbol} is already in flight"
        )));
    }

    let mut portfolio: HashSet<&str> = holdings
        .iter()
        .filter(|holding| holding.quantity > 0)
        .map(|holding| holding.symbol.as_str())
        .collect();
    portfolio.extend(placed_symbols.iter().map(String::as_str));
    if portfolio.len() >= trading.max_portfolio_size {
        return Ok(RetryOutcome::Skipped(format!(
            "portfolio limit of {} symbols reached",
            trading.max_portfolio_size
        )));
    }

    let cash = guard.call(|| broker.available_cash()).await?;
    let required = sizing.order_value();
    if cash < required {
        return Ok(RetryOutcome::Skipped(format!(
            "insufficient cash: need {required}, have {cash}"
        )));
    }

    if sizing.below_liquidity_minimum(liquidity) {
        return Ok(RetryOutcome::Skipped(format!(
            "liquidity cap {} below minimum {}",
            sizing.liquidity_cap,
            liquidity.min_capital()
        )));
    }

    let order_type = order.order_type;
    match guard.call(|| broker.place_buy(symbol, quantity, order_type)).await {
        Ok(placed) => Ok(RetryOutcome::Placed {
            quantity,
            broker_order_id: placed.order_id,
            sizing,
        }),
        Err(StepError::Gateway(err)) => Ok(RetryOutcome::AttemptFailed {
            quantity,
            error: err.to_string(),
        }),
        Err(abort) => Err(abort),
    }
}

fn apply_outcome(
    db: &Database,
    services: &UserServices,
    order: &Order,
    outcome: RetryOutcome,
    summary: &mut RetrySummary,
    placed_symbols: &mut HashSet<String>,
) -> Result<serde_json::Value> {
    let symbol = order.symbol.as_str();
    let entry = match outcome {
        RetryOutcome::Placed {
            quantity,
            broker_order_id,
            sizing,
        } => {
            let status = OrderStatus::placed(order.order_type);
            if !db.mark_order_placed(order.id, quantity, &broker_order_id, status)? {
                tracing::warn!(
                    order_id = order.id,
                    symbol,
                    broker_order_id = %broker_order_id,
                    "order left retry_pending concurrently; broker order kept"
                );
            }
            summary.placed += 1;
            placed_symbols.insert(order.symbol.clone());
            tracing::info!(
                order_id = order.id,
                symbol,
                previous_quantity = order.quantity,
                quantity,
                price = %sizing.price,
                "retry placed"
            );
            json!({
                "order_id": order.id,
                "symbol": symbol,
                "outcome": "placed",
                "quantity": quantity,
                "previous_quantity": order.quantity,
                "broker_order_id": broker_order_id,
                "execution_capital": sizing.execution_capital.to_string(),
                "price": sizing.price.to_string(),
            })
        }
        RetryOutcome::Cancelled(reason) => {
            db.cancel_order(order.id, &reason)?;
            summary.cancelled += 1;
            tracing::info!(order_id = order.id, symbol, reason = %reason, "retry cancelled");
            json!({ "order_id": order.id, "symbol": symbol, "outcome": "cancelled", "reason": reason })
        }
        RetryOutcome::Skipped(reason) => {
            summary.skipped += 1;
            tracing::info!(order_id = order.id, symbol, reason = %reason, "retry skipped");
            json!({ "order_id": order.id, "symbol": symbol, "outcome": "skipped", "reason": reason })
        }
        RetryOutcome::AttemptFailed { quantity, error } => {
            let status = db.record_retry_failure(
                order.id,
                quantity,
                &error,
                services.trading.max_retry_attempts,
            )?;
            match status {
                Some(OrderStatus::Failed) => summary.failed += 1,
                _ => summary.requeued += 1,
            }
            tracing::warn!(
                order_id = order.id,
                symbol,
                error = %error,
                status = ?status,
                "retry attempt failed"
            );
            json!({
                "order_id": order.id,
                "symbol": symbol,
                "outcome": "attempt_failed",
                "error": error,
                "status": status,
            })
        }
    };
    Ok(entry)
}
