/*
[INPUT]:  Open positions and live RSI
[OUTPUT]: Full-quantity sell orders and closed position rows
[POS]:    Trading layer - sell_monitor body
[UPDATE]: When exit conditions change
*/

use anyhow::Result;
use serde::Serialize;
use serde_json::json;

use super::{SessionGuard, StepError};
use crate::db::Database;
use crate::registry::UserServices;
use crate::wrapper::ExecutionContext;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExitSummary {
    pub evaluated: usize,
    pub sold: usize,
    pub errors: usize,
}

/// `sell_monitor`: sell every open position whose RSI rose above `exit_rsi`.
pub async fn run_exit_pass(
    db: &Database,
    services: &UserServices,
    user_id: &str,
    ctx: &ExecutionContext,
) -> Result<ExitSummary> {
    let trading = &services.trading;
    let positions = db.list_open_positions(user_id)?;
    let mut guard = SessionGuard::new(services.broker.as_ref());
    let broker = guard.broker();
    let mut summary = ExitSummary::default();

    for position in positions {
        if ctx.is_cancelled() {
            ctx.insert("cancelled", true);
            break;
        }
        summary.evaluated += 1;
        let symbol = position.symbol.as_str();

        let rsi = match services.market.rsi(symbol, trading.rsi_period).await {
            Ok(rsi) => rsi,
            Err(err) => {
                summary.errors += 1;
                tracing::warn!(user_id, symbol, error = %err, "exit check failed");
                ctx.push("positions", json!({ "symbol": symbol, "outcome": "error", "error": err.to_string() }));
                continue;
            }
        };
        if rsi <= trading.exit_rsi {
            continue;
        }

        let quantity = position.quantity;
        let order_type = trading.order_type;
        match guard.call(|| broker.place_sell(symbol, quantity, order_type)).await {
            Ok(placed) => {
                if let Err(err) = db.close_position(position.id) {
                    summary.errors += 1;
                    tracing::error!(user_id, symbol, order_id = %placed.order_id, error = %err, "sell placed but position not closed");
                    ctx.push(
                        "positions",
                        json!({
                            "symbol": symbol,
                            "outcome": "error",
                            "broker_order_id": placed.order_id,
                            "error": format!("{err:#}"),
                        }),
                    );
                    continue;
                }
                summary.sold += 1;
                tracing::info!(user_id, symbol, quantity, %rsi, order_id = %placed.order_id, "position exited");
                ctx.push(
                    "positions",
                    json!({
                        "symbol": symbol,
                        "outcome": "sold",
                        "quantity": quantity,
                        "rsi": rsi.to_string(),
                        "broker_order_id": placed.order_id,
                    }),
                );
            }
            Err(StepError::Gateway(err)) => {
                summary.errors += 1;
                tracing::warn!(user_id, symbol, error = %err, "exit order failed");
                ctx.push("positions", json!({ "symbol": symbol, "outcome": "error", "error": err.to_string() }));
            }
            Err(abort @ StepError::Abort(_)) => {
                ctx.insert("summary", serde_json::to_value(&summary)?);
                return Err(abort.into());
            }
        }
    }

    Ok(summary)
}
