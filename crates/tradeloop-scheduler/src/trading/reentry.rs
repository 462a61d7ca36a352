/*
[INPUT]:  Open positions, live RSI, active-order state, sizing inputs
[OUTPUT]: Level-based re-entry buys and persisted re-entry state per position
[POS]:    Trading layer - position_monitor body and the re-entry state machine
[UPDATE]: When re-entry levels, the reset rule or daily caps change
*/

use anyhow::{Result, bail};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{SessionGuard, StepError};
use crate::db::{Database, PositionEntry};
use crate::registry::UserServices;
use crate::sizing::Sizing;
use crate::wrapper::ExecutionContext;

/// How deep into the oversold levels a position has averaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReentryState {
    NoLevelsTaken,
    Level1Taken,
    Level2Taken,
    Level3Taken,
    /// All levels consumed and RSI has recovered above level 1
    ResetReady,
}

impl ReentryState {
    pub fn levels_taken(self) -> usize {
        match self {
            ReentryState::NoLevelsTaken => 0,
            ReentryState::Level1Taken => 1,
            ReentryState::Level2Taken => 2,
            ReentryState::Level3Taken | ReentryState::ResetReady => 3,
        }
    }
}

/// RSI thresholds, strictly descending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReentryLevels {
    pub level1: Decimal,
    pub level2: Decimal,
    pub level3: Decimal,
}

impl Default for ReentryLevels {
    fn default() -> Self {
        Self {
            level1: Decimal::from(30),
            level2: Decimal::from(20),
            level3: Decimal::from(10),
        }
    }
}

impl ReentryLevels {
    pub fn validate(&self) -> Result<()> {
        if !(self.level1 > self.level2 && self.level2 > self.level3) {
            bail!(
                "levels must be strictly descending, got {}/{}/{}",
                self.level1,
                self.level2,
                self.level3
            );
        }
        if self.level3 <= Decimal::ZERO || self.level1 >= Decimal::ONE_HUNDRED {
            bail!("levels must lie between 0 and 100");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReentryDecision {
    Hold,
    /// Record that RSI recovered; no order
    ArmReset,
    /// Buy and move to `next` once the order is accepted
    Buy { next: ReentryState, level: Decimal },
}

/// Transition function of the re-entry state machine.
pub fn decide(state: ReentryState, rsi: Decimal, levels: &ReentryLevels) -> ReentryDecision {
    let (next, level) = match state {
        ReentryState::ResetReady => (ReentryState::Level1Taken, levels.level1),
        ReentryState::Level3Taken => {
            return if rsi > levels.level1 {
                ReentryDecision::ArmReset
            } else {
                ReentryDecision::Hold
            };
        }
        ReentryState::NoLevelsTaken => (ReentryState::Level1Taken, levels.level1),
        ReentryState::Level1Taken => (ReentryState::Level2Taken, levels.level2),
        ReentryState::Level2Taken => (ReentryState::Level3Taken, levels.level3),
    };

    if rsi < level {
        ReentryDecision::Buy { next, level }
    } else {
        ReentryDecision::Hold
    }
}

/// Quantity-weighted average of the old entry and the new fill.
pub fn averaged_entry_price(
    quantity: i64,
    entry_price: Decimal,
    added_quantity: i64,
    fill_price: Decimal,
) -> Decimal {
    let total = quantity + added_quantity;
    if total <= 0 {
        return fill_price;
    }
    (Decimal::from(quantity) * entry_price + Decimal::from(added_quantity) * fill_price)
        / Decimal::from(total)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReentrySummary {
    pub evaluated: usize,
    pub bought: usize,
    pub reset_armed: usize,
    pub skipped: usize,
    pub errors: usize,
}

enum PositionOutcome {
    Hold,
    ResetArmed,
    Bought { quantity: i64, price: Decimal, next: ReentryState },
    Skipped(String),
}

/// `position_monitor`: evaluate every open position against the re-entry levels.
pub async fn run_reentry_pass(
    db: &Database,
    services: &UserServices,
    user_id: &str,
    ctx: &ExecutionContext,
) -> Result<ReentrySummary> {
    let positions = db.list_open_positions(user_id)?;
    let mut guard = SessionGuard::new(services.broker.as_ref());
    let mut summary = ReentrySummary::default();
    let today = Utc::now().date_naive();

    for position in positions {
        if ctx.is_cancelled() {
            ctx.insert("cancelled", true);
            break;
        }
        summary.evaluated += 1;

        match evaluate_position(db, services, &mut guard, &position, today).await {
            Ok(PositionOutcome::Hold) => {}
            Ok(PositionOutcome::ResetArmed) => {
                summary.reset_armed += 1;
                ctx.push(
                    "positions",
                    json!({ "symbol": position.symbol, "outcome": "reset_armed" }),
                );
            }
            Ok(PositionOutcome::Bought { quantity, price, next }) => {
                summary.bought += 1;
                ctx.push(
                    "positions",
                    json!({
                        "symbol": position.symbol,
                        "outcome": "bought",
                        "quantity": quantity,
                        "price": price.to_string(),
                        "state": next,
                    }),
                );
            }
            Ok(PositionOutcome::Skipped(reason)) => {
                summary.skipped += 1;
                ctx.push(
                    "positions",
                    json!({ "symbol": position.symbol, "outcome": "skipped", "reason": reason }),
                );
            }
            Err(StepError::Gateway(err)) => {
                summary.errors += 1;
                tracing::warn!(user_id, symbol = %position.symbol, error = %err, "re-entry evaluation failed");
                ctx.push(
                    "positions",
                    json!({ "symbol": position.symbol, "outcome": "error", "error": err.to_string() }),
                );
            }
            Err(abort @ StepError::Abort(_)) => {
                ctx.insert("summary", serde_json::to_value(&summary)?);
                return Err(abort.into());
            }
        }
    }

    Ok(summary)
}

async fn evaluate_position(
    db: &Database,
    services: &UserServices,
    guard: &mut SessionGuard<'_>,
    position: &PositionEntry,
    today: NaiveDate,
) -> Result<PositionOutcome, StepError> {
    let trading = &services.trading;
    let market = services.market.as_ref();
    let symbol = position.symbol.as_str();

    let rsi = market
        .rsi(symbol, trading.rsi_period)
        .await
        .map_err(StepError::Gateway)?;

    match decide(position.state, rsi, &trading.reentry_levels) {
        ReentryDecision::Hold => Ok(PositionOutcome::Hold),
        ReentryDecision::ArmReset => {
            let mut updated = position.clone();
            updated.state = ReentryState::ResetReady;
            persist(db, &updated)?;
            tracing::info!(symbol, %rsi, "re-entry cycle armed for reset");
            Ok(PositionOutcome::ResetArmed)
        }
        ReentryDecision::Buy { next, level } => {
            let used_today = position.reentries_on(today);
            if used_today >= trading.max_reentries_per_day {
                return Ok(PositionOutcome::Skipped(format!(
                    "daily re-entry cap of {} reached",
                    trading.max_reentries_per_day
                )));
            }

            let broker = guard.broker();
            if guard.call(|| broker.has_active_buy_order(symbol)).await? {
                return Ok(PositionOutcome::Skipped(
                    "buy order already in flight".to_string(),
                ));
            }

            let price = market.current_price(symbol).await.map_err(StepError::Gateway)?;
            let avg_volume = market
                .average_volume(symbol, trading.volume_lookback)
                .await
                .map_err(StepError::Gateway)?;
            let sizing = match Sizing::compute(
                services.liquidity.as_ref(),
                trading.user_capital,
                trading.min_qty,
                price,
                avg_volume,
            ) {
                Ok(sizing) => sizing,
                Err(err) => return Ok(PositionOutcome::Skipped(err.to_string())),
            };
            if sizing.below_liquidity_minimum(services.liquidity.as_ref()) {
                return Ok(PositionOutcome::Skipped(format!(
                    "liquidity cap {} below minimum {}",
                    sizing.liquidity_cap,
                    services.liquidity.min_capital()
                )));
            }

            let cash = guard.call(|| broker.available_cash()).await?;
            let required = sizing.order_value();
            if cash < required {
                return Ok(PositionOutcome::Skipped(format!(
                    "insufficient cash: need {required}, have {cash}"
                )));
            }

            let quantity = sizing.quantity;
            let order_type = trading.order_type;
            let placed = guard
                .call(|| broker.place_buy(symbol, quantity, order_type))
                .await?;

            let mut updated = position.clone();
            updated.entry_price =
                averaged_entry_price(position.quantity, position.entry_price, quantity, price);
            updated.quantity += quantity;
            updated.state = next;
            updated.reentries_today = used_today + 1;
            updated.reentry_day = Some(today);
            persist(db, &updated)?;

            tracing::info!(
                symbol,
                %rsi,
                %level,
                quantity,
                order_id = %placed.order_id,
                "re-entry buy placed"
            );
            Ok(PositionOutcome::Bought {
                quantity,
                price,
                next,
            })
        }
    }
}

fn persist(db: &Database, position: &PositionEntry) -> Result<(), StepError> {
    match db.save_position(position) {
        Ok(true) => Ok(()),
        Ok(false) => {
            tracing::warn!(position_id = position.id, "position closed while being evaluated");
            Ok(())
        }
        Err(err) => Err(StepError::Abort(crate::error::TaskError::Transient(format!(
            "persist position {}: {err:#}",
            position.id
        )))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn levels() -> ReentryLevels {
        ReentryLevels::default()
    }

    #[rstest]
    #[case(ReentryState::NoLevelsTaken, 29, Some(ReentryState::Level1Taken))]
    #[case(ReentryState::NoLevelsTaken, 30, None)]
    #[case(ReentryState::Level1Taken, 25, None)]
    #[case(ReentryState::Level1Taken, 19, Some(ReentryState::Level2Taken))]
    #[case(ReentryState::Level2Taken, 9, Some(ReentryState::Level3Taken))]
    #[case(ReentryState::Level3Taken, 5, None)]
    #[case(ReentryState::ResetReady, 29, Some(ReentryState::Level1Taken))]
    #[case(ReentryState::ResetReady, 45, None)]
    fn test_buy_transitions(
        #[case] state: ReentryState,
        #[case] rsi: i64,
        #[case] expected_next: Option<ReentryState>,
    ) {
        let decision = decide(state, Decimal::from(rsi), &levels());
        let next = match decision {
            ReentryDecision::Buy { next, .. } => Some(next),
            _ => None,
        };
        assert_eq!(next, expected_next);
    }

    #[test]
    fn test_full_cycle_resets_and_retakes_level_one() {
        let levels = levels();
        let mut state = ReentryState::Level3Taken;

        assert_eq!(decide(state, Decimal::from(25), &levels), ReentryDecision::Hold);
        assert_eq!(decide(state, Decimal::from(31), &levels), ReentryDecision::ArmReset);
        state = ReentryState::ResetReady;

        match decide(state, Decimal::from(28), &levels) {
            ReentryDecision::Buy { next, level } => {
                assert_eq!(next, ReentryState::Level1Taken);
                assert_eq!(level, Decimal::from(30));
                assert_eq!(next.levels_taken(), 1);
            }
            other => panic!("expected buy, got {other:?}"),
        }
    }

    #[test]
    fn test_weighted_average_entry() {
        let averaged = averaged_entry_price(10, Decimal::from(100), 10, Decimal::from(80));
        assert_eq!(averaged, Decimal::from(90));

        let averaged = averaged_entry_price(30, Decimal::from(100), 10, Decimal::from(60));
        assert_eq!(averaged, Decimal::from(90));
    }

    #[test]
    fn test_levels_validation() {
        assert!(levels().validate().is_ok());
        let flat = ReentryLevels {
            level1: Decimal::from(30),
            level2: Decimal::from(30),
            level3: Decimal::from(10),
        };
        assert!(flat.validate().is_err());
    }
}
