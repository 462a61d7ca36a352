/*
[INPUT]:  Live price, average volume, user capital and liquidity policy
[OUTPUT]: Execution capital and order quantity recomputed for every attempt
[POS]:    Trading domain logic - position sizing shared by retry and re-entry passes
[UPDATE]: When the liquidity formula or minimum quantity rules change
*/

use anyhow::{Result, bail};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;

use crate::config::LiquidityConfig;

/// Maximum capital deployable in a symbol given how much of it trades.
pub trait LiquidityPolicy: Send + Sync {
    fn max_capital_for_liquidity(&self, avg_volume: Decimal, price: Decimal) -> Decimal;

    /// Caps below this are too thin to trade.
    fn min_capital(&self) -> Decimal;
}

/// Cap = average volume × price × fraction.
#[derive(Debug, Clone)]
pub struct VolumeFractionPolicy {
    fraction: Decimal,
    min_capital: Decimal,
}

impl VolumeFractionPolicy {
    pub fn new(fraction: Decimal, min_capital: Decimal) -> Self {
        Self {
            fraction,
            min_capital,
        }
    }
}

impl From<&LiquidityConfig> for VolumeFractionPolicy {
    fn from(config: &LiquidityConfig) -> Self {
        Self::new(config.volume_fraction, config.min_capital)
    }
}

impl LiquidityPolicy for VolumeFractionPolicy {
    fn max_capital_for_liquidity(&self, avg_volume: Decimal, price: Decimal) -> Decimal {
        (avg_volume * price * self.fraction).max(Decimal::ZERO)
    }

    fn min_capital(&self) -> Decimal {
        self.min_capital
    }
}

/// Capital actually committed to one order.
pub fn execution_capital(user_capital: Decimal, liquidity_cap: Decimal) -> Decimal {
    user_capital.min(liquidity_cap)
}

/// `max(min_qty, floor(capital / price))`.
pub fn compute_quantity(capital: Decimal, price: Decimal, min_qty: i64) -> Result<i64> {
    if price <= Decimal::ZERO {
        bail!("cannot size an order at non-positive price {price}");
    }
    let units = (capital / price).floor();
    let units = units.to_i64().unwrap_or(if units.is_sign_negative() { 0 } else { i64::MAX });
    Ok(units.max(min_qty))
}

/// Inputs and result of one sizing decision, recorded in execution details.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sizing {
    pub price: Decimal,
    pub avg_volume: Decimal,
    pub liquidity_cap: Decimal,
    pub execution_capital: Decimal,
    pub quantity: i64,
}

impl Sizing {
    pub fn compute(
        policy: &dyn LiquidityPolicy,
        user_capital: Decimal,
        min_qty: i64,
        price: Decimal,
        avg_volume: Decimal,
    ) -> Result<Self> {
        let liquidity_cap = policy.max_capital_for_liquidity(avg_volume, price);
        let execution_capital = execution_capital(user_capital, liquidity_cap);
        let quantity = compute_quantity(execution_capital, price, min_qty)?;
        Ok(Self {
            price,
            avg_volume,
            liquidity_cap,
            execution_capital,
            quantity,
        })
    }

    pub fn order_value(&self) -> Decimal {
        self.price * Decimal::from(self.quantity)
    }

    pub fn below_liquidity_minimum(&self, policy: &dyn LiquidityPolicy) -> bool {
        self.liquidity_cap < policy.min_capital()
    }
}
