/*
[INPUT]:  Symbols, quantities and order types from the scheduler task bodies
[OUTPUT]: Broker and market data capability traits
[POS]:    Contract layer - the only surface task bodies use to reach a broker
[UPDATE]: When task bodies need a new broker or market data capability
*/

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::Result;
use crate::types::{Holding, OrderType, PlacedOrder};

/// Order placement and portfolio queries against one user's broker session.
///
/// Implementations must be safe to share between concurrently running tasks.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    async fn place_buy(
        &self,
        symbol: &str,
        quantity: i64,
        order_type: OrderType,
    ) -> Result<PlacedOrder>;

    async fn place_sell(
        &self,
        symbol: &str,
        quantity: i64,
        order_type: OrderType,
    ) -> Result<PlacedOrder>;

    async fn get_holdings(&self) -> Result<Vec<Holding>>;

    /// True while a buy order for `symbol` is pending at the broker.
    ///
    /// A held position is not an active order.
    async fn has_active_buy_order(&self, symbol: &str) -> Result<bool>;

    async fn available_cash(&self) -> Result<Decimal>;

    /// Drop the cached session and log in again. Returns false when the
    /// broker refused the new session (bad credentials, pending 2FA).
    async fn force_relogin(&self) -> Result<bool>;
}

/// Read-only price, volume and indicator lookups.
#[async_trait]
pub trait MarketData: Send + Sync {
    async fn current_price(&self, symbol: &str) -> Result<Decimal>;

    /// Average traded volume over the last `lookback` sessions.
    async fn average_volume(&self, symbol: &str, lookback: u32) -> Result<Decimal>;

    async fn rsi(&self, symbol: &str, period: u32) -> Result<Decimal>;
}
