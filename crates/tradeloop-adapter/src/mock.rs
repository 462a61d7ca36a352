/*
[INPUT]:  Scripted prices, holdings, cash and failure sequences
[OUTPUT]: In-memory BrokerGateway / MarketData doubles that record every call
[POS]:    Test support - shared by adapter and scheduler test suites and dry runs
[UPDATE]: When the gateway traits gain new methods
*/

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::{GatewayError, Result};
use crate::gateway::{BrokerGateway, MarketData};
use crate::types::{Holding, OrderType, PlaceOrderRequest, PlacedOrder, Side};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mock broker for testing and dry runs.
#[derive(Debug)]
pub struct MockBroker {
    holdings: Mutex<Vec<Holding>>,
    active_buys: Mutex<HashSet<String>>,
    cash: Mutex<Decimal>,
    placed: Mutex<Vec<PlaceOrderRequest>>,
    place_failures: Mutex<VecDeque<GatewayError>>,
    check_failures: Mutex<VecDeque<GatewayError>>,
    relogin_outcomes: Mutex<VecDeque<bool>>,
    relogin_calls: AtomicUsize,
    next_order_id: AtomicUsize,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    /// Create a broker with unlimited cash, no holdings and no pending orders.
    pub fn new() -> Self {
        Self {
            holdings: Mutex::new(Vec::new()),
            active_buys: Mutex::new(HashSet::new()),
            cash: Mutex::new(Decimal::MAX),
            placed: Mutex::new(Vec::new()),
            place_failures: Mutex::new(VecDeque::new()),
            check_failures: Mutex::new(VecDeque::new()),
            relogin_outcomes: Mutex::new(VecDeque::new()),
            relogin_calls: AtomicUsize::new(0),
            next_order_id: AtomicUsize::new(1),
        }
    }

    pub fn set_cash(&self, cash: Decimal) {
        *lock(&self.cash) = cash;
    }

    pub fn add_holding(&self, symbol: &str, quantity: i64, average_price: Decimal) {
        lock(&self.holdings).push(Holding {
            symbol: symbol.to_string(),
            quantity,
            average_price,
        });
    }

    pub fn set_active_buy_order(&self, symbol: &str, active: bool) {
        let mut active_buys = lock(&self.active_buys);
        if active {
            active_buys.insert(symbol.to_string());
        } else {
            active_buys.remove(symbol);
        }
    }

    /// Queue an error returned by the next place call instead of accepting it.
    pub fn fail_next_place(&self, err: GatewayError) {
        lock(&self.place_failures).push_back(err);
    }

    /// Queue an error for the next read call (holdings, active buy order or cash).
    pub fn fail_next_check(&self, err: GatewayError) {
        lock(&self.check_failures).push_back(err);
    }

    fn next_check_failure(&self) -> Result<()> {
        match lock(&self.check_failures).pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Queue the result of the next `force_relogin` call. Defaults to success.
    pub fn push_relogin_outcome(&self, success: bool) {
        lock(&self.relogin_outcomes).push_back(success);
    }

    pub fn relogin_calls(&self) -> usize {
        self.relogin_calls.load(Ordering::SeqCst)
    }

    /// Every order accepted so far, in placement order.
    pub fn placed_orders(&self) -> Vec<PlaceOrderRequest> {
        lock(&self.placed).clone()
    }

    pub fn placed_buys(&self) -> Vec<PlaceOrderRequest> {
        self.placed_orders()
            .into_iter()
            .filter(|order| order.side == Side::Buy)
            .collect()
    }

    fn place(&self, symbol: &str, side: Side, quantity: i64, order_type: OrderType) -> Result<PlacedOrder> {
        if let Some(err) = lock(&self.place_failures).pop_front() {
            return Err(err);
        }
        let id = self.next_order_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.placed).push(PlaceOrderRequest {
            symbol: symbol.to_string(),
            side,
            order_type,
            quantity,
            tag: format!("mock-{id}"),
        });
        Ok(PlacedOrder {
            order_id: format!("MOCK{id:06}"),
            status: "open".to_string(),
            placed_at: chrono::Utc::now(),
        })
    }
}

#[async_trait]
impl BrokerGateway for MockBroker {
    async fn place_buy(&self, symbol: &str, quantity: i64, order_type: OrderType) -> Result<PlacedOrder> {
        self.place(symbol, Side::Buy, quantity, order_type)
    }

    async fn place_sell(&self, symbol: &str, quantity: i64, order_type: OrderType) -> Result<PlacedOrder> {
        self.place(symbol, Side::Sell, quantity, order_type)
    }

    async fn get_holdings(&self) -> Result<Vec<Holding>> {
        self.next_check_failure()?;
        Ok(lock(&self.holdings).clone())
    }

    async fn has_active_buy_order(&self, symbol: &str) -> Result<bool> {
        self.next_check_failure()?;
        Ok(lock(&self.active_buys).contains(symbol))
    }

    async fn available_cash(&self) -> Result<Decimal> {
        self.next_check_failure()?;
        Ok(*lock(&self.cash))
    }

    async fn force_relogin(&self) -> Result<bool> {
        self.relogin_calls.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.relogin_outcomes).pop_front().unwrap_or(true))
    }
}

/// Mock market data source for testing and dry runs.
#[derive(Debug, Default)]
pub struct MockMarketData {
    prices: Mutex<HashMap<String, Decimal>>,
    volumes: Mutex<HashMap<String, Decimal>>,
    rsi: Mutex<HashMap<String, Decimal>>,
    price_calls: AtomicUsize,
}

impl MockMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        lock(&self.prices).insert(symbol.to_string(), price);
    }

    pub fn set_average_volume(&self, symbol: &str, volume: Decimal) {
        lock(&self.volumes).insert(symbol.to_string(), volume);
    }

    pub fn set_rsi(&self, symbol: &str, rsi: Decimal) {
        lock(&self.rsi).insert(symbol.to_string(), rsi);
    }

    pub fn price_calls(&self) -> usize {
        self.price_calls.load(Ordering::SeqCst)
    }

    fn read(map: &Mutex<HashMap<String, Decimal>>, symbol: &str) -> Result<Decimal> {
        lock(map).get(symbol).copied().ok_or_else(|| GatewayError::NoData {
            symbol: symbol.to_string(),
        })
    }
}

#[async_trait]
impl MarketData for MockMarketData {
    async fn current_price(&self, symbol: &str) -> Result<Decimal> {
        self.price_calls.fetch_add(1, Ordering::SeqCst);
        Self::read(&self.prices, symbol)
    }

    async fn average_volume(&self, symbol: &str, _lookback: u32) -> Result<Decimal> {
        Self::read(&self.volumes, symbol)
    }

    async fn rsi(&self, symbol: &str, _period: u32) -> Result<Decimal> {
        Self::read(&self.rsi, symbol)
    }
}
