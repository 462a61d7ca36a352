/*
[INPUT]:  Mock broker/market doubles and in-memory databases
[OUTPUT]: Shared fixtures for scheduler integration tests
[POS]:    Test infrastructure - shared across all test modules
[UPDATE]: When adding new test patterns or fixtures
*/

//! Common test utilities for tradeloop-scheduler tests

#![allow(dead_code)]

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tradeloop_adapter::{MockBroker, MockMarketData, OrderType};
use tradeloop_scheduler::config::TradingConfig;
use tradeloop_scheduler::db::{NewOrder, NewPosition, OrderStatus};
use tradeloop_scheduler::sizing::VolumeFractionPolicy;
use tradeloop_scheduler::trading::reentry::ReentryState;
use tradeloop_scheduler::{
    Database, ExecutionContext, SchedulerConfig, TaskError, TaskName, TaskRunner, UserServices,
};

pub const USER: &str = "alice";

pub struct Fixture {
    pub db: Database,
    pub broker: Arc<MockBroker>,
    pub market: Arc<MockMarketData>,
    pub services: UserServices,
}

pub fn fixture() -> Fixture {
    fixture_with(TradingConfig::default())
}

pub fn fixture_with(trading: TradingConfig) -> Fixture {
    let broker = Arc::new(MockBroker::new());
    let market = Arc::new(MockMarketData::new());
    let services = UserServices {
        broker: broker.clone(),
        market: market.clone(),
        liquidity: Arc::new(VolumeFractionPolicy::new(Decimal::new(10, 2), Decimal::from(10_000))),
        trading,
    };
    Fixture {
        db: Database::open_in_memory().expect("in-memory database"),
        broker,
        market,
        services,
    }
}

impl Fixture {
    /// Liquid symbol: the liquidity cap never binds.
    pub fn quote(&self, symbol: &str, price: i64) {
        self.market.set_price(symbol, Decimal::from(price));
        self.market.set_average_volume(symbol, Decimal::from(1_000_000));
    }

    pub fn pending_order(&self, symbol: &str, quantity: i64) -> i64 {
        self.db
            .insert_order(&NewOrder {
                user_id: USER.to_string(),
                symbol: symbol.to_string(),
                ticker: format!("{symbol}.NS"),
                quantity,
                order_type: OrderType::Amo,
                status: OrderStatus::RetryPending,
                last_error: Some("insufficient funds".to_string()),
            })
            .expect("insert order")
    }

    pub fn open_position(&self, symbol: &str, quantity: i64, entry_price: i64, state: ReentryState) -> i64 {
        self.db
            .insert_position(&NewPosition {
                user_id: USER.to_string(),
                symbol: symbol.to_string(),
                quantity,
                entry_price: Decimal::from(entry_price),
                state,
            })
            .expect("insert position")
    }
}

pub fn ctx() -> ExecutionContext {
    ExecutionContext::new(CancellationToken::new())
}

pub fn trading_with_capital(capital: i64) -> TradingConfig {
    TradingConfig {
        user_capital: Decimal::from(capital),
        ..TradingConfig::default()
    }
}

pub fn test_config() -> SchedulerConfig {
    SchedulerConfig::from_yaml_str("conflict_window_secs: 120\nstop_timeout_secs: 2\n").expect("test config")
}

/// What the scripted runner does on each call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Succeed,
    FailTransient,
    FailFatal,
    Panic,
    /// Wait for cancellation, then return
    Block,
}

/// TaskRunner double that counts calls per task.
pub struct ScriptedRunner {
    script: Mutex<Script>,
    calls: AtomicUsize,
    seen: Mutex<Vec<(String, TaskName)>>,
}

impl ScriptedRunner {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<(String, TaskName)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskRunner for ScriptedRunner {
    async fn run(&self, user_id: &str, task: TaskName, ctx: &ExecutionContext) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push((user_id.to_string(), task));
        ctx.insert("task", task.as_str());

        let script = *self.script.lock().unwrap();
        match script {
            Script::Succeed => Ok(()),
            Script::FailTransient => Err(TaskError::Transient("broker timeout".to_string()).into()),
            Script::FailFatal => Err(TaskError::Fatal("account disabled".to_string()).into()),
            Script::Panic => panic!("scripted panic"),
            Script::Block => {
                ctx.cancellation().cancelled().await;
                Ok(())
            }
        }
    }
}

/// Poll `check` until it holds or the timeout elapses.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
