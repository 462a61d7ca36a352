/*
[INPUT]:  YAML configuration file plus TRADELOOP__* environment overrides
[OUTPUT]: Validated scheduler configuration (storage, schedules, liquidity, users)
[POS]:    Configuration layer - process setup
[UPDATE]: When adding new configuration options
*/

use anyhow::{Context, Result, bail};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tradeloop_adapter::OrderType;

use crate::task::TaskName;
use crate::trading::reentry::ReentryLevels;

const ENV_PREFIX: &str = "TRADELOOP";

/// Top-level configuration for the scheduler process
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// SQLite file holding the ledger, heartbeats, orders and positions
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// JSON log file; also the source for `tradeloop logs`
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Window used by conflict checks
    #[serde(default = "default_conflict_window_secs")]
    pub conflict_window_secs: u64,
    /// How often the unified loop wakes up to look for due tasks
    #[serde(default = "default_unified_tick_secs")]
    pub unified_tick_secs: u64,
    /// Bounded wait for a stopped worker
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    /// Per-task schedule keyed by task name; missing tasks use defaults
    #[serde(default)]
    pub schedules: BTreeMap<TaskName, TaskSchedule>,
    #[serde(default)]
    pub liquidity: LiquidityConfig,
    #[serde(default)]
    pub market_cache: MarketCacheConfig,
    /// Accounts served by this process
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct TaskSchedule {
    pub interval_secs: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl TaskSchedule {
    pub fn default_for(task: TaskName) -> Self {
        let interval_secs = match task {
            TaskName::PremarketRetry => 300,
            TaskName::PositionMonitor => 60,
            TaskName::SellMonitor => 60,
            TaskName::EodCleanup => 24 * 60 * 60,
        };
        Self {
            interval_secs,
            enabled: true,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Capital cap derived from traded volume.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LiquidityConfig {
    /// Share of average daily traded value one order may take
    #[serde(default = "default_volume_fraction")]
    pub volume_fraction: Decimal,
    /// Orders are skipped when the liquidity cap falls below this
    #[serde(default = "default_min_liquidity_capital")]
    pub min_capital: Decimal,
}

impl Default for LiquidityConfig {
    fn default() -> Self {
        Self {
            volume_fraction: default_volume_fraction(),
            min_capital: default_min_liquidity_capital(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MarketCacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

impl Default for MarketCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            max_entries: default_cache_max_entries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserConfig {
    pub id: String,
    pub broker: BrokerConfig,
    #[serde(default)]
    pub trading: TradingConfig,
}

/// Broker REST endpoint and API credentials
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    pub base_url: String,
    pub api_key: String,
    #[serde(skip_serializing, default)]
    pub api_secret: String,
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

/// Per-user sizing and re-entry limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TradingConfig {
    #[serde(default = "default_user_capital")]
    pub user_capital: Decimal,
    #[serde(default = "default_max_portfolio_size")]
    pub max_portfolio_size: usize,
    #[serde(default = "default_min_qty")]
    pub min_qty: i64,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_order_type")]
    pub order_type: OrderType,
    #[serde(default)]
    pub reentry_levels: ReentryLevels,
    #[serde(default = "default_max_reentries_per_day")]
    pub max_reentries_per_day: u32,
    /// Open positions are sold once RSI rises above this
    #[serde(default = "default_exit_rsi")]
    pub exit_rsi: Decimal,
    #[serde(default = "default_rsi_period")]
    pub rsi_period: u32,
    #[serde(default = "default_volume_lookback")]
    pub volume_lookback: u32,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            user_capital: default_user_capital(),
            max_portfolio_size: default_max_portfolio_size(),
            min_qty: default_min_qty(),
            max_retry_attempts: default_max_retry_attempts(),
            order_type: default_order_type(),
            reentry_levels: ReentryLevels::default(),
            max_reentries_per_day: default_max_reentries_per_day(),
            exit_rsi: default_exit_rsi(),
            rsi_period: default_rsi_period(),
            volume_lookback: default_volume_lookback(),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from a YAML file, then apply `TRADELOOP__*` overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("read config {}", path.display()))?;

        let config: Self = settings
            .try_deserialize()
            .context("deserialize scheduler config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content).context("parse scheduler config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("render scheduler config")
    }

    pub fn validate(&self) -> Result<()> {
        if self.conflict_window_secs == 0 {
            bail!("conflict_window_secs must be positive");
        }
        if self.unified_tick_secs == 0 {
            bail!("unified_tick_secs must be positive");
        }
        for (task, schedule) in &self.schedules {
            if schedule.interval_secs == 0 {
                bail!("schedule for {task} must have a positive interval_secs");
            }
        }
        if self.liquidity.volume_fraction <= Decimal::ZERO {
            bail!("liquidity.volume_fraction must be positive");
        }

        let mut seen = HashSet::new();
        for user in &self.users {
            if !seen.insert(user.id.as_str()) {
                bail!("duplicate user id: {}", user.id);
            }
            let trading = &user.trading;
            if trading.min_qty < 1 {
                bail!("user {}: min_qty must be at least 1", user.id);
            }
            if trading.max_retry_attempts == 0 {
                bail!("user {}: max_retry_attempts must be at least 1", user.id);
            }
            if trading.user_capital <= Decimal::ZERO {
                bail!("user {}: user_capital must be positive", user.id);
            }
            trading
                .reentry_levels
                .validate()
                .with_context(|| format!("user {}: invalid reentry_levels", user.id))?;
        }
        Ok(())
    }

    pub fn schedule(&self, task: TaskName) -> TaskSchedule {
        self.schedules
            .get(&task)
            .copied()
            .unwrap_or_else(|| TaskSchedule::default_for(task))
    }

    /// Effective schedule for every known task.
    pub fn schedules(&self) -> BTreeMap<TaskName, TaskSchedule> {
        TaskName::ALL
            .iter()
            .map(|task| (*task, self.schedule(*task)))
            .collect()
    }

    pub fn conflict_window(&self) -> Duration {
        Duration::from_secs(self.conflict_window_secs)
    }

    pub fn unified_tick(&self) -> Duration {
        Duration::from_secs(self.unified_tick_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn user(&self, user_id: &str) -> Option<&UserConfig> {
        self.users.iter().find(|user| user.id == user_id)
    }
}

fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tradeloop")
        .join("tradeloop.db")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_conflict_window_secs() -> u64 {
    120
}

fn default_unified_tick_secs() -> u64 {
    30
}

fn default_stop_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_volume_fraction() -> Decimal {
    Decimal::new(10, 2)
}

fn default_min_liquidity_capital() -> Decimal {
    Decimal::from(10_000)
}

fn default_cache_ttl_secs() -> u64 {
    30
}

fn default_cache_max_entries() -> usize {
    2_048
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_user_capital() -> Decimal {
    Decimal::from(100_000)
}

fn default_max_portfolio_size() -> usize {
    10
}

fn default_min_qty() -> i64 {
    1
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_order_type() -> OrderType {
    OrderType::Amo
}

fn default_max_reentries_per_day() -> u32 {
    1
}

fn default_exit_rsi() -> Decimal {
    Decimal::from(50)
}

fn default_rsi_period() -> u32 {
    10
}

fn default_volume_lookback() -> u32 {
    20
}
