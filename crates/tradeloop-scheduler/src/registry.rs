/*
[INPUT]:  SchedulerConfig users (broker endpoint, credentials, trading limits)
[OUTPUT]: Per-user broker gateway, cached market data and liquidity policy
[POS]:    Wiring layer - what task bodies resolve a user id to
[UPDATE]: When a user gains a new service or gateway construction changes
*/

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tradeloop_adapter::{
    BrokerGateway, CachedMarketData, ClientConfig, Credentials, HttpGateway, MarketData,
};

use crate::config::{SchedulerConfig, TradingConfig, UserConfig};
use crate::sizing::{LiquidityPolicy, VolumeFractionPolicy};

/// Everything a task body needs for one user.
#[derive(Clone)]
pub struct UserServices {
    pub broker: Arc<dyn BrokerGateway>,
    pub market: Arc<dyn MarketData>,
    pub liquidity: Arc<dyn LiquidityPolicy>,
    pub trading: TradingConfig,
}

impl std::fmt::Debug for UserServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserServices")
            .field("trading", &self.trading)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct ServiceRegistry {
    users: HashMap<String, Arc<UserServices>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build REST gateways for every configured user. The broker and the
    /// market data cache share one gateway, and so one session.
    pub fn from_config(config: &SchedulerConfig) -> Result<Self> {
        let liquidity: Arc<dyn LiquidityPolicy> =
            Arc::new(VolumeFractionPolicy::from(&config.liquidity));
        let cache_ttl = Duration::from_secs(config.market_cache.ttl_secs);

        let mut registry = Self::new();
        for user in &config.users {
            let gateway = Arc::new(build_gateway(user)?);
            let market = CachedMarketData::with_limits(
                gateway.clone(),
                cache_ttl,
                config.market_cache.max_entries,
            );
            registry.register(
                user.id.clone(),
                UserServices {
                    broker: gateway,
                    market: Arc::new(market),
                    liquidity: liquidity.clone(),
                    trading: user.trading.clone(),
                },
            );
            tracing::debug!(user_id = %user.id, base_url = %user.broker.base_url, "registered user services");
        }
        Ok(registry)
    }

    pub fn register(&mut self, user_id: impl Into<String>, services: UserServices) {
        self.users.insert(user_id.into(), Arc::new(services));
    }

    pub fn get(&self, user_id: &str) -> Option<Arc<UserServices>> {
        self.users.get(user_id).cloned()
    }

    pub fn user_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.users.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn build_gateway(user: &UserConfig) -> Result<HttpGateway> {
    let client_config = ClientConfig {
        timeout: Duration::from_secs(user.broker.timeout_secs),
        ..ClientConfig::default()
    };
    let credentials = Credentials {
        api_key: user.broker.api_key.clone(),
        api_secret: user.broker.api_secret.clone(),
    };
    HttpGateway::with_config(client_config, &user.broker.base_url, credentials)
        .with_context(|| format!("build broker gateway for user {}", user.id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_registers_each_user() {
        let config = SchedulerConfig::from_yaml_str(
            r#"
users:
  - id: alice
    broker:
      base_url: "http://127.0.0.1:9001"
      api_key: "k1"
      api_secret: "s1"
  - id: bob
    broker:
      base_url: "http://127.0.0.1:9002"
      api_key: "k2"
      api_secret: "s2"
    trading:
      user_capital: "50000"
"#,
        )
        .unwrap();

        let registry = ServiceRegistry::from_config(&config).unwrap();
        assert_eq!(registry.user_ids(), vec!["alice".to_string(), "bob".to_string()]);
        let bob = registry.get("bob").unwrap();
        assert_eq!(bob.trading.user_capital.to_string(), "50000");
        assert!(registry.get("carol").is_none());
    }

    #[test]
    fn test_invalid_base_url_is_rejected() {
        let config = SchedulerConfig::from_yaml_str(
            r#"
users:
  - id: alice
    broker:
      base_url: "not a url"
      api_key: "k1"
      api_secret: "s1"
"#,
        )
        .unwrap();
        assert!(ServiceRegistry::from_config(&config).is_err());
    }
}
