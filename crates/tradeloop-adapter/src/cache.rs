/*
[INPUT]:  Any MarketData implementation, TTL and capacity limits
[OUTPUT]: MarketData wrapper that serves recent price/volume reads from memory
[POS]:    Data layer - shared read-mostly cache between concurrently running tasks
[UPDATE]: When changing TTL or eviction semantics
*/

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::Result;
use crate::gateway::MarketData;

const DEFAULT_TTL: Duration = Duration::from_secs(30);
const DEFAULT_MAX_ENTRIES: usize = 2_048;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Price(String),
    Volume(String, u32),
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    value: Decimal,
    stored_at: Instant,
}

/// TTL cache in front of a [`MarketData`] source.
///
/// RSI reads are never cached; they are evaluated against the latest candle.
/// When the cache is full the oldest entry is evicted.
#[derive(Debug)]
pub struct CachedMarketData<M> {
    inner: Arc<M>,
    ttl: Duration,
    max_entries: usize,
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl<M: MarketData> CachedMarketData<M> {
    pub fn new(inner: Arc<M>) -> Self {
        Self::with_limits(inner, DEFAULT_TTL, DEFAULT_MAX_ENTRIES)
    }

    pub fn with_limits(inner: Arc<M>, ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner,
            ttl,
            max_entries: max_entries.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    async fn lookup(&self, key: &CacheKey) -> Option<Decimal> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|entry| entry.stored_at.elapsed() < self.ttl)
            .map(|entry| entry.value)
    }

    async fn store(&self, key: CacheKey, value: Decimal) {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        entries.retain(|_, entry| now.duration_since(entry.stored_at) < self.ttl);

        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.stored_at)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key,
            CacheEntry {
                value,
                stored_at: now,
            },
        );
    }
}

#[async_trait]
impl<M: MarketData> MarketData for CachedMarketData<M> {
    async fn current_price(&self, symbol: &str) -> Result<Decimal> {
        let key = CacheKey::Price(symbol.to_string());
        if let Some(value) = self.lookup(&key).await {
            return Ok(value);
        }
        let value = self.inner.current_price(symbol).await?;
        self.store(key, value).await;
        Ok(value)
    }

    async fn average_volume(&self, symbol: &str, lookback: u32) -> Result<Decimal> {
        let key = CacheKey::Volume(symbol.to_string(), lookback);
        if let Some(value) = self.lookup(&key).await {
            return Ok(value);
        }
        let value = self.inner.average_volume(symbol, lookback).await?;
        self.store(key, value).await;
        Ok(value)
    }

    async fn rsi(&self, symbol: &str, period: u32) -> Result<Decimal> {
        self.inner.rsi(symbol, period).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockMarketData;

    #[tokio::test(start_paused = true)]
    async fn serves_cached_price_until_ttl_expires() {
        let source = Arc::new(MockMarketData::new());
        source.set_price("INFY", Decimal::from(1500));
        let cache = CachedMarketData::with_limits(source.clone(), Duration::from_secs(10), 16);

        assert_eq!(cache.current_price("INFY").await.unwrap(), Decimal::from(1500));
        source.set_price("INFY", Decimal::from(1600));
        assert_eq!(cache.current_price("INFY").await.unwrap(), Decimal::from(1500));
        assert_eq!(source.price_calls(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.current_price("INFY").await.unwrap(), Decimal::from(1600));
        assert_eq!(source.price_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn evicts_oldest_entry_when_full() {
        let source = Arc::new(MockMarketData::new());
        for symbol in ["A", "B", "C"] {
            source.set_price(symbol, Decimal::from(10));
        }
        let cache = CachedMarketData::with_limits(source, Duration::from_secs(60), 2);

        for symbol in ["A", "B", "C"] {
            cache.current_price(symbol).await.unwrap();
            tokio::time::advance(Duration::from_millis(5)).await;
        }

        assert_eq!(cache.len().await, 2);
        assert!(cache.lookup(&CacheKey::Price("A".to_string())).await.is_none());
        assert!(cache.lookup(&CacheKey::Price("B".to_string())).await.is_some());
        assert!(cache.lookup(&CacheKey::Price("C".to_string())).await.is_some());
    }

    #[tokio::test]
    async fn rsi_is_never_cached() {
        let source = Arc::new(MockMarketData::new());
        source.set_rsi("TCS", Decimal::from(25));
        let cache = CachedMarketData::new(source.clone());

        assert_eq!(cache.rsi("TCS", 10).await.unwrap(), Decimal::from(25));
        source.set_rsi("TCS", Decimal::from(18));
        assert_eq!(cache.rsi("TCS", 10).await.unwrap(), Decimal::from(18));
        assert!(cache.is_empty().await);
    }
}
