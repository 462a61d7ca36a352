/*
[INPUT]:  Symbol identifiers and lookback parameters
[OUTPUT]: Price, average volume and RSI readings
[POS]:    HTTP layer - public market data endpoints (no session required)
[UPDATE]: When adding market data endpoints or changing response format
*/

use async_trait::async_trait;
use reqwest::Method;
use rust_decimal::Decimal;

use crate::error::{GatewayError, Result};
use crate::gateway::MarketData;
use crate::http::HttpGateway;
use crate::types::DecimalReply;

impl HttpGateway {
    async fn query_decimal(&self, endpoint: &str, query: &[(&str, String)], symbol: &str) -> Result<Decimal> {
        let builder = self.request(Method::GET, endpoint)?.query(query);
        match self.send_json::<DecimalReply>(builder).await {
            Ok(reply) => Ok(reply.value),
            Err(GatewayError::Api { code: 404, .. }) => Err(GatewayError::NoData {
                symbol: symbol.to_string(),
            }),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl MarketData for HttpGateway {
    /// GET /api/market/price?symbol={symbol}
    async fn current_price(&self, symbol: &str) -> Result<Decimal> {
        self.query_decimal(
            "/api/market/price",
            &[("symbol", symbol.to_string())],
            symbol,
        )
        .await
    }

    /// GET /api/market/volume?symbol={symbol}&lookback={lookback}
    async fn average_volume(&self, symbol: &str, lookback: u32) -> Result<Decimal> {
        self.query_decimal(
            "/api/market/volume",
            &[
                ("symbol", symbol.to_string()),
                ("lookback", lookback.to_string()),
            ],
            symbol,
        )
        .await
    }

    /// GET /api/market/rsi?symbol={symbol}&period={period}
    async fn rsi(&self, symbol: &str, period: u32) -> Result<Decimal> {
        self.query_decimal(
            "/api/market/rsi",
            &[
                ("symbol", symbol.to_string()),
                ("period", period.to_string()),
            ],
            symbol,
        )
        .await
    }
}
