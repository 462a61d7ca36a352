/*
[INPUT]:  Order intents and portfolio queries from task bodies
[OUTPUT]: Broker replies (acks, holdings, funds, session state)
[POS]:    HTTP layer - authenticated trading endpoints
[UPDATE]: When adding trading endpoints or changing order flow
*/

use async_trait::async_trait;
use reqwest::Method;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::gateway::BrokerGateway;
use crate::http::HttpGateway;
use crate::types::{
    ActiveOrderReply, Funds, Holding, OrderType, PlaceOrderRequest, PlacedOrder, Side,
};

impl HttpGateway {
    /// POST /api/orders
    async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: i64,
        order_type: OrderType,
    ) -> Result<PlacedOrder> {
        let req = PlaceOrderRequest {
            symbol: symbol.to_string(),
            side,
            order_type,
            quantity,
            tag: format!("tl:{}", Uuid::new_v4()),
        };
        let builder = self
            .authed_request(Method::POST, "/api/orders")
            .await?
            .json(&req);
        let placed: PlacedOrder = self.send_json(builder).await?;
        tracing::info!(
            symbol = %symbol,
            side = ?side,
            quantity,
            order_type = order_type.as_str(),
            order_id = %placed.order_id,
            "order accepted by broker"
        );
        Ok(placed)
    }
}

#[async_trait]
impl BrokerGateway for HttpGateway {
    async fn place_buy(
        &self,
        symbol: &str,
        quantity: i64,
        order_type: OrderType,
    ) -> Result<PlacedOrder> {
        self.place_order(symbol, Side::Buy, quantity, order_type).await
    }

    async fn place_sell(
        &self,
        symbol: &str,
        quantity: i64,
        order_type: OrderType,
    ) -> Result<PlacedOrder> {
        self.place_order(symbol, Side::Sell, quantity, order_type).await
    }

    /// GET /api/holdings
    async fn get_holdings(&self) -> Result<Vec<Holding>> {
        let builder = self.authed_request(Method::GET, "/api/holdings").await?;
        self.send_json(builder).await
    }

    /// GET /api/orders/active?symbol={symbol}&side=buy
    async fn has_active_buy_order(&self, symbol: &str) -> Result<bool> {
        let builder = self
            .authed_request(Method::GET, "/api/orders/active")
            .await?
            .query(&[("symbol", symbol), ("side", "buy")]);
        let reply: ActiveOrderReply = self.send_json(builder).await?;
        Ok(reply.active)
    }

    /// GET /api/funds
    async fn available_cash(&self) -> Result<Decimal> {
        let builder = self.authed_request(Method::GET, "/api/funds").await?;
        let funds: Funds = self.send_json(builder).await?;
        Ok(funds.available_cash)
    }

    async fn force_relogin(&self) -> Result<bool> {
        self.clear_session().await;
        match self.login().await {
            Ok(_) => {
                tracing::info!("broker session re-established");
                Ok(true)
            }
            Err(err) if err.is_auth_error() => {
                tracing::warn!("broker re-login refused: {err}");
                Ok(false)
            }
            Err(GatewayError::Api { code, message }) if code == 400 => {
                tracing::warn!(code, "broker re-login rejected: {message}");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}
