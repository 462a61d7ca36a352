/*
[INPUT]:  HTTP configuration (base URL, timeouts, API credentials)
[OUTPUT]: Configured reqwest client with lazy session handling
[POS]:    HTTP layer - core client implementation
[UPDATE]: When adding connection options or changing session behavior
*/

use crate::error::{GatewayError, Result};
use crate::types::ErrorReply;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::RwLock;

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// API credentials used to open a broker session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

#[derive(Debug, Deserialize)]
struct SessionReply {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    two_factor_required: bool,
}

/// REST gateway for one user's broker account.
///
/// Implements both [`crate::BrokerGateway`] and [`crate::MarketData`].
#[derive(Debug)]
pub struct HttpGateway {
    http_client: Client,
    base_url: Url,
    credentials: Credentials,
    timeout: Duration,
    session: RwLock<Option<String>>,
}

impl HttpGateway {
    pub fn new(base_url: &str, credentials: Credentials) -> Result<Self> {
        Self::with_config(ClientConfig::default(), base_url, credentials)
    }

    pub fn with_config(config: ClientConfig, base_url: &str, credentials: Credentials) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self {
            http_client,
            base_url: Url::parse(base_url)?,
            credentials,
            timeout: config.timeout,
            session: RwLock::new(None),
        })
    }

    pub async fn has_session(&self) -> bool {
        self.session.read().await.is_some()
    }

    pub(crate) fn request(&self, method: Method, endpoint: &str) -> Result<RequestBuilder> {
        let url = self.base_url.join(endpoint)?;
        Ok(self.http_client.request(method, url))
    }

    /// Build a request carrying the session token, logging in first if needed.
    pub(crate) async fn authed_request(
        &self,
        method: Method,
        endpoint: &str,
    ) -> Result<RequestBuilder> {
        let token = self.session_token().await?;
        Ok(self.request(method, endpoint)?.bearer_auth(token))
    }

    async fn session_token(&self) -> Result<String> {
        if let Some(token) = self.session.read().await.as_ref() {
            return Ok(token.clone());
        }
        self.login().await
    }

    /// POST /api/session
    pub(crate) async fn login(&self) -> Result<String> {
        let mut guard = self.session.write().await;
        let builder = self
            .request(Method::POST, "/api/session")?
            .json(&self.credentials);
        let reply: SessionReply = self.send_json(builder).await?;

        if reply.two_factor_required {
            *guard = None;
            return Err(GatewayError::TwoFactorRequired);
        }
        let token = reply.token.ok_or_else(|| {
            GatewayError::InvalidResponse("session reply without token".to_string())
        })?;
        tracing::debug!(base_url = %self.base_url, "broker session opened");
        *guard = Some(token.clone());
        Ok(token)
    }

    pub(crate) async fn clear_session(&self) {
        *self.session.write().await = None;
    }

    pub(crate) async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = builder.send().await.map_err(|err| self.map_transport(err))?;
        let status = response.status();

        if status.is_success() {
            let bytes = response.bytes().await.map_err(|err| self.map_transport(err))?;
            return Ok(serde_json::from_slice(&bytes)?);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(1);
            return Err(GatewayError::RateLimit { retry_after });
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorReply>(&body)
            .map(|reply| reply.message)
            .unwrap_or(body);

        if status == StatusCode::UNPROCESSABLE_ENTITY {
            return Err(GatewayError::OrderRejected { reason: message });
        }
        Err(GatewayError::api_error(status, message))
    }

    fn map_transport(&self, err: reqwest::Error) -> GatewayError {
        if err.is_timeout() {
            GatewayError::Timeout {
                duration: self.timeout.as_secs(),
            }
        } else {
            GatewayError::Http(err)
        }
    }
}
