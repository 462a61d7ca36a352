/*
[INPUT]:  Error sources (HTTP transport, broker API replies, serialization, session state)
[OUTPUT]: Structured gateway errors with retry and re-login hints
[POS]:    Error handling layer - shared by every gateway implementation
[UPDATE]: When adding new error sources or changing retry classification
*/

use reqwest::StatusCode;
use thiserror::Error;

/// Errors surfaced by broker and market data gateways.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// HTTP request failed before a response arrived
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Broker API returned an error response
    #[error("API error (code {code}): {message}")]
    Api { code: i32, message: String },

    /// Session is not authenticated or the token was rejected
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// Broker requires a second factor before accepting orders
    #[error("Two-factor authentication required")]
    TwoFactorRequired,

    /// Order was refused by the broker (margin, circuit limits, ...)
    #[error("Order rejected: {reason}")]
    OrderRejected { reason: String },

    /// No market data available for the symbol
    #[error("No market data for {symbol}")]
    NoData { symbol: String },

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parsing failed
    #[error("Invalid URL: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Invalid response from server
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Rate limit exceeded
    #[error("Rate limit exceeded, retry after {retry_after}s")]
    RateLimit { retry_after: u64 },

    /// Connection timeout
    #[error("Connection timeout after {duration}s")]
    Timeout { duration: u64 },
}

impl GatewayError {
    /// Check if the error is worth retrying on a later tick
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Http(_)
                | GatewayError::RateLimit { .. }
                | GatewayError::Timeout { .. }
                | GatewayError::InvalidResponse(_)
                | GatewayError::NoData { .. }
        ) || matches!(self, GatewayError::Api { code, .. } if *code >= 500)
    }

    /// Check if error requires a fresh broker session
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            GatewayError::Authentication { .. } | GatewayError::TwoFactorRequired
        )
    }

    /// Create an API error from status code and message
    pub fn api_error(status: StatusCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                GatewayError::Authentication { message }
            }
            _ => GatewayError::Api {
                code: status.as_u16() as i32,
                message,
            },
        }
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
