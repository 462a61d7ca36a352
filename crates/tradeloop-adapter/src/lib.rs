/*
[INPUT]:  Crate modules and public type definitions
[OUTPUT]: Broker/market data contracts, REST gateway, cache and test doubles
[POS]:    Crate root - module wiring
[UPDATE]: When public modules or exports change
*/

pub mod cache;
pub mod error;
pub mod gateway;
pub mod http;
pub mod mock;
pub mod types;

pub use cache::CachedMarketData;
pub use error::{GatewayError, Result};
pub use gateway::{BrokerGateway, MarketData};
pub use http::{ClientConfig, Credentials, HttpGateway};
pub use mock::{MockBroker, MockMarketData};
pub use types::*;
