/*
[INPUT]:  HTTP client configuration and broker REST endpoints
[OUTPUT]: HttpGateway implementing the broker and market data contracts
[POS]:    HTTP layer - REST API communication
[UPDATE]: When adding new endpoints or changing client behavior
*/

pub mod broker;
pub mod client;
pub mod market;

pub use client::{ClientConfig, Credentials, HttpGateway};
