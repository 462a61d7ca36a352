/*
[INPUT]:  Test configuration and mock server requirements
[OUTPUT]: Shared test utilities, fixtures, and mock helpers
[POS]:    Test infrastructure - shared across all test modules
[UPDATE]: When adding new test patterns or fixtures
*/

//! Common test utilities for tradeloop-adapter tests

use serde_json::json;
use tradeloop_adapter::{Credentials, HttpGateway};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const SESSION_TOKEN: &str = "session-token-1";

/// Setup a mock HTTP server for testing
pub async fn setup_mock_server() -> MockServer {
    MockServer::start().await
}

pub fn test_credentials() -> Credentials {
    Credentials {
        api_key: "key-1".to_string(),
        api_secret: "secret-1".to_string(),
    }
}

pub fn gateway_for(server: &MockServer) -> HttpGateway {
    HttpGateway::new(&server.uri(), test_credentials()).expect("gateway should build")
}

/// Mount a session endpoint that always hands out [`SESSION_TOKEN`].
pub async fn mount_session(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token": SESSION_TOKEN,
        })))
        .mount(server)
        .await;
}
