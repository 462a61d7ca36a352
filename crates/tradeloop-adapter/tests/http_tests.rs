/*
[INPUT]:  Mock HTTP responses
[OUTPUT]: Test results for the REST gateway
[POS]:    Integration tests - HTTP endpoints
[UPDATE]: When HTTP endpoints change
*/

mod common;

use common::{SESSION_TOKEN, gateway_for, mount_session, setup_mock_server, test_credentials};
use reqwest::StatusCode;
use rstest::rstest;
use rust_decimal::Decimal;
use serde_json::json;
use tokio_test::assert_ok;
use tradeloop_adapter::{BrokerGateway, GatewayError, HttpGateway, MarketData, OrderType};
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

#[test]
fn test_gateway_creation() {
    let _gateway = assert_ok!(HttpGateway::new("http://127.0.0.1:9", test_credentials()));
}

#[test]
fn test_gateway_rejects_invalid_base_url() {
    let err = HttpGateway::new("not a url", test_credentials()).unwrap_err();
    assert!(matches!(err, GatewayError::UrlParse(_)));
}

#[tokio::test]
async fn test_place_buy_logs_in_and_sends_bearer() {
    let server = setup_mock_server().await;

    Mock::given(method("POST"))
        .and(path("/api/session"))
        .and(body_partial_json(json!({ "api_key": "key-1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token": SESSION_TOKEN,
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/orders"))
        .and(header("authorization", format!("Bearer {SESSION_TOKEN}")))
        .and(body_partial_json(json!({
            "symbol": "RELIANCE",
            "side": "buy",
            "order_type": "amo",
            "quantity": 40,
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "order_id": "B-1001",
            "status": "open",
        })))
        .expect(2)
        .mount(&server)
        .await;

    let gateway = gateway_for(&server);
    let placed = gateway.place_buy("RELIANCE", 40, OrderType::Amo).await.unwrap();
    assert_eq!(placed.order_id, "B-1001");
    assert!(gateway.has_session().await);

    // Second call reuses the cached session.
    gateway.place_buy("RELIANCE", 40, OrderType::Amo).await.unwrap();
}

#[tokio::test]
async fn test_unauthorized_maps_to_auth_error() {
    let server = setup_mock_server().await;
    mount_session(&server).await;

    Mock::given(method("GET"))
        .and(path("/api/holdings"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "message": "session expired",
        })))
        .mount(&server)
        .await;

    let gateway = gateway_for(&server);
    let err = gateway.get_holdings().await.unwrap_err();
    assert!(err.is_auth_error());
    assert!(err.to_string().contains("session expired"));
}

#[tokio::test]
async fn test_force_relogin_reports_two_factor_as_refused() {
    let server = setup_mock_server().await;

    Mock::given(method("POST"))
        .and(path("/api/session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "two_factor_required": true,
        })))
        .mount(&server)
        .await;

    let gateway = gateway_for(&server);
    assert!(!gateway.force_relogin().await.unwrap());
    assert!(!gateway.has_session().await);
}

#[tokio::test]
async fn test_force_relogin_replaces_session() {
    let server = setup_mock_server().await;
    mount_session(&server).await;

    let gateway = gateway_for(&server);
    assert!(gateway.force_relogin().await.unwrap());
    assert!(gateway.has_session().await);
}

#[tokio::test]
async fn test_active_buy_order_query() {
    let server = setup_mock_server().await;
    mount_session(&server).await;

    Mock::given(method("GET"))
        .and(path("/api/orders/active"))
        .and(query_param("symbol", "TCS"))
        .and(query_param("side", "buy"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "active": true })))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = gateway_for(&server);
    assert!(gateway.has_active_buy_order("TCS").await.unwrap());
}

#[tokio::test]
async fn test_holdings_and_funds_parse_decimal_strings() {
    let server = setup_mock_server().await;
    mount_session(&server).await;

    Mock::given(method("GET"))
        .and(path("/api/holdings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "symbol": "INFY", "quantity": 12, "average_price": "1450.50" }
        ])))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/funds"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "available_cash": "25000.75"
        })))
        .mount(&server)
        .await;

    let gateway = gateway_for(&server);
    let holdings = gateway.get_holdings().await.unwrap();
    assert_eq!(holdings.len(), 1);
    assert_eq!(holdings[0].average_price, Decimal::new(145050, 2));
    assert_eq!(gateway.available_cash().await.unwrap(), Decimal::new(2500075, 2));
}

#[tokio::test]
async fn test_market_data_endpoints() {
    let server = setup_mock_server().await;

    Mock::given(method("GET"))
        .and(path("/api/market/price"))
        .and(query_param("symbol", "INFY"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": "1502.4" })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/market/volume"))
        .and(query_param("lookback", "20"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": "850000" })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/market/rsi"))
        .and(query_param("period", "10"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "message": "no candles" })))
        .mount(&server)
        .await;

    let gateway = gateway_for(&server);
    assert_eq!(gateway.current_price("INFY").await.unwrap(), Decimal::new(15024, 1));
    assert_eq!(
        gateway.average_volume("INFY", 20).await.unwrap(),
        Decimal::from(850_000)
    );
    let err = gateway.rsi("INFY", 10).await.unwrap_err();
    assert!(matches!(err, GatewayError::NoData { ref symbol } if symbol == "INFY"));
}

#[tokio::test]
async fn test_rate_limit_reads_retry_after() {
    let server = setup_mock_server().await;

    Mock::given(method("GET"))
        .and(path("/api/market/price"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
        .mount(&server)
        .await;

    let gateway = gateway_for(&server);
    let err = gateway.current_price("INFY").await.unwrap_err();
    assert!(matches!(err, GatewayError::RateLimit { retry_after: 7 }));
    assert!(err.is_retryable());
}

#[rstest]
#[case(StatusCode::UNPROCESSABLE_ENTITY, false, false)]
#[case(StatusCode::INTERNAL_SERVER_ERROR, true, false)]
#[case(StatusCode::FORBIDDEN, false, true)]
#[tokio::test]
async fn test_order_error_classification(
    #[case] status: StatusCode,
    #[case] retryable: bool,
    #[case] auth: bool,
) {
    let server = setup_mock_server().await;
    mount_session(&server).await;

    Mock::given(method("POST"))
        .and(path("/api/orders"))
        .respond_with(ResponseTemplate::new(status.as_u16()).set_body_json(json!({
            "message": "refused",
        })))
        .mount(&server)
        .await;

    let gateway = gateway_for(&server);
    let err = gateway.place_buy("INFY", 1, OrderType::Market).await.unwrap_err();
    assert_eq!(err.is_retryable(), retryable);
    assert_eq!(err.is_auth_error(), auth);
}
