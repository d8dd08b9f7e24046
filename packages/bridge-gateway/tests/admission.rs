mod common;

use common::*;

use bridge_ws::config::GatewayConfig;
use bridge_ws::server::{RunnerFactories, CLOSE_CODE_AUTH_FAILED, CLOSE_CODE_ORIGIN_REJECTED};

#[tokio::test]
async fn unlisted_origin_is_closed_with_4003() {
    let config = GatewayConfig {
        allowed_origins: vec!["https://app.example.com".to_string()],
        ..GatewayConfig::default()
    };
    let gateway = start_gateway(config, RunnerFactories::default()).await;

    let mut ws = connect_with_headers(
        &gateway.ws_url,
        &[("origin", "https://evil.example.com")],
    )
    .await;
    // No protocol frame precedes the close.
    expect_close_code(&mut ws, CLOSE_CODE_ORIGIN_REJECTED).await;
}

#[tokio::test]
async fn listed_and_absent_origins_are_admitted() {
    let config = GatewayConfig {
        allowed_origins: vec!["https://app.example.com".to_string()],
        ..GatewayConfig::default()
    };
    let gateway = start_gateway(config, RunnerFactories::default()).await;

    let mut ws = connect_with_headers(
        &gateway.ws_url,
        &[("origin", "https://app.example.com")],
    )
    .await;
    expect_connected(&mut ws, "bridge-ws").await;

    // Non-browser clients send no Origin header at all.
    let mut ws = connect(&gateway.ws_url).await;
    expect_connected(&mut ws, "bridge-ws").await;
}

#[tokio::test]
async fn missing_api_key_is_closed_with_4001() {
    let config = GatewayConfig {
        api_key: Some("secret-key".to_string()),
        ..GatewayConfig::default()
    };
    let gateway = start_gateway(config, RunnerFactories::default()).await;

    let mut ws = connect(&gateway.ws_url).await;
    expect_close_code(&mut ws, CLOSE_CODE_AUTH_FAILED).await;
}

#[tokio::test]
async fn bearer_key_must_match_exactly() {
    let config = GatewayConfig {
        api_key: Some("secret-key".to_string()),
        ..GatewayConfig::default()
    };
    let gateway = start_gateway(config, RunnerFactories::default()).await;

    let mut ws = connect_with_headers(
        &gateway.ws_url,
        &[("authorization", "Bearer wrong-key")],
    )
    .await;
    expect_close_code(&mut ws, CLOSE_CODE_AUTH_FAILED).await;

    let mut ws = connect_with_headers(
        &gateway.ws_url,
        &[("authorization", "Bearer secret-key")],
    )
    .await;
    expect_connected(&mut ws, "bridge-ws").await;
}
