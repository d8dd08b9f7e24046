use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use bridge_ws::config::GatewayConfig;
use bridge_ws::server::{serve_with_shutdown, GatewayState, RunnerFactories, RunnerFactory};
use bridge_ws_runner::testing::MockRunner;
use bridge_ws_runner::Runner;

pub type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct TestGateway {
    pub state: Arc<GatewayState>,
    pub ws_url: String,
    pub http_url: String,
}

pub async fn start_gateway(config: GatewayConfig, factories: RunnerFactories) -> TestGateway {
    let state = GatewayState::with_factories(config, factories);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let serve_state = state.clone();
    tokio::spawn(async move {
        let _ = serve_with_shutdown(serve_state, listener, std::future::pending()).await;
    });
    TestGateway {
        state,
        ws_url: format!("ws://{addr}/"),
        http_url: format!("http://{addr}"),
    }
}

pub fn factory_for(runner: Arc<MockRunner>) -> RunnerFactory {
    Arc::new(move |_config| {
        let runner: Arc<dyn Runner> = runner.clone();
        runner
    })
}

pub async fn connect(url: &str) -> WsClient {
    connect_async(url).await.expect("ws connect").0
}

pub async fn connect_with_headers(url: &str, headers: &[(&str, &str)]) -> WsClient {
    let mut request = url.into_client_request().expect("client request");
    for (name, value) in headers {
        request.headers_mut().insert(
            tokio_tungstenite::tungstenite::http::HeaderName::try_from(*name)
                .expect("header name"),
            value.parse().expect("header value"),
        );
    }
    connect_async(request).await.expect("ws connect").0
}

pub async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(Message::Text(value.to_string()))
        .await
        .expect("send frame");
}

pub async fn send_text(ws: &mut WsClient, text: &str) {
    ws.send(Message::Text(text.to_string()))
        .await
        .expect("send frame");
}

pub async fn recv_json(ws: &mut WsClient) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket ended")
            .expect("socket error");
        match message {
            Message::Text(text) => return serde_json::from_str(&text).expect("frame is JSON"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

pub async fn expect_connected(ws: &mut WsClient, agent: &str) {
    let frame = recv_json(ws).await;
    assert_eq!(
        frame,
        serde_json::json!({ "type": "connected", "version": "2.0", "agent": agent })
    );
}

/// Asserts the very next non-ping event is a close with the given code.
pub async fn expect_close_code(ws: &mut WsClient, code: u16) {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for close")
        {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), code);
                return;
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(other)) => panic!("expected close, got {other:?}"),
            Some(Err(err)) => panic!("socket error before close: {err}"),
            None => panic!("socket ended without close frame"),
        }
    }
}

/// Reads until the socket closes, tolerating in-flight frames.
pub async fn expect_closed(ws: &mut WsClient) {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for close")
        {
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => continue,
            Some(Err(_)) => return,
        }
    }
}
