//! Server engine: one HTTP listener serving `/healthz` and WebSocket
//! upgrades, admission control, frame dispatch, the heartbeat sweep and
//! graceful shutdown.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use bridge_ws_protocol::{
    parse_client_frame, CancelRequest, ClientFrame, PromptRequest, ProviderKind, ServerFrame,
};
use bridge_ws_runner::{
    ClaudeConfig, ClaudeProvider, CodexConfig, CodexProvider, ImageInput, OllamaConfig,
    OllamaRunner, ProcessRunner, RunRequest, Runner, RunnerEvents,
};

use crate::config::GatewayConfig;
use crate::connection::{Connection, ConnectionEvents};

pub const CLOSE_CODE_AUTH_FAILED: u16 = 4001;
pub const CLOSE_CODE_ORIGIN_REJECTED: u16 = 4003;

const SERVER_INFO: &str = "\
This is a bridge-ws gateway. Available endpoints:\n\
  - GET  /healthz  - Health check\n\
  - GET  /         - WebSocket upgrade\n";

/// Constructs a runner for one provider; tests substitute in-memory fakes.
pub type RunnerFactory = Arc<dyn Fn(&GatewayConfig) -> Arc<dyn Runner> + Send + Sync>;

#[derive(Clone, Default)]
pub struct RunnerFactories {
    pub claude: Option<RunnerFactory>,
    pub codex: Option<RunnerFactory>,
    pub ollama: Option<RunnerFactory>,
}

pub struct GatewayState {
    pub config: GatewayConfig,
    factories: RunnerFactories,
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
    next_connection_id: AtomicU64,
}

impl GatewayState {
    pub fn new(config: GatewayConfig) -> Arc<Self> {
        Self::with_factories(config, RunnerFactories::default())
    }

    pub fn with_factories(config: GatewayConfig, factories: RunnerFactories) -> Arc<Self> {
        Arc::new(Self {
            config,
            factories,
            connections: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
        })
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().expect("connections lock").len()
    }

    fn next_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::SeqCst)
    }

    fn register(&self, connection: Arc<Connection>) {
        self.connections
            .lock()
            .expect("connections lock")
            .insert(connection.id, connection);
    }

    fn unregister(&self, connection_id: u64) {
        self.connections
            .lock()
            .expect("connections lock")
            .remove(&connection_id);
    }

    fn build_runner(&self, provider: ProviderKind) -> Arc<dyn Runner> {
        let factory = match provider {
            ProviderKind::Claude => &self.factories.claude,
            ProviderKind::Codex => &self.factories.codex,
            ProviderKind::Ollama => &self.factories.ollama,
        };
        if let Some(factory) = factory {
            return factory(&self.config);
        }
        match provider {
            ProviderKind::Claude => {
                let mut config = ClaudeConfig::new(
                    self.config.claude_binary.clone(),
                    self.config.session_dir.clone(),
                );
                config.max_turns = self.config.max_turns;
                config.tools = self.config.tools.clone();
                Arc::new(ProcessRunner::new(ClaudeProvider::new(config)))
            }
            ProviderKind::Codex => Arc::new(ProcessRunner::new(CodexProvider::new(
                CodexConfig::new(
                    self.config.codex_binary.clone(),
                    self.config.session_dir.clone(),
                ),
            ))),
            ProviderKind::Ollama => Arc::new(OllamaRunner::new(OllamaConfig::new(
                self.config.ollama_url.clone(),
            ))),
        }
    }

    /// Walks all connections once: unresponsive peers are disposed and
    /// terminated, everyone else gets a ping and must pong before the next
    /// sweep.
    async fn sweep_connections(&self) {
        let snapshot: Vec<Arc<Connection>> = self
            .connections
            .lock()
            .expect("connections lock")
            .values()
            .cloned()
            .collect();
        for connection in snapshot {
            if !connection.take_liveness() {
                tracing::info!(
                    connection_id = connection.id,
                    "terminating unresponsive connection"
                );
                self.unregister(connection.id);
                connection.dispose_all().await;
                connection.close();
            } else if !connection.send_ping() {
                self.unregister(connection.id);
                connection.dispose_all().await;
            }
        }
    }

    pub fn spawn_heartbeat(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let state = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(state.config.heartbeat_interval);
            interval.tick().await; // the first tick fires immediately
            loop {
                interval.tick().await;
                state.sweep_connections().await;
            }
        })
    }

    /// Disposes every connection's runners and terminates the sockets.
    /// In-flight requests receive no further events.
    pub async fn shutdown(&self) {
        let connections: Vec<Arc<Connection>> = {
            let mut table = self.connections.lock().expect("connections lock");
            table.drain().map(|(_, connection)| connection).collect()
        };
        for connection in connections {
            connection.dispose_all().await;
            connection.close();
        }
    }
}

pub fn build_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/healthz", get(get_healthz))
        .route("/", get(upgrade_or_info))
        .route("/ws", get(upgrade_or_info))
        .fallback(not_found)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Binds the listener's address and serves until ctrl-c.
pub async fn serve(
    state: Arc<GatewayState>,
    listener: tokio::net::TcpListener,
) -> std::io::Result<()> {
    serve_with_shutdown(state, listener, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

pub async fn serve_with_shutdown(
    state: Arc<GatewayState>,
    listener: tokio::net::TcpListener,
    signal: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let heartbeat = state.spawn_heartbeat();
    let router = build_router(state.clone());
    let shutdown_state = state.clone();
    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            signal.await;
            tracing::info!("shutting down");
            shutdown_state.shutdown().await;
        })
        .await;
    heartbeat.abort();
    result
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub connections: usize,
}

async fn get_healthz(State(state): State<Arc<GatewayState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        connections: state.connection_count(),
    })
}

async fn not_found() -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, format!("404 Not Found\n\n{SERVER_INFO}"))
}

async fn upgrade_or_info(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let Some(ws) = ws else {
        return SERVER_INFO.into_response();
    };
    // Admission is decided here but delivered post-upgrade: the contract is
    // a WebSocket close code, not an HTTP status.
    let rejection = admission_rejection(&state.config, &headers);
    ws.max_message_size(state.config.max_frame_bytes)
        .max_frame_size(state.config.max_frame_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, rejection))
}

fn admission_rejection(config: &GatewayConfig, headers: &HeaderMap) -> Option<CloseFrame<'static>> {
    if !config.allowed_origins.is_empty() {
        // An absent Origin header is allowed: non-browser clients.
        if let Some(origin) = headers.get(header::ORIGIN).and_then(|value| value.to_str().ok()) {
            if !config.allowed_origins.iter().any(|allowed| allowed == origin) {
                return Some(CloseFrame {
                    code: CLOSE_CODE_ORIGIN_REJECTED,
                    reason: "Origin not allowed".into(),
                });
            }
        }
    }
    if let Some(expected) = &config.api_key {
        let provided = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        if provided != Some(expected.as_str()) {
            return Some(CloseFrame {
                code: CLOSE_CODE_AUTH_FAILED,
                reason: "Authorization required".into(),
            });
        }
    }
    None
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<GatewayState>,
    rejection: Option<CloseFrame<'static>>,
) {
    let (mut sink, mut stream) = socket.split();

    if let Some(close) = rejection {
        tracing::info!(code = close.code, reason = %close.reason, "rejecting connection");
        let _ = sink.send(Message::Close(Some(close))).await;
        return;
    }

    let (writer, mut writer_rx) = mpsc::unbounded_channel::<Message>();
    let writer_task = tokio::spawn(async move {
        while let Some(message) = writer_rx.recv().await {
            let is_close = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() {
                break;
            }
            if is_close {
                break;
            }
        }
    });

    let connection = Arc::new(Connection::new(state.next_id(), writer));
    state.register(connection.clone());
    tracing::info!(connection_id = connection.id, "client connected");

    connection.send_frame(&ServerFrame::connected(state.config.agent_name.clone()));

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => dispatch_frame(&state, &connection, &text).await,
                    Some(Ok(Message::Pong(_))) => connection.mark_alive(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::warn!(connection_id = connection.id, error = %err, "websocket read failed");
                        break;
                    }
                }
            }
            _ = connection.wait_closed() => break,
        }
    }

    state.unregister(connection.id);
    connection.dispose_all().await;
    writer_task.abort();
    tracing::info!(connection_id = connection.id, "client disconnected");
}

async fn dispatch_frame(state: &Arc<GatewayState>, connection: &Arc<Connection>, text: &str) {
    match parse_client_frame(text) {
        Err(message) => connection.send_frame(&ServerFrame::error(message, None)),
        Ok(ClientFrame::Prompt(prompt)) => dispatch_prompt(state, connection, prompt).await,
        Ok(ClientFrame::Cancel(cancel)) => dispatch_cancel(connection, cancel).await,
    }
}

async fn dispatch_prompt(
    state: &Arc<GatewayState>,
    connection: &Arc<Connection>,
    prompt: PromptRequest,
) {
    let request_id = prompt.request_id.clone();
    if connection.has_request(&request_id) {
        connection.send_frame(&ServerFrame::error(
            format!("Request {request_id} is already in progress"),
            Some(request_id),
        ));
        return;
    }

    tracing::info!(
        connection_id = connection.id,
        request_id = %request_id,
        provider = prompt.provider.as_str(),
        "dispatching prompt"
    );

    let provider = prompt.provider;
    let runner = connection.runner_for(provider, || state.build_runner(provider));
    connection.insert_request(request_id.clone(), runner.clone());

    let events: Arc<dyn RunnerEvents> = Arc::new(ConnectionEvents::new(connection.clone()));
    let request = to_run_request(prompt, state.config.request_timeout);
    runner.run(request, events).await;
}

async fn dispatch_cancel(connection: &Arc<Connection>, cancel: CancelRequest) {
    let request_id = cancel.request_id;
    match connection.take_request(&request_id) {
        None => connection.send_frame(&ServerFrame::error(
            format!("No active request with id: {request_id}"),
            Some(request_id),
        )),
        Some(active) => {
            tracing::info!(connection_id = connection.id, request_id = %request_id, "cancelling request");
            active.runner.kill().await;
            connection.send_frame(&ServerFrame::error(
                "Request cancelled",
                Some(request_id),
            ));
        }
    }
}

fn to_run_request(prompt: PromptRequest, timeout: std::time::Duration) -> RunRequest {
    RunRequest {
        request_id: prompt.request_id,
        prompt: prompt.prompt,
        model: prompt.model,
        system_prompt: prompt.system_prompt,
        project_id: prompt.project_id,
        thinking_tokens: prompt.thinking_tokens,
        images: prompt
            .images
            .into_iter()
            .map(|image| ImageInput {
                media_type: image.media_type,
                data: image.data,
            })
            .collect(),
        timeout,
    }
}
