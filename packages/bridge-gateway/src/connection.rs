//! Per-connection state: the request registry, the per-provider runner
//! cache and the liveness flag the heartbeat sweeps.
//!
//! A connection exclusively owns its runners and registry; nothing here is
//! shared across connections. Frames are handed to a dedicated writer task
//! through an unbounded channel, which also serializes outbound ordering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::ws::Message;
use tokio::sync::mpsc;

use bridge_ws_protocol::{ProviderKind, ServerFrame};
use bridge_ws_runner::{Runner, RunnerEvents};

pub struct ActiveRequest {
    pub runner: Arc<dyn Runner>,
}

pub struct Connection {
    pub id: u64,
    writer: mpsc::UnboundedSender<Message>,
    requests: Mutex<HashMap<String, ActiveRequest>>,
    runners: Mutex<HashMap<ProviderKind, Arc<dyn Runner>>>,
    is_alive: AtomicBool,
    closed: tokio::sync::Notify,
}

impl Connection {
    pub fn new(id: u64, writer: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id,
            writer,
            requests: Mutex::new(HashMap::new()),
            runners: Mutex::new(HashMap::new()),
            is_alive: AtomicBool::new(true),
            closed: tokio::sync::Notify::new(),
        }
    }

    /// Best-effort write: a frame for a closed socket is dropped and logged.
    pub fn send_frame(&self, frame: &ServerFrame) {
        if self.writer.send(Message::Text(frame.to_json())).is_err() {
            tracing::warn!(connection_id = self.id, "dropping frame for closed connection");
        }
    }

    pub fn send_ping(&self) -> bool {
        self.writer.send(Message::Ping(Vec::new())).is_ok()
    }

    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::SeqCst);
    }

    /// Clears the liveness flag, returning whether the peer answered the
    /// previous ping.
    pub fn take_liveness(&self) -> bool {
        self.is_alive.swap(false, Ordering::SeqCst)
    }

    /// Queues a close frame and wakes the read loop so the socket task
    /// terminates promptly.
    pub fn close(&self) {
        let _ = self.writer.send(Message::Close(None));
        self.closed.notify_one();
    }

    pub async fn wait_closed(&self) {
        self.closed.notified().await;
    }

    pub fn has_request(&self, request_id: &str) -> bool {
        self.requests
            .lock()
            .expect("requests lock")
            .contains_key(request_id)
    }

    pub fn insert_request(&self, request_id: String, runner: Arc<dyn Runner>) {
        self.requests
            .lock()
            .expect("requests lock")
            .insert(request_id, ActiveRequest { runner });
    }

    pub fn remove_request(&self, request_id: &str) -> bool {
        self.requests
            .lock()
            .expect("requests lock")
            .remove(request_id)
            .is_some()
    }

    pub fn take_request(&self, request_id: &str) -> Option<ActiveRequest> {
        self.requests
            .lock()
            .expect("requests lock")
            .remove(request_id)
    }

    /// Returns the cached runner for a provider, building and caching it on
    /// first use. Runners live for the lifetime of the connection.
    pub fn runner_for(
        &self,
        provider: ProviderKind,
        build: impl FnOnce() -> Arc<dyn Runner>,
    ) -> Arc<dyn Runner> {
        self.runners
            .lock()
            .expect("runners lock")
            .entry(provider)
            .or_insert_with(build)
            .clone()
    }

    /// Disposes every cached runner and every active-request runner. Safe
    /// to call more than once; the maps drain on first call.
    pub async fn dispose_all(&self) {
        let runners: Vec<Arc<dyn Runner>> = {
            let mut cached = self.runners.lock().expect("runners lock");
            cached.drain().map(|(_, runner)| runner).collect()
        };
        let active: Vec<ActiveRequest> = {
            let mut requests = self.requests.lock().expect("requests lock");
            requests.drain().map(|(_, request)| request).collect()
        };
        for runner in runners {
            runner.dispose().await;
        }
        for request in active {
            request.runner.dispose().await;
        }
    }
}

/// Binds a runner's callbacks to the connection writer: chunks forward as
/// frames, terminal events speak only if they win the registry removal.
///
/// The runner's completion task runs in parallel with the connection's
/// dispatch task, so a natural completion can race an explicit cancel for
/// the same id. The `requests` map is the arbiter: whichever side removes
/// the entry first sends the terminal frame, the loser stays silent.
pub struct ConnectionEvents {
    connection: Arc<Connection>,
}

impl ConnectionEvents {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self { connection }
    }
}

impl RunnerEvents for ConnectionEvents {
    fn on_chunk(&self, text: &str, request_id: &str, thinking: bool) {
        self.connection
            .send_frame(&ServerFrame::chunk(text, request_id, thinking));
    }

    fn on_complete(&self, request_id: &str) {
        if self.connection.remove_request(request_id) {
            self.connection.send_frame(&ServerFrame::complete(request_id));
        }
    }

    fn on_error(&self, message: &str, request_id: &str) {
        if self.connection.remove_request(request_id) {
            self.connection
                .send_frame(&ServerFrame::error(message, Some(request_id.to_string())));
        }
    }
}
