//! Ollama HTTP streaming runner.
//!
//! No subprocess: one abortable POST to `/api/generate` per execution, with
//! the newline-delimited JSON response body interpreted incrementally. A
//! trailing partial line is buffered across reads; non-JSON lines are
//! skipped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

use crate::{RunRequest, Runner, RunnerEvents, DISPOSED_MESSAGE};

pub const DEFAULT_MODEL: &str = "llama3.2";
const ERROR_BODY_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
}

impl OllamaConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url }
    }
}

/// Tracks one in-flight call: whether it was aborted (cancel, timeout or
/// replacement) and whether the terminal event already fired.
#[derive(Default)]
struct CallGuard {
    aborted: AtomicBool,
    done: AtomicBool,
}

impl CallGuard {
    fn mark_aborted(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn finish(&self) -> bool {
        !self.is_aborted() && !self.done.swap(true, Ordering::SeqCst)
    }
}

struct Call {
    guard: Arc<CallGuard>,
    task: AbortHandle,
}

impl Call {
    fn abort(&self) {
        self.guard.mark_aborted();
        self.task.abort();
    }
}

pub struct OllamaRunner {
    config: OllamaConfig,
    client: reqwest::Client,
    call: Mutex<Option<Call>>,
    disposed: AtomicBool,
}

impl OllamaRunner {
    pub fn new(config: OllamaConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            call: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Runner for OllamaRunner {
    async fn run(&self, request: RunRequest, events: Arc<dyn RunnerEvents>) {
        if self.disposed.load(Ordering::SeqCst) {
            events.on_error(DISPOSED_MESSAGE, &request.request_id);
            return;
        }

        let mut slot = self.call.lock().await;
        if let Some(previous) = slot.take() {
            tracing::warn!(
                request_id = %request.request_id,
                "aborting prior ollama call before starting a new one"
            );
            previous.abort();
        }

        let guard = Arc::new(CallGuard::default());
        let timeout = request.timeout;
        let request_id = request.request_id.clone();

        // Dropping the stream future aborts the in-flight HTTP call, so the
        // timeout doubles as the abort mechanism.
        let task = {
            let guard = guard.clone();
            let stream = stream_generate(
                self.client.clone(),
                self.config.clone(),
                request,
                events.clone(),
                guard.clone(),
            );
            tokio::spawn(async move {
                if tokio::time::timeout(timeout, stream).await.is_err() {
                    if guard.finish() {
                        events.on_error("Request timed out", &request_id);
                    }
                    guard.mark_aborted();
                }
            })
        };

        *slot = Some(Call {
            guard,
            task: task.abort_handle(),
        });
    }

    async fn kill(&self) {
        let call = self.call.lock().await.take();
        if let Some(call) = call {
            call.abort();
        }
    }

    async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.kill().await;
    }
}

async fn stream_generate(
    client: reqwest::Client,
    config: OllamaConfig,
    request: RunRequest,
    events: Arc<dyn RunnerEvents>,
    guard: Arc<CallGuard>,
) {
    let request_id = request.request_id.as_str();
    let model = request.model.as_deref().unwrap_or(DEFAULT_MODEL);
    let mut body = json!({
        "model": model,
        "prompt": request.prompt,
        "stream": true,
    });
    if let Some(system) = &request.system_prompt {
        body["system"] = Value::String(system.clone());
    }

    let url = format!("{}/api/generate", config.base_url);
    let response = match client.post(&url).json(&body).send().await {
        Ok(response) => response,
        Err(err) => {
            if guard.finish() {
                let message = if is_connection_refused(&err) {
                    format!("Ollama server not reachable at {}", config.base_url)
                } else {
                    format!("Ollama request failed: {err}")
                };
                events.on_error(&message, request_id);
            }
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let preview: String = body.chars().take(ERROR_BODY_PREVIEW_CHARS).collect();
        if guard.finish() {
            events.on_error(&format!("HTTP {}: {preview}", status.as_u16()), request_id);
        }
        return;
    }

    let mut buffer = String::new();
    let mut stream = response;
    loop {
        let chunk = match stream.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(err) => {
                if guard.finish() {
                    events.on_error(&format!("Ollama stream error: {err}"), request_id);
                }
                return;
            }
        };
        buffer.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(newline) = buffer.find('\n') {
            let line: String = buffer.drain(..=newline).collect();
            if handle_line(line.trim(), request_id, events.as_ref(), &guard) {
                return;
            }
        }
    }

    // A well-behaved stream ends with done:true; treat a bare EOF as
    // completion too.
    if !buffer.trim().is_empty() && handle_line(buffer.trim(), request_id, events.as_ref(), &guard)
    {
        return;
    }
    if guard.finish() {
        events.on_complete(request_id);
    }
}

/// Interprets one complete NDJSON line. Returns true when the stream is
/// finished.
fn handle_line(
    line: &str,
    request_id: &str,
    events: &dyn RunnerEvents,
    guard: &CallGuard,
) -> bool {
    if line.is_empty() {
        return false;
    }
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(_) => return false,
    };

    if let Some(message) = value.get("error").and_then(Value::as_str) {
        if guard.finish() {
            events.on_error(message, request_id);
        }
        return true;
    }
    if value.get("done").and_then(Value::as_bool) == Some(true) {
        if guard.finish() {
            events.on_complete(request_id);
        }
        return true;
    }
    if let Some(text) = value.get("response").and_then(Value::as_str) {
        if !text.is_empty() && !guard.is_aborted() && !guard.is_done() {
            events.on_chunk(text, request_id, false);
        }
    }
    false
}

fn is_connection_refused(err: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        source = cause.source();
    }
    false
}
