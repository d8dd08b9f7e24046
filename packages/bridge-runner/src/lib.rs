//! Provider runners for the bridge-ws gateway.
//!
//! A runner drives exactly one backend invocation at a time and reports
//! progress through [`RunnerEvents`]. Two runner shapes exist: subprocess
//! runners built on [`process::ProcessRunner`] (Claude, Codex) and the HTTP
//! streaming [`ollama::OllamaRunner`]. They share no base because their
//! resource shapes differ; both honor the same contract: for one execution,
//! zero or more chunks followed by exactly one terminal event.

pub mod claude;
pub mod codex;
pub mod ollama;
pub mod process;
pub mod testing;
pub mod workdir;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use claude::{ClaudeConfig, ClaudeProvider};
pub use codex::{CodexConfig, CodexProvider};
pub use ollama::{OllamaConfig, OllamaRunner};
pub use process::{ProcessProvider, ProcessRunner, ProcessSpawn, SpawnError};

/// Terminal error reported when `run` is called on a disposed runner.
pub const DISPOSED_MESSAGE: &str = "Runner has been disposed";

/// Callbacks a runner invokes while executing a request.
///
/// For a single execution exactly one of `on_complete` / `on_error` fires,
/// after any number of `on_chunk` calls. Nothing fires after a kill.
pub trait RunnerEvents: Send + Sync {
    fn on_chunk(&self, text: &str, request_id: &str, thinking: bool);
    fn on_complete(&self, request_id: &str);
    fn on_error(&self, message: &str, request_id: &str);
}

/// An image carried by a prompt, still base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInput {
    pub media_type: String,
    pub data: String,
}

/// One validated prompt request, ready to execute.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub request_id: String,
    pub prompt: String,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub project_id: Option<String>,
    pub thinking_tokens: Option<u64>,
    pub images: Vec<ImageInput>,
    pub timeout: Duration,
}

impl RunRequest {
    pub fn new(request_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            prompt: prompt.into(),
            model: None,
            system_prompt: None,
            project_id: None,
            thinking_tokens: None,
            images: Vec::new(),
            timeout: Duration::from_secs(300),
        }
    }
}

/// The capability set every provider backend implements.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Starts executing one request and returns once the execution is
    /// launched; events arrive from background tasks. Calling `run` while a
    /// prior execution is still live kills that execution first. On a
    /// disposed runner the only effect is a single
    /// `on_error(DISPOSED_MESSAGE, ..)`.
    async fn run(&self, request: RunRequest, events: Arc<dyn RunnerEvents>);

    /// Cooperatively stops the current execution. Idempotent, safe when
    /// idle. No callback fires after a kill.
    async fn kill(&self);

    /// Kills and marks the runner terminally unusable.
    async fn dispose(&self);
}
