//! Claude CLI provider.
//!
//! Runs `claude --print --output-format stream-json` per request and turns
//! the streaming JSON events back into chunk callbacks. The `result` event
//! that closes the stream duplicates content already delivered as deltas, so
//! the exit code is the terminal signal instead.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::process::{allowlisted_env, ProcessProvider, ProcessSpawn, SpawnError};
use crate::workdir::session_workdir;
use crate::{RunRequest, RunnerEvents};

const CREDENTIAL_ENV_KEYS: &[&str] = &["ANTHROPIC_API_KEY", "CLAUDE_API_KEY"];

#[derive(Debug, Clone)]
pub struct ClaudeConfig {
    pub binary: PathBuf,
    pub session_dir: String,
    /// `--max-turns` when set.
    pub max_turns: Option<u32>,
    /// `--tools` CSV when set; an empty string means "no tools".
    pub tools: Option<String>,
}

impl ClaudeConfig {
    pub fn new(binary: impl Into<PathBuf>, session_dir: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            session_dir: session_dir.into(),
            max_turns: None,
            tools: None,
        }
    }
}

pub struct ClaudeProvider {
    config: ClaudeConfig,
}

impl ClaudeProvider {
    pub fn new(config: ClaudeConfig) -> Self {
        Self { config }
    }

    fn build_args(&self, request: &RunRequest) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--verbose".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
        ];
        if let Some(max_turns) = self.config.max_turns {
            args.push("--max-turns".to_string());
            args.push(max_turns.to_string());
        }
        if let Some(tools) = &self.config.tools {
            args.push("--tools".to_string());
            args.push(tools.clone());
        }
        if !request.images.is_empty() {
            args.push("--input-format".to_string());
            args.push("stream-json".to_string());
        }
        if request.project_id.is_some() {
            args.push("--continue".to_string());
        }
        if let Some(model) = &request.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(system) = &request.system_prompt {
            args.push("--append-system-prompt".to_string());
            args.push(system.clone());
        }
        args.push("-".to_string());
        args
    }
}

fn stdin_payload(request: &RunRequest) -> String {
    if request.images.is_empty() {
        return request.prompt.clone();
    }
    let mut content: Vec<Value> = request
        .images
        .iter()
        .map(|image| {
            json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": image.media_type,
                    "data": image.data,
                },
            })
        })
        .collect();
    content.push(json!({ "type": "text", "text": request.prompt }));

    let mut line = json!({
        "type": "user",
        "message": { "role": "user", "content": content },
    })
    .to_string();
    line.push('\n');
    line
}

#[async_trait]
impl ProcessProvider for ClaudeProvider {
    fn name(&self) -> &'static str {
        "claude"
    }

    async fn spawn(&self, request: &RunRequest) -> Result<ProcessSpawn, SpawnError> {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(self.build_args(request));

        let mut env = allowlisted_env(CREDENTIAL_ENV_KEYS);
        if let Some(budget) = request.thinking_tokens {
            env.insert("MAX_THINKING_TOKENS".to_string(), budget.to_string());
        }
        cmd.env_clear().envs(&env);

        if let Some(project_id) = &request.project_id {
            cmd.current_dir(session_workdir(&self.config.session_dir, project_id)?);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| SpawnError::Spawn {
            binary: self.config.binary.display().to_string(),
            source,
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = stdin_payload(request);
            tokio::spawn(async move {
                let _ = stdin.write_all(payload.as_bytes()).await;
                let _ = stdin.shutdown().await;
            });
        }

        Ok(ProcessSpawn::new(child))
    }

    fn parse_line(&self, line: &str, request_id: &str, events: &dyn RunnerEvents) {
        let value: Value = match serde_json::from_str(line.trim()) {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!(error = %err, "skipping non-JSON claude output line");
                return;
            }
        };
        emit_event(&value, request_id, events);
    }
}

fn emit_event(value: &Value, request_id: &str, events: &dyn RunnerEvents) {
    match value.get("type").and_then(Value::as_str) {
        Some("content_block_delta") => {
            if let Some(delta) = value.get("delta") {
                emit_delta(delta, request_id, events);
            }
        }
        // Wrapped form: the same delta nested under `event`.
        Some("stream_event") => {
            if let Some(inner) = value.get("event") {
                emit_event(inner, request_id, events);
            }
        }
        Some("assistant") => {
            let blocks = value
                .get("message")
                .and_then(|message| message.get("content"))
                .and_then(Value::as_array);
            for block in blocks.into_iter().flatten() {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    events.on_chunk(text, request_id, false);
                } else if let Some(thinking) = block.get("thinking").and_then(Value::as_str) {
                    events.on_chunk(thinking, request_id, true);
                }
            }
        }
        _ => {}
    }
}

fn emit_delta(delta: &Value, request_id: &str, events: &dyn RunnerEvents) {
    match delta.get("type").and_then(Value::as_str) {
        Some("text_delta") => {
            if let Some(text) = delta.get("text").and_then(Value::as_str) {
                events.on_chunk(text, request_id, false);
            }
        }
        Some("thinking_delta") => {
            if let Some(thinking) = delta.get("thinking").and_then(Value::as_str) {
                events.on_chunk(thinking, request_id, true);
            }
        }
        _ => {}
    }
}
