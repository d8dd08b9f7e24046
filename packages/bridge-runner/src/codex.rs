//! Codex CLI provider.
//!
//! Runs `codex exec --json` per request. Codex has no system-prompt flag, so
//! the system prompt is concatenated in-band ahead of the user prompt. A
//! `thread.started` event carries the thread id; later requests on the same
//! runner resume that thread when they are project-scoped, which is how the
//! assistant keeps its conversation across requests on one connection.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use base64::Engine;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::process::{allowlisted_env, ProcessProvider, ProcessSpawn, SpawnError};
use crate::workdir::session_workdir;
use crate::{RunRequest, RunnerEvents};

const CREDENTIAL_ENV_KEYS: &[&str] = &["OPENAI_API_KEY", "CODEX_API_KEY"];
const SYSTEM_PROMPT_SEPARATOR: &str = "\n\n---\n\n";
const MAX_SANITIZED_ID_CHARS: usize = 64;
const MAX_EXTENSION_CHARS: usize = 10;

#[derive(Debug, Clone)]
pub struct CodexConfig {
    pub binary: PathBuf,
    pub session_dir: String,
}

impl CodexConfig {
    pub fn new(binary: impl Into<PathBuf>, session_dir: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            session_dir: session_dir.into(),
        }
    }
}

pub struct CodexProvider {
    config: CodexConfig,
    thread_id: Mutex<Option<String>>,
}

impl CodexProvider {
    pub fn new(config: CodexConfig) -> Self {
        Self {
            config,
            thread_id: Mutex::new(None),
        }
    }

    pub fn thread_id(&self) -> Option<String> {
        self.thread_id.lock().expect("thread id lock").clone()
    }

    fn build_args(&self, request: &RunRequest, image_paths: &[PathBuf]) -> Vec<String> {
        let resume_thread = if request.project_id.is_some() {
            self.thread_id()
        } else {
            None
        };

        let mut args = vec!["exec".to_string()];
        if let Some(thread) = &resume_thread {
            args.push("resume".to_string());
            args.push(thread.clone());
        }
        args.push("--json".to_string());
        args.push("--full-auto".to_string());
        args.push("--skip-git-repo-check".to_string());
        if resume_thread.is_none() {
            if let Some(model) = &request.model {
                args.push("--model".to_string());
                args.push(model.clone());
            }
        }
        for path in image_paths {
            args.push("-i".to_string());
            args.push(path.display().to_string());
        }
        args.push("-".to_string());
        args
    }

    fn write_image_files(&self, request: &RunRequest) -> Result<Vec<PathBuf>, SpawnError> {
        if request.images.is_empty() {
            return Ok(Vec::new());
        }
        let image_dir = std::env::temp_dir()
            .join(&self.config.session_dir)
            .join("images");
        std::fs::create_dir_all(&image_dir).map_err(|err| {
            SpawnError::setup(format!("Failed to create image directory: {err}"))
        })?;

        let stem = sanitize_request_id(&request.request_id);
        let mut paths = Vec::with_capacity(request.images.len());
        for (index, image) in request.images.iter().enumerate() {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(image.data.as_bytes())
                .map_err(|_| SpawnError::setup(format!("Invalid image data at index {index}")))?;
            let path = image_dir.join(format!(
                "{stem}-{index}.{}",
                extension_for(&image.media_type)
            ));
            if let Err(err) = std::fs::write(&path, bytes) {
                remove_files(&paths);
                return Err(SpawnError::setup(format!(
                    "Failed to write image file: {err}"
                )));
            }
            paths.push(path);
        }
        Ok(paths)
    }
}

fn stdin_payload(request: &RunRequest) -> String {
    match &request.system_prompt {
        Some(system) => format!("{system}{SYSTEM_PROMPT_SEPARATOR}{}", request.prompt),
        None => request.prompt.clone(),
    }
}

fn sanitize_request_id(request_id: &str) -> String {
    let mut sanitized: String = request_id
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    sanitized.truncate(MAX_SANITIZED_ID_CHARS);
    sanitized
}

fn extension_for(media_type: &str) -> String {
    let subtype = media_type.rsplit('/').next().unwrap_or("");
    let mut extension: String = subtype
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect();
    extension.truncate(MAX_EXTENSION_CHARS);
    if extension.is_empty() {
        "png".to_string()
    } else {
        extension
    }
}

fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        let _ = std::fs::remove_file(path);
    }
}

#[async_trait]
impl ProcessProvider for CodexProvider {
    fn name(&self) -> &'static str {
        "codex"
    }

    async fn spawn(&self, request: &RunRequest) -> Result<ProcessSpawn, SpawnError> {
        let image_paths = self.write_image_files(request)?;

        let mut cmd = Command::new(&self.config.binary);
        cmd.args(self.build_args(request, &image_paths));
        cmd.env_clear().envs(allowlisted_env(CREDENTIAL_ENV_KEYS));

        if let Some(project_id) = &request.project_id {
            match session_workdir(&self.config.session_dir, project_id) {
                Ok(workdir) => {
                    cmd.current_dir(workdir);
                }
                Err(err) => {
                    remove_files(&image_paths);
                    return Err(err);
                }
            }
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                remove_files(&image_paths);
                return Err(SpawnError::Spawn {
                    binary: self.config.binary.display().to_string(),
                    source,
                });
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            let payload = stdin_payload(request);
            tokio::spawn(async move {
                let _ = stdin.write_all(payload.as_bytes()).await;
                let _ = stdin.shutdown().await;
            });
        }

        Ok(ProcessSpawn {
            child,
            temp_files: image_paths,
        })
    }

    fn parse_line(&self, line: &str, request_id: &str, events: &dyn RunnerEvents) {
        let value: Value = match serde_json::from_str(line.trim()) {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!(error = %err, "skipping non-JSON codex output line");
                return;
            }
        };

        match value.get("type").and_then(Value::as_str) {
            Some("thread.started") => {
                if let Some(thread) = value.get("thread_id").and_then(Value::as_str) {
                    *self.thread_id.lock().expect("thread id lock") = Some(thread.to_string());
                }
            }
            Some("item.completed") => {
                let item = value.get("item");
                let kind = item
                    .and_then(|item| item.get("type"))
                    .and_then(Value::as_str);
                let text = item
                    .and_then(|item| item.get("text"))
                    .and_then(Value::as_str);
                match (kind, text) {
                    (Some("agent_message"), Some(text)) => {
                        events.on_chunk(text, request_id, false)
                    }
                    (Some("reasoning"), Some(text)) => events.on_chunk(text, request_id, true),
                    _ => {}
                }
            }
            Some("turn.failed") => {
                let message = value
                    .get("error")
                    .and_then(|error| error.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("Codex turn failed");
                events.on_error(message, request_id);
            }
            Some("error") => {
                let message = value
                    .get("message")
                    .and_then(Value::as_str)
                    .or_else(|| {
                        value
                            .get("error")
                            .and_then(|error| error.get("message"))
                            .and_then(Value::as_str)
                    })
                    .unwrap_or("Codex reported an error");
                events.on_error(message, request_id);
            }
            _ => {}
        }
    }
}
