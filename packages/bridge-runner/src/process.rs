//! Shared subprocess machinery for CLI-backed providers.
//!
//! Concrete providers supply argv/stdin construction and a stdout line
//! parser; the base owns spawning, the wall-clock timeout, stderr
//! forwarding, exit reconciliation and the once-only terminal-event guard.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

use crate::{RunRequest, Runner, RunnerEvents, DISPOSED_MESSAGE};

/// Environment variables propagated to every spawned CLI. Providers extend
/// this with their credential keys; the ambient environment is never passed
/// through wholesale.
pub const BASE_ENV_ALLOWLIST: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "SHELL",
    "TERM",
    "LANG",
    "LC_ALL",
    "NODE_PATH",
    "XDG_CONFIG_HOME",
];

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn allowlisted_env(extra_keys: &[&str]) -> HashMap<String, String> {
    BASE_ENV_ALLOWLIST
        .iter()
        .chain(extra_keys.iter())
        .filter_map(|key| std::env::var(key).ok().map(|value| (key.to_string(), value)))
        .collect()
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Failed to start {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{message}")]
    Setup { message: String },
}

impl SpawnError {
    pub fn setup(message: impl Into<String>) -> Self {
        SpawnError::Setup {
            message: message.into(),
        }
    }
}

/// A spawned child plus the scratch files that must be deleted when it
/// exits, success or not.
pub struct ProcessSpawn {
    pub child: Child,
    pub temp_files: Vec<PathBuf>,
}

impl ProcessSpawn {
    pub fn new(child: Child) -> Self {
        Self {
            child,
            temp_files: Vec::new(),
        }
    }
}

/// What a concrete CLI provider contributes to the shared base.
#[async_trait]
pub trait ProcessProvider: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Builds argv, cwd and environment, spawns the child and queues its
    /// stdin payload. Failure is reported to the caller as a terminal
    /// error frame.
    async fn spawn(&self, request: &RunRequest) -> Result<ProcessSpawn, SpawnError>;

    /// Interprets one non-blank stdout line, emitting chunks or a
    /// provider-reported terminal error.
    fn parse_line(&self, line: &str, request_id: &str, events: &dyn RunnerEvents);
}

/// Tracks one execution: whether it was killed (cancel/timeout/replacement)
/// and whether its terminal event already fired.
#[derive(Default)]
struct ExecutionGuard {
    killed: AtomicBool,
    done: AtomicBool,
}

impl ExecutionGuard {
    fn mark_killed(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Claims the terminal event. Returns true exactly once, and never
    /// after a kill.
    fn finish(&self) -> bool {
        !self.is_killed() && !self.done.swap(true, Ordering::SeqCst)
    }
}

/// Wraps the caller's events so chunks stop after a kill and the terminal
/// event fires at most once no matter which path produces it.
struct GuardedEvents {
    inner: Arc<dyn RunnerEvents>,
    guard: Arc<ExecutionGuard>,
}

impl RunnerEvents for GuardedEvents {
    fn on_chunk(&self, text: &str, request_id: &str, thinking: bool) {
        if !self.guard.is_killed() && !self.guard.is_done() {
            self.inner.on_chunk(text, request_id, thinking);
        }
    }

    fn on_complete(&self, request_id: &str) {
        if self.guard.finish() {
            self.inner.on_complete(request_id);
        }
    }

    fn on_error(&self, message: &str, request_id: &str) {
        if self.guard.finish() {
            self.inner.on_error(message, request_id);
        }
    }
}

struct Execution {
    guard: Arc<ExecutionGuard>,
    child: Arc<Mutex<Child>>,
    timeout: AbortHandle,
}

impl Execution {
    async fn terminate(&self) {
        self.guard.mark_killed();
        self.timeout.abort();
        let mut child = self.child.lock().await;
        // Already-dead children are fine; the monitor task reconciles.
        let _ = child.start_kill();
    }
}

/// Subprocess-backed [`Runner`]. Holds at most one live execution; a new
/// `run` kills the prior one first, orphaning its request by design (the
/// replaced execution's terminal event is suppressed).
pub struct ProcessRunner<P: ProcessProvider> {
    provider: Arc<P>,
    execution: Mutex<Option<Execution>>,
    disposed: AtomicBool,
}

impl<P: ProcessProvider> ProcessRunner<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider: Arc::new(provider),
            execution: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }
}

#[async_trait]
impl<P: ProcessProvider> Runner for ProcessRunner<P> {
    async fn run(&self, request: RunRequest, events: Arc<dyn RunnerEvents>) {
        let request_id = request.request_id.clone();
        if self.disposed.load(Ordering::SeqCst) {
            events.on_error(DISPOSED_MESSAGE, &request_id);
            return;
        }

        let mut slot = self.execution.lock().await;
        if let Some(previous) = slot.take() {
            tracing::warn!(
                provider = self.provider.name(),
                request_id = %request_id,
                "killing prior execution before starting a new one"
            );
            previous.terminate().await;
        }

        let spawned = match self.provider.spawn(&request).await {
            Ok(spawned) => spawned,
            Err(err) => {
                events.on_error(&err.to_string(), &request_id);
                return;
            }
        };
        let ProcessSpawn {
            mut child,
            temp_files,
        } = spawned;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let guard = Arc::new(ExecutionGuard::default());
        let child = Arc::new(Mutex::new(child));
        let guarded: Arc<dyn RunnerEvents> = Arc::new(GuardedEvents {
            inner: events,
            guard: guard.clone(),
        });

        let timeout_task = {
            let guard = guard.clone();
            let child = child.clone();
            let guarded = guarded.clone();
            let request_id = request_id.clone();
            let timeout = request.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                // Claim the terminal event before the kill so the error is
                // not suppressed by our own killed flag.
                guarded.on_error("Process timed out", &request_id);
                guard.mark_killed();
                let mut child = child.lock().await;
                let _ = child.start_kill();
            })
        };

        let stdout_task = {
            let provider = self.provider.clone();
            let guarded = guarded.clone();
            let request_id = request_id.clone();
            tokio::spawn(async move {
                let Some(stdout) = stdout else { return };
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    provider.parse_line(&line, &request_id, guarded.as_ref());
                }
            })
        };

        if let Some(stderr) = stderr {
            let name = self.provider.name();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.is_empty() {
                        tracing::warn!(provider = name, line = %line, "provider stderr");
                    }
                }
            });
        }

        *slot = Some(Execution {
            guard: guard.clone(),
            child: child.clone(),
            timeout: timeout_task.abort_handle(),
        });
        drop(slot);

        // Exit monitor: drain stdout fully first so a provider-reported
        // terminal error always wins over the exit-status fallback.
        let name = self.provider.name();
        let timeout_abort = timeout_task.abort_handle();
        let monitor_request_id = request_id;
        tokio::spawn(async move {
            let _ = stdout_task.await;
            let status = loop {
                {
                    let mut child = child.lock().await;
                    match child.try_wait() {
                        Ok(Some(status)) => break Some(status),
                        Ok(None) => {}
                        Err(_) => break None,
                    }
                }
                tokio::time::sleep(EXIT_POLL_INTERVAL).await;
            };
            timeout_abort.abort();

            for path in &temp_files {
                if let Err(err) = tokio::fs::remove_file(path).await {
                    tracing::warn!(provider = name, path = %path.display(), error = %err, "failed to remove temp file");
                }
            }

            if guard.is_killed() {
                return;
            }
            match status {
                Some(status) => match status.code() {
                    Some(0) => guarded.on_complete(&monitor_request_id),
                    Some(code) => {
                        guarded.on_error(&format!("CLI exited with code {code}"), &monitor_request_id)
                    }
                    None => {
                        guarded.on_error(&signal_exit_message(&status), &monitor_request_id)
                    }
                },
                None => guarded.on_error("CLI exited abnormally", &monitor_request_id),
            }
        });
    }

    async fn kill(&self) {
        let execution = self.execution.lock().await.take();
        if let Some(execution) = execution {
            execution.terminate().await;
        }
    }

    async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.kill().await;
    }
}

#[cfg(unix)]
fn signal_exit_message(status: &std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(signal) => format!("CLI killed by signal {signal}"),
        None => "CLI exited abnormally".to_string(),
    }
}

#[cfg(not(unix))]
fn signal_exit_message(_status: &std::process::ExitStatus) -> String {
    "CLI exited abnormally".to_string()
}
