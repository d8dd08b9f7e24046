//! Gateway configuration. Everything flows in explicitly at construction;
//! there is no process-wide mutable state beyond the logger.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8765;
pub const DEFAULT_AGENT_NAME: &str = "bridge-ws";
pub const DEFAULT_SESSION_DIR: &str = "bridge-ws-sessions";
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_MAX_FRAME_MB: usize = 50;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

const MIN_REQUEST_TIMEOUT_SECS: u64 = 1;
const MAX_REQUEST_TIMEOUT_SECS: u64 = 3600;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub max_frame_bytes: usize,
    pub heartbeat_interval: Duration,
    pub request_timeout: Duration,
    /// When set, upgrades require `Authorization: Bearer <key>`.
    pub api_key: Option<String>,
    /// When non-empty, a present `Origin` header must match one entry.
    pub allowed_origins: Vec<String>,
    pub agent_name: String,
    pub claude_binary: PathBuf,
    pub codex_binary: PathBuf,
    pub ollama_url: String,
    pub session_dir: String,
    pub max_turns: Option<u32>,
    pub tools: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_frame_bytes: DEFAULT_MAX_FRAME_MB * 1024 * 1024,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            api_key: None,
            allowed_origins: Vec::new(),
            agent_name: DEFAULT_AGENT_NAME.to_string(),
            claude_binary: PathBuf::from("claude"),
            codex_binary: PathBuf::from("codex"),
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            session_dir: DEFAULT_SESSION_DIR.to_string(),
            max_turns: None,
            tools: None,
        }
    }
}

/// Clamps a configured per-request timeout into the supported range.
pub fn clamp_request_timeout(secs: u64) -> Duration {
    Duration::from_secs(secs.clamp(MIN_REQUEST_TIMEOUT_SECS, MAX_REQUEST_TIMEOUT_SECS))
}
