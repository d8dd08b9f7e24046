//! CLI entry glue: flag parsing, logging setup and the server runtime.

use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{
    clamp_request_timeout, GatewayConfig, DEFAULT_AGENT_NAME, DEFAULT_HOST, DEFAULT_MAX_FRAME_MB,
    DEFAULT_OLLAMA_URL, DEFAULT_PORT, DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_SESSION_DIR,
};
use crate::server::{self, GatewayState};

#[derive(Parser, Debug)]
#[command(name = "bridge-ws", bin_name = "bridge-ws")]
#[command(about = "WebSocket gateway bridging clients to local AI assistants", version)]
pub struct BridgeWsCli {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Require `Authorization: Bearer <key>` on every connection.
    #[arg(long, env = "BRIDGE_WS_API_KEY")]
    api_key: Option<String>,

    /// Allowed browser origins; repeatable. Absent header always passes.
    #[arg(long = "allowed-origin", short = 'O')]
    allowed_origins: Vec<String>,

    #[arg(long, default_value = "claude")]
    claude_bin: PathBuf,

    #[arg(long, default_value = "codex")]
    codex_bin: PathBuf,

    #[arg(long, env = "BRIDGE_WS_OLLAMA_URL", default_value = DEFAULT_OLLAMA_URL)]
    ollama_url: String,

    /// Per-request subprocess timeout in seconds (clamped to 1-3600).
    #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
    timeout_secs: u64,

    /// Maximum inbound frame size in MiB.
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_MB)]
    max_frame_mb: usize,

    /// Agent name reported in the `connected` frame.
    #[arg(long, default_value = DEFAULT_AGENT_NAME)]
    agent_name: String,

    /// `--max-turns` passed to the Claude CLI.
    #[arg(long)]
    max_turns: Option<u32>,

    /// `--tools` CSV passed to the Claude CLI; empty string disables tools.
    #[arg(long)]
    tools: Option<String>,

    /// Session subdirectory under the system temp dir.
    #[arg(long, default_value = DEFAULT_SESSION_DIR)]
    session_dir: String,
}

impl BridgeWsCli {
    fn into_config(self) -> GatewayConfig {
        GatewayConfig {
            host: self.host,
            port: self.port,
            max_frame_bytes: self.max_frame_mb * 1024 * 1024,
            request_timeout: clamp_request_timeout(self.timeout_secs),
            api_key: self.api_key,
            allowed_origins: self.allowed_origins,
            agent_name: self.agent_name,
            claude_binary: self.claude_bin,
            codex_binary: self.codex_bin,
            ollama_url: self.ollama_url,
            session_dir: self.session_dir,
            max_turns: self.max_turns,
            tools: self.tools,
            ..GatewayConfig::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_bridge_ws() -> Result<(), CliError> {
    let cli = BridgeWsCli::parse();
    init_logging();
    run_server(cli.into_config())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

fn run_server(config: GatewayConfig) -> Result<(), CliError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let state = GatewayState::new(config);
        let addr = format!("{}:{}", state.config.host, state.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, agent = %state.config.agent_name, "gateway listening");
        server::serve(state, listener).await?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_config_defaults() {
        let cli = BridgeWsCli::parse_from(["bridge-ws"]);
        let config = cli.into_config();
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.agent_name, DEFAULT_AGENT_NAME);
        assert_eq!(config.max_frame_bytes, DEFAULT_MAX_FRAME_MB * 1024 * 1024);
        assert_eq!(config.api_key, None);
        assert!(config.allowed_origins.is_empty());
    }

    #[test]
    fn flags_flow_into_config() {
        let cli = BridgeWsCli::parse_from([
            "bridge-ws",
            "--port",
            "9000",
            "--api-key",
            "secret-key",
            "--allowed-origin",
            "https://app.example.com",
            "--allowed-origin",
            "https://other.example.com",
            "--timeout-secs",
            "999999",
            "--tools",
            "",
        ]);
        let config = cli.into_config();
        assert_eq!(config.port, 9000);
        assert_eq!(config.api_key.as_deref(), Some("secret-key"));
        assert_eq!(config.allowed_origins.len(), 2);
        assert_eq!(config.request_timeout, std::time::Duration::from_secs(3600));
        assert_eq!(config.tools.as_deref(), Some(""));
    }
}
