//! bridge-ws gateway: multiplexes WebSocket clients onto local AI
//! assistant CLIs and an Ollama server.

pub mod cli;
pub mod config;
pub mod connection;
pub mod server;
