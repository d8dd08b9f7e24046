fn main() {
    if let Err(err) = bridge_ws::cli::run_bridge_ws() {
        tracing::error!(error = %err, "bridge-ws failed");
        std::process::exit(1);
    }
}
