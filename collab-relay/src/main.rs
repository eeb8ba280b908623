//! Collaboration relay server -- broadcast hub for editor instances.
//!
//! Every connected peer receives each message any other peer sends. The
//! session key is handed to peers in the clear, so only run this on trusted
//! networks.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:8888
//! cargo run --bin collab-relay
//!
//! # Run on custom address
//! cargo run --bin collab-relay -- --bind 127.0.0.1:9100
//!
//! # Or via environment variable
//! COLLAB_RELAY_ADDR=127.0.0.1:9100 cargo run --bin collab-relay
//! ```

use clap::Parser;
use collab_relay::config::{RelayCliArgs, RelayConfig};
use collab_relay::server::RelayServer;

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing with the resolved log level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, "starting collaboration relay");
    tracing::warn!("session key is sent unencrypted during the handshake; trusted networks only");

    let server = match RelayServer::start_with_config(&config).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay server");
            std::process::exit(1);
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!(sessions = server.session_count(), "shutting down");
    server.stop().await;
}
