//! watchsync - Watch Party Sync Server
//!
//! Holds the room's authoritative playback state and relays every change to
//! the other viewers over WebSocket, with a terminal dashboard.
//!
//! Usage:
//!   cargo run --release
//!   cargo run --release -- --no-dashboard  # Plain logging mode
//!   cargo run --release -- --memory-only   # Don't persist snapshots
//!
//! Environment (overridden by --bind / --snapshot):
//!   WATCHSYNC_BIND      listen address (default 0.0.0.0:3000)
//!   WATCHSYNC_SNAPSHOT  snapshot file (default playback_state.json)

mod broadcaster;
mod config;
mod dashboard;
mod ingress;
mod metrics;
mod network;
mod persistence;
mod registry;

use parking_lot::RwLock;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = config::ServerConfig::parse();

    // Shared metrics state
    let metrics = Arc::new(RwLock::new(metrics::Metrics::new()));

    if config.dashboard {
        dashboard::run(config, metrics).await
    } else {
        network::run_with_logging(config, metrics).await
    }
}
