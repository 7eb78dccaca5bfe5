//! Server configuration
//!
//! Flags, falling back to environment variables, falling back to defaults.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// Default snapshot file name
const SNAPSHOT_FILE: &str = "playback_state.json";

/// Command-line arguments for watchsync-server
#[derive(Parser, Debug)]
#[command(name = "watchsync-server")]
#[command(about = "Keeps a watch party's playback in step")]
#[command(version)]
pub struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:3000", env = "WATCHSYNC_BIND")]
    pub bind: SocketAddr,

    /// File the room snapshot is persisted to
    #[arg(long, default_value = SNAPSHOT_FILE, env = "WATCHSYNC_SNAPSHOT")]
    pub snapshot: PathBuf,

    /// Don't persist snapshots; state is lost on restart
    #[arg(long)]
    pub memory_only: bool,

    /// Plain logging instead of the terminal dashboard
    #[arg(long)]
    pub no_dashboard: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// `None` keeps state in memory only
    pub snapshot_path: Option<PathBuf>,
    /// Terminal dashboard instead of plain logging
    pub dashboard: bool,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            bind_addr: args.bind,
            snapshot_path: (!args.memory_only).then_some(args.snapshot),
            dashboard: !args.no_dashboard,
        }
    }
}

impl ServerConfig {
    /// Read the process arguments and environment
    pub fn parse() -> Self {
        Args::parse().into()
    }
}
