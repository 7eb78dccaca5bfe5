//! watchsync - terminal viewer
//!
//! Joins the shared room with a simulated player and prints what it does.
//!
//! Usage:
//!   watchsync-cli [--server URL] [--ready-after SECS]
//!
//! Commands on stdin:
//!   load <id> | play | pause | seek <secs> | status | quit
//!   restore <id> <secs> [playing|paused]   overwrite the room over HTTP

use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use watchsync_core::client::{ClientConfig, SnapshotClient, UserCommand};
use watchsync_core::{PlaybackSnapshot, SimulatedPlayer, SyncClient};

/// Command-line arguments for watchsync-cli
#[derive(Parser, Debug)]
#[command(name = "watchsync-cli")]
#[command(about = "Terminal viewer for a watchsync room")]
#[command(version)]
struct Args {
    /// Sync server root
    #[arg(long, default_value = "http://127.0.0.1:3000", env = "WATCHSYNC_SERVER")]
    server: String,

    /// Seconds before the simulated player reports ready
    #[arg(long, default_value_t = 0.0)]
    ready_after: f64,
}

/// One line of stdin
#[derive(Debug, PartialEq)]
enum Input {
    Client(UserCommand),
    Restore(PlaybackSnapshot),
    Status,
}

fn parse_command(line: &str) -> Result<Option<Input>, String> {
    let mut parts = line.split_whitespace();
    let Some(verb) = parts.next() else {
        return Ok(None);
    };
    let command = match verb {
        "play" => UserCommand::Play,
        "pause" => UserCommand::Pause,
        "seek" => {
            let position = parts
                .next()
                .and_then(|p| p.parse::<f64>().ok())
                .ok_or("usage: seek <seconds>")?;
            UserCommand::Seek(position)
        }
        "load" => {
            let video_id = parts.next().ok_or("usage: load <video id>")?;
            UserCommand::Load(video_id.to_string())
        }
        "restore" => {
            const USAGE: &str = "usage: restore <video id> <seconds> [playing|paused]";
            let video_id = parts.next().ok_or(USAGE)?;
            let position = parts
                .next()
                .and_then(|p| p.parse::<f64>().ok())
                .ok_or(USAGE)?;
            let is_playing = match parts.next() {
                None | Some("playing") => true,
                Some("paused") => false,
                Some(_) => return Err(USAGE.to_string()),
            };
            return Ok(Some(Input::Restore(PlaybackSnapshot {
                video_id: video_id.to_string(),
                position,
                is_playing,
            })));
        }
        "quit" | "exit" => UserCommand::Shutdown,
        "status" => return Ok(Some(Input::Status)),
        other => return Err(format!("unknown command: {}", other)),
    };
    Ok(Some(Input::Client(command)))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("watchsync_core=info".parse()?)
                .add_directive("hyper_util=off".parse()?)
                .add_directive("reqwest=off".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    info!("Joining room at {}", args.server);

    let snapshots = SnapshotClient::new(args.server.clone())?;
    let (player, events) = SimulatedPlayer::new();
    let readiness = player.readiness_signal();
    let client = SyncClient::new(ClientConfig::with_server(args.server), player, events)?;
    let handle = client.start();

    // The simulated player takes a moment to come up, like an embedded one
    let ready_after = Duration::from_secs_f64(args.ready_after.max(0.0));
    tokio::spawn(async move {
        tokio::time::sleep(ready_after).await;
        readiness.set_ready(true);
        info!("Player ready");
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_command(&line) {
            Ok(Some(Input::Client(UserCommand::Shutdown))) => break,
            Ok(Some(Input::Client(command))) => {
                if handle.send(command).is_err() {
                    warn!("Client stopped");
                    break;
                }
            }
            Ok(Some(Input::Restore(snapshot))) => match snapshots.publish(&snapshot).await {
                Ok(applied) => info!(
                    "Room set to {} @ {:.1}s ({})",
                    applied.video_id,
                    applied.position,
                    if applied.is_playing { "playing" } else { "paused" }
                ),
                Err(e) => eprintln!("restore failed: {}", e),
            },
            Ok(Some(Input::Status)) | Ok(None) => {}
            Err(e) => {
                eprintln!("{}", e);
                continue;
            }
        }
        let status = handle.status();
        println!(
            "[{}] {} {} {:.1}s (offset {:+}ms)",
            if status.connected { "online" } else { "offline" },
            status.phase.label(),
            status.video_id.as_deref().unwrap_or("-"),
            status.position,
            status.clock_offset_ms,
        );
    }

    handle.shutdown();
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}
