//! Snapshot writer
//!
//! Saves run on their own task so the ingress actor never waits on storage.
//! Only the newest snapshot matters: intermediate ones are skipped when the
//! store is slower than the event rate.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use watchsync_core::persistence::PersistenceGateway;
use watchsync_core::sync::{MasterPlaybackState, PlaybackSnapshot};

use crate::metrics::{LogLevel, Metrics};

/// Build the startup state from whatever the store holds
pub async fn load_initial_state(
    gateway: Arc<dyn PersistenceGateway>,
    metrics: &Arc<RwLock<Metrics>>,
    now: u64,
) -> MasterPlaybackState {
    let loaded = tokio::task::spawn_blocking(move || gateway.load_snapshot()).await;
    match loaded {
        Ok(Ok(Some(snapshot))) => {
            info!(
                "Restored {} at {:.1}s ({})",
                snapshot.video_id,
                snapshot.position,
                if snapshot.is_playing { "playing" } else { "paused" }
            );
            metrics.write().log(
                LogLevel::Info,
                format!("Restored {} @ {:.1}s", snapshot.video_id, snapshot.position),
            );
            MasterPlaybackState::from_snapshot(&snapshot, now)
        }
        Ok(Ok(None)) => {
            info!("No saved snapshot, starting empty");
            MasterPlaybackState::new()
        }
        Ok(Err(e)) => {
            warn!("Could not load snapshot, continuing in memory: {}", e);
            metrics
                .write()
                .log(LogLevel::Warning, format!("Snapshot load failed: {}", e));
            MasterPlaybackState::new()
        }
        Err(e) => {
            warn!("Snapshot load task failed: {}", e);
            MasterPlaybackState::new()
        }
    }
}

/// Latest-wins handoff to the writer task
#[derive(Clone)]
pub struct SnapshotWriter {
    tx: watch::Sender<Option<PlaybackSnapshot>>,
}

impl SnapshotWriter {
    /// Spawn the writer task
    pub fn spawn(gateway: Arc<dyn PersistenceGateway>, metrics: Arc<RwLock<Metrics>>) -> Self {
        let (tx, rx) = watch::channel(None);
        tokio::spawn(run_writer(gateway, metrics, rx));
        Self { tx }
    }

    /// Queue a save; never blocks
    pub fn save(&self, snapshot: PlaybackSnapshot) {
        self.tx.send_replace(Some(snapshot));
    }
}

async fn run_writer(
    gateway: Arc<dyn PersistenceGateway>,
    metrics: Arc<RwLock<Metrics>>,
    mut rx: watch::Receiver<Option<PlaybackSnapshot>>,
) {
    while rx.changed().await.is_ok() {
        let Some(snapshot) = rx.borrow_and_update().clone() else {
            continue;
        };

        let store = Arc::clone(&gateway);
        let result = tokio::task::spawn_blocking(move || store.save_snapshot(&snapshot)).await;
        match result {
            Ok(Ok(())) => {
                debug!("Snapshot saved");
                metrics.write().save_succeeded();
            }
            Ok(Err(e)) => {
                warn!("Snapshot save failed: {}", e);
                metrics.write().save_failed(&e.to_string());
            }
            Err(e) => {
                warn!("Snapshot save task failed: {}", e);
                metrics.write().save_failed(&e.to_string());
            }
        }
    }
    debug!("Snapshot writer stopped");
}
