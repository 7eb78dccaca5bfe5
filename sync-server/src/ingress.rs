//! Event ingress
//!
//! Actor owning the room's [`MasterPlaybackState`]. Every mutation and every
//! late-joiner snapshot is serialized through its command queue, so no two
//! events interleave their read-modify-write.

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use watchsync_core::sync::{
    current_time_ms, AppliedEvent, EventKind, MasterPlaybackState, PlaybackEvent,
    PlaybackSnapshot, Rejection,
};

use crate::broadcaster::{BroadcastHandle, Delivery};
use crate::metrics::Metrics;
use crate::persistence::SnapshotWriter;
use crate::registry::{ConnectionId, SessionHandle};

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("Ingress task closed")]
    Closed,

    #[error(transparent)]
    Rejected(#[from] Rejection),
}

/// Commands sent to the ingress actor
#[derive(Debug)]
pub enum IngressCommand {
    /// Validate and apply a viewer event
    Apply {
        origin: Option<ConnectionId>,
        event: PlaybackEvent,
        reply: Option<oneshot::Sender<Result<AppliedEvent, Rejection>>>,
    },
    /// Overwrite the room from an HTTP snapshot
    Restore {
        snapshot: PlaybackSnapshot,
        reply: oneshot::Sender<Result<PlaybackSnapshot, Rejection>>,
    },
    /// A new session connected
    Join { session: SessionHandle },
    /// A session asked for a fresh Init
    RequestInit { id: ConnectionId },
    /// Read the current snapshot
    Snapshot {
        reply: oneshot::Sender<Option<PlaybackSnapshot>>,
    },
    Shutdown,
}

/// Handle to communicate with the running ingress actor
#[derive(Clone)]
pub struct IngressHandle {
    command_tx: mpsc::UnboundedSender<IngressCommand>,
}

impl IngressHandle {
    fn send(&self, command: IngressCommand) -> Result<(), IngressError> {
        self.command_tx
            .send(command)
            .map_err(|_| IngressError::Closed)
    }

    /// Fire-and-forget apply; the outcome shows up in logs and metrics
    pub fn submit(&self, origin: ConnectionId, event: PlaybackEvent) -> Result<(), IngressError> {
        self.send(IngressCommand::Apply {
            origin: Some(origin),
            event,
            reply: None,
        })
    }

    /// Apply and wait for the outcome
    pub async fn apply(
        &self,
        origin: Option<ConnectionId>,
        event: PlaybackEvent,
    ) -> Result<AppliedEvent, IngressError> {
        let (reply, rx) = oneshot::channel();
        self.send(IngressCommand::Apply {
            origin,
            event,
            reply: Some(reply),
        })?;
        Ok(rx.await.map_err(|_| IngressError::Closed)??)
    }

    pub async fn restore(
        &self,
        snapshot: PlaybackSnapshot,
    ) -> Result<PlaybackSnapshot, IngressError> {
        let (reply, rx) = oneshot::channel();
        self.send(IngressCommand::Restore { snapshot, reply })?;
        Ok(rx.await.map_err(|_| IngressError::Closed)??)
    }

    pub fn join(&self, session: SessionHandle) -> Result<(), IngressError> {
        self.send(IngressCommand::Join { session })
    }

    pub fn request_init(&self, id: ConnectionId) -> Result<(), IngressError> {
        self.send(IngressCommand::RequestInit { id })
    }

    pub async fn snapshot(&self) -> Result<Option<PlaybackSnapshot>, IngressError> {
        let (reply, rx) = oneshot::channel();
        self.send(IngressCommand::Snapshot { reply })?;
        rx.await.map_err(|_| IngressError::Closed)
    }

    pub fn shutdown(&self) {
        let _ = self.command_tx.send(IngressCommand::Shutdown);
    }
}

/// Single writer of the room state
pub struct EventIngress {
    state: MasterPlaybackState,
    broadcaster: BroadcastHandle,
    writer: SnapshotWriter,
    metrics: Arc<RwLock<Metrics>>,
}

impl EventIngress {
    pub fn new(
        state: MasterPlaybackState,
        broadcaster: BroadcastHandle,
        writer: SnapshotWriter,
        metrics: Arc<RwLock<Metrics>>,
    ) -> Self {
        Self {
            state,
            broadcaster,
            writer,
            metrics,
        }
    }

    /// Spawn the actor and return a handle for communication
    pub fn start(self) -> IngressHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(self.run(command_rx));
        IngressHandle { command_tx }
    }

    async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<IngressCommand>) {
        while let Some(command) = command_rx.recv().await {
            match command {
                IngressCommand::Apply {
                    origin,
                    event,
                    reply,
                } => {
                    let result = self.apply(origin, event, current_time_ms());
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
                IngressCommand::Restore { snapshot, reply } => {
                    let _ = reply.send(self.restore(snapshot, current_time_ms()));
                }
                IngressCommand::Join { session } => {
                    let init = self.state.init_message(current_time_ms());
                    debug!("Session #{} joining with {:?}", session.id, init);
                    self.broadcaster.deliver(Delivery::Join { session, init });
                }
                IngressCommand::RequestInit { id } => {
                    let message = self.state.init_message(current_time_ms());
                    self.broadcaster.deliver(Delivery::Direct { to: id, message });
                }
                IngressCommand::Snapshot { reply } => {
                    let _ = reply.send(self.state.snapshot(current_time_ms()));
                }
                IngressCommand::Shutdown => {
                    info!("Ingress shutting down");
                    break;
                }
            }
        }
    }

    fn apply(
        &mut self,
        origin: Option<ConnectionId>,
        event: PlaybackEvent,
        now: u64,
    ) -> Result<AppliedEvent, Rejection> {
        let kind = event.kind();
        match self.state.apply_event(event, now) {
            Ok(applied) => {
                info!(
                    "Applied {} from {:?}: {} @ {:.2}s",
                    kind.as_str(),
                    origin,
                    applied.video_id,
                    applied.reference_position
                );
                self.publish(origin, &applied, now);
                Ok(applied)
            }
            Err(rejection) => {
                warn!("Rejected {} from {:?}: {}", kind.as_str(), origin, rejection);
                self.metrics
                    .write()
                    .event_rejected(origin, &rejection.to_string());
                Err(rejection)
            }
        }
    }

    /// Overwrite the room; a paused snapshot pauses at exactly its position
    fn restore(
        &mut self,
        snapshot: PlaybackSnapshot,
        now: u64,
    ) -> Result<PlaybackSnapshot, Rejection> {
        if snapshot.video_id.is_empty() {
            self.metrics.write().event_rejected(None, "empty videoId");
            return Err(Rejection::NoVideo("restore"));
        }
        if !snapshot.position.is_finite() || snapshot.position < 0.0 {
            self.metrics
                .write()
                .event_rejected(None, &format!("invalid position {}", snapshot.position));
            return Err(Rejection::InvalidPosition(snapshot.position));
        }

        self.state
            .apply_play(snapshot.video_id.clone(), snapshot.position, now);
        let kind = if snapshot.is_playing {
            EventKind::Play
        } else {
            self.state.apply_pause(now);
            EventKind::Pause
        };
        info!(
            "Restored over HTTP: {} @ {:.2}s ({})",
            snapshot.video_id,
            snapshot.position,
            kind.as_str()
        );

        let applied = AppliedEvent {
            kind,
            video_id: snapshot.video_id,
            reference_position: self.state.reference_position(),
            reference_timestamp: self.state.reference_timestamp(),
            is_playing: self.state.is_playing(),
        };
        self.publish(None, &applied, now);

        self.state
            .snapshot(now)
            .ok_or(Rejection::NoVideo("restore"))
    }

    /// Fan out, persist and count an applied mutation
    fn publish(&self, origin: Option<ConnectionId>, applied: &AppliedEvent, now: u64) {
        self.broadcaster.deliver(Delivery::Broadcast {
            origin,
            message: applied.to_message(),
        });

        if let Some(snapshot) = self.state.snapshot(now) {
            self.writer.save(snapshot.clone());
            self.metrics
                .write()
                .event_applied(origin, applied.kind, snapshot);
        }
    }
}
