//! Event broadcaster
//!
//! Single task draining a FIFO queue fed by the ingress actor. Fan-out
//! happens here, outside the ingress critical section, in exactly the order
//! mutations were applied. Late-joiner Inits travel through the same queue so
//! a joiner never sees a broadcast older than its Init.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info};

use watchsync_core::sync::ServerMessage;

use crate::metrics::Metrics;
use crate::registry::{ConnectionId, ConnectionRegistry, SessionHandle};

#[derive(Debug)]
pub enum Delivery {
    /// Everyone except `origin` (`None` reaches all sessions)
    Broadcast {
        origin: Option<ConnectionId>,
        message: ServerMessage,
    },
    /// Register a new session and hand it its Init
    Join {
        session: SessionHandle,
        init: ServerMessage,
    },
    /// One session only
    Direct {
        to: ConnectionId,
        message: ServerMessage,
    },
}

/// Handle to queue deliveries
#[derive(Clone)]
pub struct BroadcastHandle {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl BroadcastHandle {
    pub fn deliver(&self, delivery: Delivery) {
        if self.tx.send(delivery).is_err() {
            debug!("Broadcaster stopped, delivery dropped");
        }
    }
}

pub struct EventBroadcaster {
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<RwLock<Metrics>>,
}

impl EventBroadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>, metrics: Arc<RwLock<Metrics>>) -> Self {
        Self { registry, metrics }
    }

    /// Spawn the fan-out task and return a handle for feeding it
    pub fn start(self) -> BroadcastHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.run(rx));
        BroadcastHandle { tx }
    }

    async fn run(self, mut rx: mpsc::UnboundedReceiver<Delivery>) {
        while let Some(delivery) = rx.recv().await {
            self.handle(delivery);
        }
        info!("Broadcaster stopped");
    }

    fn handle(&self, delivery: Delivery) {
        match delivery {
            Delivery::Broadcast { origin, message } => {
                let delivered = self.registry.broadcast_except(origin, &message);
                debug!(
                    "Broadcast {:?} to {} session(s) (origin {:?})",
                    message, delivered, origin
                );
                self.metrics.write().broadcast_delivered(delivered);
            }
            Delivery::Join { session, init } => {
                let id = session.id;
                if session.outbound.send(init).is_err() {
                    debug!("Session #{} left before its init", id);
                    return;
                }
                self.registry.insert(session);
                debug!("Session #{} joined ({} live)", id, self.registry.len());
            }
            Delivery::Direct { to, message } => {
                if !self.registry.send_to(to, message) {
                    debug!("Session #{} gone, direct message dropped", to);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn seek(position: f64) -> ServerMessage {
        ServerMessage::SeekApplied {
            video_id: "vid".to_string(),
            position,
            reference_timestamp: None,
        }
    }

    fn init() -> ServerMessage {
        ServerMessage::Init {
            video_id: Some("vid".to_string()),
            is_playing: false,
            position: 1.0,
            reference_timestamp: 0,
        }
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_join_then_broadcasts_in_order() {
        let registry = Arc::new(ConnectionRegistry::new());
        let metrics = Arc::new(RwLock::new(Metrics::new()));
        let handle = EventBroadcaster::new(Arc::clone(&registry), Arc::clone(&metrics)).start();

        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();

        handle.deliver(Delivery::Join {
            session: SessionHandle::new(1, a_tx),
            init: init(),
        });
        // Broadcast queued before B joins never reaches B
        handle.deliver(Delivery::Broadcast {
            origin: None,
            message: seek(10.0),
        });
        handle.deliver(Delivery::Join {
            session: SessionHandle::new(2, b_tx),
            init: init(),
        });
        handle.deliver(Delivery::Broadcast {
            origin: Some(1),
            message: seek(20.0),
        });
        handle.deliver(Delivery::Broadcast {
            origin: Some(2),
            message: seek(30.0),
        });

        assert_eq!(recv(&mut a_rx).await, init());
        assert_eq!(recv(&mut a_rx).await, seek(10.0));
        assert_eq!(recv(&mut a_rx).await, seek(30.0));

        assert_eq!(recv(&mut b_rx).await, init());
        assert_eq!(recv(&mut b_rx).await, seek(20.0));

        assert!(a_rx.try_recv().is_err());
        assert!(b_rx.try_recv().is_err());

        // Counters are bumped right after the last send
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(metrics.read().messages_broadcast, 3);
    }

    #[tokio::test]
    async fn test_join_after_disconnect_is_skipped() {
        let registry = Arc::new(ConnectionRegistry::new());
        let metrics = Arc::new(RwLock::new(Metrics::new()));
        let broadcaster = EventBroadcaster::new(Arc::clone(&registry), metrics);

        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        broadcaster.handle(Delivery::Join {
            session: SessionHandle::new(5, tx),
            init: init(),
        });
        assert_eq!(registry.len(), 0);
    }
}
