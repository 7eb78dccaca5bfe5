//! Connection registry
//!
//! Live sessions and their outbound queues. Holds no playback state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use watchsync_core::sync::ServerMessage;

pub type ConnectionId = u64;

/// One connected viewer
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: ConnectionId,
    pub outbound: mpsc::UnboundedSender<ServerMessage>,
}

impl SessionHandle {
    pub fn new(id: ConnectionId, outbound: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self { id, outbound }
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: RwLock<HashMap<ConnectionId, SessionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh, never reused id
    pub fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn insert(&self, session: SessionHandle) {
        self.sessions.write().insert(session.id, session);
    }

    pub fn remove(&self, id: ConnectionId) -> Option<SessionHandle> {
        self.sessions.write().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.sessions.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Queue a message for one session; false if it is gone. A session whose
    /// queue is closed is dropped.
    pub fn send_to(&self, id: ConnectionId, message: ServerMessage) -> bool {
        let delivered = match self.sessions.read().get(&id) {
            Some(session) => session.outbound.send(message).is_ok(),
            None => return false,
        };
        if !delivered {
            debug!("Pruning closed session #{}", id);
            self.sessions.write().remove(&id);
        }
        delivered
    }

    /// Queue a message for every session except `origin`; returns how many
    /// accepted it. Sessions whose queue is closed are dropped.
    pub fn broadcast_except(&self, origin: Option<ConnectionId>, message: &ServerMessage) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let sessions = self.sessions.read();
            for (id, session) in sessions.iter() {
                if Some(*id) == origin {
                    continue;
                }
                if session.outbound.send(message.clone()).is_ok() {
                    delivered += 1;
                } else {
                    closed.push(*id);
                }
            }
        }

        if !closed.is_empty() {
            let mut sessions = self.sessions.write();
            for id in closed {
                debug!("Pruning closed session #{}", id);
                sessions.remove(&id);
            }
        }

        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pause(position: f64) -> ServerMessage {
        ServerMessage::PauseApplied {
            video_id: "vid".to_string(),
            position,
        }
    }

    #[test]
    fn test_ids_are_monotonic() {
        let registry = ConnectionRegistry::new();
        let a = registry.next_id();
        let b = registry.next_id();
        assert!(b > a);
    }

    #[test]
    fn test_broadcast_excludes_origin() {
        let registry = ConnectionRegistry::new();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = mpsc::unbounded_channel();
            let id = registry.next_id();
            registry.insert(SessionHandle::new(id, tx));
            receivers.push((id, rx));
        }

        let origin = receivers[0].0;
        assert_eq!(registry.broadcast_except(Some(origin), &pause(3.0)), 2);

        assert!(receivers[0].1.try_recv().is_err());
        assert_eq!(receivers[1].1.try_recv().unwrap(), pause(3.0));
        assert_eq!(receivers[2].1.try_recv().unwrap(), pause(3.0));

        // No origin reaches everyone
        assert_eq!(registry.broadcast_except(None, &pause(4.0)), 3);
    }

    #[test]
    fn test_closed_sessions_are_pruned() {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.insert(SessionHandle::new(1, tx));
        let (tx2, _rx2) = mpsc::unbounded_channel();
        registry.insert(SessionHandle::new(2, tx2));
        drop(rx);

        assert_eq!(registry.broadcast_except(None, &pause(1.0)), 1);
        assert_eq!(registry.ids(), vec![2]);
        assert!(!registry.send_to(1, pause(1.0)));
        assert!(registry.send_to(2, pause(1.0)));
    }

    #[test]
    fn test_direct_send_prunes_closed_session() {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.insert(SessionHandle::new(4, tx));
        drop(rx);

        assert!(!registry.send_to(4, pause(2.0)));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_remove() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.insert(SessionHandle::new(9, tx));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(9).is_some());
        assert_eq!(registry.len(), 0);
        assert!(registry.remove(9).is_none());
    }
}
