//! Player readiness signal
//!
//! The player flips a `watch` flag once it can accept commands; the client
//! driver waits on it in fixed slices instead of polling the player.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadinessError {
    #[error("player not ready after {attempts} attempts")]
    Exhausted { attempts: u32 },

    #[error("player dropped its readiness signal")]
    Closed,
}

/// Player side: announces readiness
#[derive(Debug, Clone)]
pub struct ReadinessSignal {
    tx: watch::Sender<bool>,
}

/// Driver side: observes readiness
#[derive(Debug, Clone)]
pub struct ReadinessWatcher {
    rx: watch::Receiver<bool>,
}

/// Create a linked signal/watcher pair, initially not ready
pub fn readiness_channel() -> (ReadinessSignal, ReadinessWatcher) {
    let (tx, rx) = watch::channel(false);
    (ReadinessSignal { tx }, ReadinessWatcher { rx })
}

impl ReadinessSignal {
    pub fn set_ready(&self, ready: bool) {
        self.tx.send_replace(ready);
    }

    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn watcher(&self) -> ReadinessWatcher {
        ReadinessWatcher {
            rx: self.tx.subscribe(),
        }
    }
}

impl ReadinessWatcher {
    pub fn is_ready(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait for readiness, giving up after `attempts` slices of `interval`
    pub async fn wait_ready(
        &mut self,
        attempts: u32,
        interval: Duration,
    ) -> Result<(), ReadinessError> {
        for attempt in 1..=attempts {
            match tokio::time::timeout(interval, self.rx.wait_for(|ready| *ready)).await {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(_)) => return Err(ReadinessError::Closed),
                Err(_) => debug!("Player not ready (attempt {}/{})", attempt, attempts),
            }
        }
        Err(ReadinessError::Exhausted { attempts })
    }

    /// Resolve once the player turns ready, however long that takes
    pub async fn ready(&mut self) -> Result<(), ReadinessError> {
        self.rx
            .wait_for(|ready| *ready)
            .await
            .map(|_| ())
            .map_err(|_| ReadinessError::Closed)
    }
}
