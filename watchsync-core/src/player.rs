//! Video player boundary
//!
//! The embedded player is a black box: it loads, seeks, plays and pauses,
//! reports its position, and calls back when its play state changes.

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::reconciler::{
    readiness_channel, PlayerCommand, PlayerObservation, PlayerState, ReadinessSignal,
    ReadinessWatcher,
};

/// A play-state change reported by the player
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayerEvent {
    pub state: PlayerState,
    pub position: f64,
}

/// Operations the sync client needs from a video player
pub trait VideoPlayer: Send {
    fn load(&mut self, video_id: &str, start: f64);
    fn seek(&mut self, position: f64);
    fn play(&mut self);
    fn pause(&mut self);

    /// Playback position in seconds
    fn current_time(&self) -> f64;
    fn is_playing(&self) -> bool;
    fn loaded_video(&self) -> Option<String>;

    /// Watcher that turns true once the player accepts commands
    fn readiness(&self) -> ReadinessWatcher;

    fn is_ready(&self) -> bool {
        self.readiness().is_ready()
    }

    fn observe(&self) -> PlayerObservation {
        PlayerObservation {
            ready: self.is_ready(),
            position: self.current_time(),
            playing: self.is_playing(),
            loaded_video: self.loaded_video(),
        }
    }

    fn execute(&mut self, command: &PlayerCommand) {
        match command {
            PlayerCommand::Load { video_id, start } => self.load(video_id, *start),
            PlayerCommand::Seek(position) => self.seek(*position),
            PlayerCommand::Play => self.play(),
            PlayerCommand::Pause => self.pause(),
        }
    }
}

/// Clock-driven stand-in for an embedded player
///
/// Raises a [`PlayerEvent`] on every play-state transition, never for a
/// plain seek, matching how embedded web players behave.
pub struct SimulatedPlayer {
    video_id: Option<String>,
    state: PlayerState,
    /// Position at `anchored_at`
    anchor_position: f64,
    anchored_at: Instant,
    readiness: ReadinessSignal,
    events: mpsc::UnboundedSender<PlayerEvent>,
}

impl SimulatedPlayer {
    /// Create a player that is not ready yet, plus its event stream
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PlayerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (readiness, _) = readiness_channel();
        let player = Self {
            video_id: None,
            state: PlayerState::Unstarted,
            anchor_position: 0.0,
            anchored_at: Instant::now(),
            readiness,
            events,
        };
        (player, rx)
    }

    /// Handle the embedding side uses to flip readiness
    pub fn readiness_signal(&self) -> ReadinessSignal {
        self.readiness.clone()
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    fn reanchor(&mut self, position: f64) {
        self.anchor_position = position.max(0.0);
        self.anchored_at = Instant::now();
    }

    fn transition(&mut self, state: PlayerState) {
        if self.state == state {
            return;
        }
        self.state = state;
        let event = PlayerEvent {
            state,
            position: self.current_time(),
        };
        debug!("Player state -> {:?} at {:.2}s", state, event.position);
        let _ = self.events.send(event);
    }
}

impl VideoPlayer for SimulatedPlayer {
    fn load(&mut self, video_id: &str, start: f64) {
        self.video_id = Some(video_id.to_string());
        self.reanchor(start);
        self.transition(PlayerState::Unstarted);
    }

    fn seek(&mut self, position: f64) {
        self.reanchor(position);
    }

    fn play(&mut self) {
        if self.video_id.is_none() {
            return;
        }
        let position = self.current_time();
        self.reanchor(position);
        self.transition(PlayerState::Playing);
    }

    fn pause(&mut self) {
        if self.video_id.is_none() {
            return;
        }
        let position = self.current_time();
        self.reanchor(position);
        self.transition(PlayerState::Paused);
    }

    fn current_time(&self) -> f64 {
        if self.state == PlayerState::Playing {
            self.anchor_position + self.anchored_at.elapsed().as_secs_f64()
        } else {
            self.anchor_position
        }
    }

    fn is_playing(&self) -> bool {
        self.state == PlayerState::Playing
    }

    fn loaded_video(&self) -> Option<String> {
        self.video_id.clone()
    }

    fn readiness(&self) -> ReadinessWatcher {
        self.readiness.watcher()
    }

    fn is_ready(&self) -> bool {
        self.readiness.is_ready()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_position_advances_only_while_playing() {
        let (mut player, _events) = SimulatedPlayer::new();
        player.load("vid", 10.0);
        player.play();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let playing_at = player.current_time();
        assert!(playing_at >= 10.2 && playing_at < 11.0, "got {}", playing_at);

        player.pause();
        let paused_at = player.current_time();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(player.current_time(), paused_at);
    }

    #[tokio::test]
    async fn test_events_only_on_state_transitions() {
        let (mut player, mut events) = SimulatedPlayer::new();
        player.load("vid", 0.0);
        player.execute(&PlayerCommand::Play);
        player.execute(&PlayerCommand::Seek(30.0));
        player.execute(&PlayerCommand::Play);
        player.execute(&PlayerCommand::Pause);

        // Load from Unstarted raises nothing; seek and repeated play neither
        let first = events.recv().await.unwrap();
        assert_eq!(first.state, PlayerState::Playing);
        let second = events.recv().await.unwrap();
        assert_eq!(second.state, PlayerState::Paused);
        assert!(second.position >= 30.0);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_observation_reflects_readiness() {
        let (player, _events) = SimulatedPlayer::new();
        assert!(!player.observe().ready);
        player.readiness_signal().set_ready(true);
        let observation = player.observe();
        assert!(observation.ready);
        assert_eq!(observation.loaded_video, None);
    }
}
