//! Client Reconciler
//!
//! Turns inbound server messages into local player commands and local player
//! changes into outbound events. Pure state machine: every input returns a
//! [`Reaction`] that the client driver executes against the player and the
//! connection.

mod readiness;

pub use readiness::*;

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::sync::{elapsed_secs, ClientMessage, ServerMessage};

/// Tuning knobs for drift correction and player readiness
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilerConfig {
    /// Drift (seconds) tolerated before a corrective seek
    pub latency_threshold_secs: f64,
    /// Position jump (seconds) that counts as a local seek
    pub seek_jump_threshold_secs: f64,
    pub ready_retry_attempts: u32,
    pub ready_retry_interval: Duration,
    /// Ask the server for a fresh Init when the player turns ready after
    /// the retry budget ran out
    pub resync_on_late_ready: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            latency_threshold_secs: 1.5,
            seek_jump_threshold_secs: 1.0,
            ready_retry_attempts: 20,
            ready_retry_interval: Duration::from_secs(2),
            resync_on_late_ready: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No video known yet
    Idle,
    /// Video known, waiting for the player to accept commands
    AwaitingPlayer,
    Synced,
    /// Player never became ready; remote events are dropped
    Unavailable,
}

impl Phase {
    pub fn label(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::AwaitingPlayer => "waiting for player",
            Phase::Synced => "synced",
            Phase::Unavailable => "sync unavailable",
        }
    }
}

/// Play state as reported by the player's change callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Unstarted,
    Playing,
    Paused,
    Buffering,
    Ended,
}

/// What the driver read off the player just before feeding an input
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayerObservation {
    pub ready: bool,
    pub position: f64,
    pub playing: bool,
    pub loaded_video: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlayerCommand {
    Load { video_id: String, start: f64 },
    Seek(f64),
    Play,
    Pause,
}

/// Side effects requested by the reconciler
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reaction {
    pub commands: Vec<PlayerCommand>,
    pub outbound: Vec<ClientMessage>,
    /// The driver should start waiting on the readiness signal
    pub await_player: bool,
}

impl Reaction {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.outbound.is_empty() && !self.await_player
    }

    fn send(message: ClientMessage) -> Self {
        Self {
            outbound: vec![message],
            ..Default::default()
        }
    }
}

/// Per-viewer sync state
#[derive(Debug)]
pub struct Reconciler {
    config: ReconcilerConfig,
    phase: Phase,
    current_video_id: Option<String>,
    player_ready: bool,
    suppress_next_local_event: bool,
    last_observed_position: f64,
    last_observed_at: u64,
    last_observed_playing: bool,
    /// Latest remote target received while the player was not ready
    pending: Option<ServerMessage>,
    /// Server clock minus local clock, from ping/pong
    clock_offset_ms: i64,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self {
            config,
            phase: Phase::Idle,
            current_video_id: None,
            player_ready: false,
            suppress_next_local_event: false,
            last_observed_position: 0.0,
            last_observed_at: 0,
            last_observed_playing: false,
            pending: None,
            clock_offset_ms: 0,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn current_video_id(&self) -> Option<&str> {
        self.current_video_id.as_deref()
    }

    pub fn is_suppressing(&self) -> bool {
        self.suppress_next_local_event
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn set_clock_offset(&mut self, offset_ms: i64) {
        self.clock_offset_ms = offset_ms;
    }

    /// Local wall clock shifted onto the server's clock
    fn server_now(&self, local_now: u64) -> u64 {
        (local_now as i64 + self.clock_offset_ms).max(0) as u64
    }

    fn settled_phase(&self) -> Phase {
        if self.current_video_id.is_some() {
            Phase::Synced
        } else {
            Phase::Idle
        }
    }

    fn observe(&mut self, position: f64, playing: bool, now: u64) {
        self.last_observed_position = position;
        self.last_observed_playing = playing;
        self.last_observed_at = now;
    }

    /// Where the player should be now if nobody touched it since the last
    /// observation
    fn expected_local_position(&self, now: u64) -> f64 {
        if self.last_observed_playing {
            self.last_observed_position + elapsed_secs(self.last_observed_at, now)
        } else {
            self.last_observed_position
        }
    }

    // ========================================================================
    // Remote inputs
    // ========================================================================

    /// Handle a message from the server
    pub fn on_remote(
        &mut self,
        message: ServerMessage,
        player: &PlayerObservation,
        local_now: u64,
    ) -> Reaction {
        if matches!(message, ServerMessage::Pong { .. }) {
            return Reaction::default();
        }

        if self.phase == Phase::Unavailable {
            debug!("Sync unavailable, dropping {:?}", message);
            return Reaction::default();
        }

        if let Some(video_id) = message.video_id() {
            self.current_video_id = Some(video_id.to_string());
        }

        self.player_ready = player.ready;
        if !player.ready {
            // Latest target wins; it is applied once the player is ready
            let awaiting = self.pending.is_none();
            self.pending = Some(message);
            if self.current_video_id.is_some() {
                self.phase = Phase::AwaitingPlayer;
            }
            return Reaction {
                await_player: awaiting,
                ..Default::default()
            };
        }

        // This message supersedes anything queued while the player was down
        self.pending = None;
        self.apply_remote(message, player, local_now)
    }

    fn apply_remote(
        &mut self,
        message: ServerMessage,
        player: &PlayerObservation,
        local_now: u64,
    ) -> Reaction {
        let now = self.server_now(local_now);
        let threshold = self.config.latency_threshold_secs;
        let mut commands = Vec::new();
        // Predicted player state once the commands have run
        let mut target_position = player.position;
        let mut target_playing = player.playing;

        match message {
            ServerMessage::Init {
                video_id: None, ..
            } => {
                debug!("Init: room has no video yet");
            }

            ServerMessage::Init {
                video_id: Some(video_id),
                is_playing,
                position,
                reference_timestamp,
            } => {
                let target = if is_playing {
                    position + elapsed_secs(reference_timestamp, now)
                } else {
                    position
                };
                info!(
                    "Init: {} at {:.2}s ({})",
                    video_id,
                    target,
                    if is_playing { "playing" } else { "paused" }
                );

                let loaded = player.loaded_video.as_deref() == Some(video_id.as_str());
                if loaded {
                    commands.push(PlayerCommand::Seek(target));
                } else {
                    commands.push(PlayerCommand::Load {
                        video_id,
                        start: target,
                    });
                }
                if is_playing && (!loaded || !player.playing) {
                    commands.push(PlayerCommand::Play);
                } else if !is_playing && (!loaded || player.playing) {
                    commands.push(PlayerCommand::Pause);
                }
                target_position = target;
                target_playing = is_playing;
            }

            ServerMessage::PlayApplied {
                video_id,
                position,
                reference_timestamp,
            } => {
                let target = position + elapsed_secs(reference_timestamp, now);
                if player.loaded_video.as_deref() != Some(video_id.as_str()) {
                    info!("Remote play: loading {} at {:.2}s", video_id, target);
                    commands.push(PlayerCommand::Load {
                        video_id,
                        start: target,
                    });
                    commands.push(PlayerCommand::Play);
                } else {
                    let drift = player.position - target;
                    debug!(
                        "Remote play: drift {:+.2}s (local {:.2}s, target {:.2}s)",
                        drift, player.position, target
                    );
                    if drift.abs() > threshold {
                        commands.push(PlayerCommand::Seek(target));
                    }
                    if !player.playing {
                        commands.push(PlayerCommand::Play);
                    }
                }
                let repositioned = commands
                    .iter()
                    .any(|c| matches!(c, PlayerCommand::Seek(_) | PlayerCommand::Load { .. }));
                if repositioned {
                    target_position = target;
                }
                target_playing = true;
            }

            ServerMessage::PauseApplied { video_id, position } => {
                debug!("Remote pause at {:.2}s", position);
                if player.loaded_video.as_deref() != Some(video_id.as_str()) {
                    commands.push(PlayerCommand::Load {
                        video_id,
                        start: position,
                    });
                    commands.push(PlayerCommand::Pause);
                } else {
                    commands.push(PlayerCommand::Seek(position));
                    if player.playing {
                        commands.push(PlayerCommand::Pause);
                    }
                }
                target_position = position;
                target_playing = false;
            }

            ServerMessage::SeekApplied {
                video_id,
                position,
                reference_timestamp,
            } => {
                let target = match reference_timestamp {
                    Some(ts) => position + elapsed_secs(ts, now),
                    None => position,
                };
                if player.loaded_video.as_deref() != Some(video_id.as_str()) {
                    commands.push(PlayerCommand::Load {
                        video_id,
                        start: target,
                    });
                    commands.push(if reference_timestamp.is_some() {
                        PlayerCommand::Play
                    } else {
                        PlayerCommand::Pause
                    });
                    target_position = target;
                    target_playing = reference_timestamp.is_some();
                } else {
                    let drift = player.position - target;
                    debug!(
                        "Remote seek: drift {:+.2}s (local {:.2}s, target {:.2}s)",
                        drift, player.position, target
                    );
                    if drift.abs() > threshold {
                        commands.push(PlayerCommand::Seek(target));
                        target_position = target;
                    }
                }
            }

            ServerMessage::Pong { .. } => {}
        }

        // Only commands that raise a state-change callback arm suppression;
        // a bare seek raises none, so the flag would swallow the next real
        // user action instead
        if commands.iter().any(raises_state_change) {
            self.suppress_next_local_event = true;
        }

        self.observe(target_position, target_playing, local_now);
        self.phase = self.settled_phase();

        Reaction {
            commands,
            ..Default::default()
        }
    }

    // ========================================================================
    // Local inputs
    // ========================================================================

    /// The player's state-change callback fired
    pub fn on_local_change(
        &mut self,
        state: PlayerState,
        position: f64,
        local_now: u64,
    ) -> Reaction {
        let playing = state == PlayerState::Playing;

        // Transitional states carry no user intent
        if matches!(state, PlayerState::Unstarted | PlayerState::Buffering) {
            return Reaction::default();
        }

        if self.suppress_next_local_event {
            debug!("Suppressed echo of remote update ({:?})", state);
            self.suppress_next_local_event = false;
            self.observe(position, playing, local_now);
            return Reaction::default();
        }

        let Some(video_id) = self.current_video_id.clone() else {
            self.observe(position, playing, local_now);
            return Reaction::default();
        };
        if !self.player_ready || self.phase == Phase::Unavailable {
            self.observe(position, playing, local_now);
            return Reaction::default();
        }

        let mut outbound = Vec::new();
        match state {
            PlayerState::Playing => outbound.push(ClientMessage::Play {
                video_id: Some(video_id),
                position: Some(position),
            }),
            PlayerState::Paused => outbound.push(ClientMessage::Pause {}),
            _ => {}
        }
        if let Some(seek) = self.detect_jump(position, local_now) {
            outbound.push(seek);
        }

        self.observe(position, playing, local_now);
        Reaction {
            outbound,
            ..Default::default()
        }
    }

    /// Periodic position sample; catches seeks that raise no state change
    pub fn on_position_tick(&mut self, position: f64, playing: bool, local_now: u64) -> Reaction {
        let active = self.current_video_id.is_some()
            && self.player_ready
            && self.phase == Phase::Synced;
        let seek = if active {
            self.detect_jump(position, local_now)
        } else {
            None
        };
        self.observe(position, playing, local_now);
        match seek {
            Some(message) => Reaction::send(message),
            None => Reaction::default(),
        }
    }

    fn detect_jump(&self, position: f64, local_now: u64) -> Option<ClientMessage> {
        let expected = self.expected_local_position(local_now);
        if (position - expected).abs() > self.config.seek_jump_threshold_secs {
            debug!("Local seek detected: {:.2}s -> {:.2}s", expected, position);
            Some(ClientMessage::Seek {
                position: Some(position),
            })
        } else {
            None
        }
    }

    /// The local user picked a new video
    pub fn load_video(
        &mut self,
        video_id: String,
        player: &PlayerObservation,
        local_now: u64,
    ) -> Reaction {
        info!("Loading video {}", video_id);
        self.current_video_id = Some(video_id.clone());
        let outbound = vec![ClientMessage::Play {
            video_id: Some(video_id.clone()),
            position: Some(0.0),
        }];

        self.player_ready = player.ready;
        if !player.ready {
            let awaiting = self.pending.is_none();
            self.pending = Some(ServerMessage::PlayApplied {
                video_id,
                position: 0.0,
                reference_timestamp: self.server_now(local_now),
            });
            self.phase = Phase::AwaitingPlayer;
            return Reaction {
                outbound,
                await_player: awaiting,
                ..Default::default()
            };
        }

        self.pending = None;
        self.suppress_next_local_event = true;
        self.observe(0.0, true, local_now);
        self.phase = Phase::Synced;
        Reaction {
            commands: vec![
                PlayerCommand::Load {
                    video_id,
                    start: 0.0,
                },
                PlayerCommand::Play,
            ],
            outbound,
            await_player: false,
        }
    }

    // ========================================================================
    // Readiness
    // ========================================================================

    /// The player can now accept commands
    pub fn on_player_ready(&mut self, player: &PlayerObservation, local_now: u64) -> Reaction {
        self.player_ready = true;

        if self.phase == Phase::Unavailable {
            self.phase = self.settled_phase();
            self.pending = None;
            if self.config.resync_on_late_ready {
                info!("Player ready after retry budget ran out, requesting resync");
                return Reaction::send(ClientMessage::RequestInit);
            }
            return Reaction::default();
        }

        match self.pending.take() {
            Some(message) => {
                debug!("Player ready, applying queued target");
                let ready = PlayerObservation {
                    ready: true,
                    ..player.clone()
                };
                self.apply_remote(message, &ready, local_now)
            }
            None => {
                self.phase = self.settled_phase();
                Reaction::default()
            }
        }
    }

    /// The readiness budget ran out
    pub fn on_readiness_exhausted(&mut self) {
        if self.player_ready {
            return;
        }
        warn!(
            "Player not ready after {} attempts, sync unavailable",
            self.config.ready_retry_attempts
        );
        self.pending = None;
        self.phase = Phase::Unavailable;
    }
}

fn raises_state_change(command: &PlayerCommand) -> bool {
    !matches!(command, PlayerCommand::Seek(_))
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(ReconcilerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000_000;

    fn ready_player(video: &str, position: f64, playing: bool) -> PlayerObservation {
        PlayerObservation {
            ready: true,
            position,
            playing,
            loaded_video: Some(video.to_string()),
        }
    }

    fn synced(video: &str, position: f64, playing: bool) -> Reconciler {
        let mut r = Reconciler::default();
        r.on_remote(
            ServerMessage::Init {
                video_id: Some(video.to_string()),
                is_playing: playing,
                position,
                reference_timestamp: NOW,
            },
            &ready_player(video, position, playing),
            NOW,
        );
        // consume any echo from the init
        r.suppress_next_local_event = false;
        r
    }

    fn play_applied(position: f64, reference_timestamp: u64) -> ServerMessage {
        ServerMessage::PlayApplied {
            video_id: "vid".to_string(),
            position,
            reference_timestamp,
        }
    }

    #[test]
    fn test_small_drift_is_tolerated() {
        let mut r = synced("vid", 10.0, true);
        // target 12.0 after 2s of extrapolation, local 12.3
        let reaction = r.on_remote(
            play_applied(10.0, NOW),
            &ready_player("vid", 12.3, true),
            NOW + 2000,
        );
        assert!(reaction.commands.is_empty());
    }

    #[test]
    fn test_large_drift_is_corrected() {
        let mut r = synced("vid", 10.0, true);
        let reaction = r.on_remote(
            play_applied(10.0, NOW),
            &ready_player("vid", 14.0, true),
            NOW + 2000,
        );
        assert_eq!(reaction.commands, vec![PlayerCommand::Seek(12.0)]);
    }

    #[test]
    fn test_threshold_is_configurable() {
        let mut r = Reconciler::new(ReconcilerConfig {
            latency_threshold_secs: 0.2,
            ..Default::default()
        });
        r.on_remote(
            ServerMessage::Init {
                video_id: Some("vid".to_string()),
                is_playing: true,
                position: 10.0,
                reference_timestamp: NOW,
            },
            &ready_player("vid", 10.0, true),
            NOW,
        );
        let reaction = r.on_remote(
            play_applied(10.0, NOW),
            &ready_player("vid", 12.3, true),
            NOW + 2000,
        );
        assert_eq!(reaction.commands, vec![PlayerCommand::Seek(12.0)]);
    }

    #[test]
    fn test_clock_offset_shifts_extrapolation() {
        let mut r = synced("vid", 0.0, true);
        // Server clock is 3s ahead of ours
        r.set_clock_offset(3000);
        let reaction = r.on_remote(
            play_applied(10.0, NOW + 3000),
            &ready_player("vid", 20.0, true),
            NOW,
        );
        assert_eq!(reaction.commands, vec![PlayerCommand::Seek(10.0)]);
    }

    #[test]
    fn test_remote_play_never_echoes() {
        let mut r = synced("vid", 0.0, false);
        let reaction = r.on_remote(
            play_applied(5.0, NOW),
            &ready_player("vid", 0.0, false),
            NOW,
        );
        assert_eq!(
            reaction.commands,
            vec![PlayerCommand::Seek(5.0), PlayerCommand::Play]
        );
        assert!(reaction.outbound.is_empty());

        // The player reports the state change the remote play caused
        let echo = r.on_local_change(PlayerState::Playing, 5.0, NOW + 50);
        assert!(echo.outbound.is_empty());

        // A genuine local pause afterwards is sent
        let local = r.on_local_change(PlayerState::Paused, 5.5, NOW + 550);
        assert_eq!(local.outbound, vec![ClientMessage::Pause {}]);
    }

    #[test]
    fn test_seek_only_reaction_does_not_arm_suppression() {
        let mut r = synced("vid", 10.0, false);
        let reaction = r.on_remote(
            ServerMessage::SeekApplied {
                video_id: "vid".to_string(),
                position: 40.0,
                reference_timestamp: None,
            },
            &ready_player("vid", 10.0, false),
            NOW,
        );
        assert_eq!(reaction.commands, vec![PlayerCommand::Seek(40.0)]);
        assert!(!r.is_suppressing());

        // The remote seek is not mistaken for a local jump
        assert!(r.on_position_tick(40.0, false, NOW + 500).is_empty());
    }

    #[test]
    fn test_corrective_seek_while_playing_sends_nothing_back() {
        let mut r = synced("vid", 10.0, true);
        let reaction = r.on_remote(
            ServerMessage::SeekApplied {
                video_id: "vid".to_string(),
                position: 40.0,
                reference_timestamp: Some(NOW),
            },
            &ready_player("vid", 11.0, true),
            NOW + 1000,
        );
        assert_eq!(reaction.commands, vec![PlayerCommand::Seek(41.0)]);
        assert!(reaction.outbound.is_empty());
        assert!(!r.is_suppressing());

        // The player keeps running from the corrected position
        assert!(r.on_position_tick(41.5, true, NOW + 1500).is_empty());
        assert!(r.on_position_tick(42.0, true, NOW + 2000).is_empty());

        // The next real user action is not swallowed
        let local = r.on_local_change(PlayerState::Paused, 42.2, NOW + 2200);
        assert_eq!(local.outbound, vec![ClientMessage::Pause {}]);
    }

    #[test]
    fn test_remote_pause_seeks_exactly_then_pauses() {
        let mut r = synced("vid", 10.0, true);
        let reaction = r.on_remote(
            ServerMessage::PauseApplied {
                video_id: "vid".to_string(),
                position: 11.2,
            },
            &ready_player("vid", 11.4, true),
            NOW,
        );
        assert_eq!(
            reaction.commands,
            vec![PlayerCommand::Seek(11.2), PlayerCommand::Pause]
        );
        assert!(r.is_suppressing());
    }

    #[test]
    fn test_remote_play_loads_different_video() {
        let mut r = synced("vid", 10.0, true);
        let reaction = r.on_remote(
            ServerMessage::PlayApplied {
                video_id: "other".to_string(),
                position: 0.0,
                reference_timestamp: NOW,
            },
            &ready_player("vid", 30.0, true),
            NOW + 1000,
        );
        assert_eq!(
            reaction.commands,
            vec![
                PlayerCommand::Load {
                    video_id: "other".to_string(),
                    start: 1.0
                },
                PlayerCommand::Play
            ]
        );
        assert_eq!(r.current_video_id(), Some("other"));
    }

    #[test]
    fn test_init_seeks_unconditionally() {
        let mut r = Reconciler::default();
        let reaction = r.on_remote(
            ServerMessage::Init {
                video_id: Some("vid".to_string()),
                is_playing: true,
                position: 30.0,
                reference_timestamp: NOW,
            },
            &ready_player("vid", 35.2, true),
            NOW + 5000,
        );
        assert_eq!(reaction.commands, vec![PlayerCommand::Seek(35.0)]);
        assert_eq!(r.phase(), Phase::Synced);
    }

    #[test]
    fn test_init_without_video_stays_idle() {
        let mut r = Reconciler::default();
        let reaction = r.on_remote(
            ServerMessage::Init {
                video_id: None,
                is_playing: false,
                position: 0.0,
                reference_timestamp: NOW,
            },
            &PlayerObservation {
                ready: true,
                ..Default::default()
            },
            NOW,
        );
        assert!(reaction.is_empty());
        assert_eq!(r.phase(), Phase::Idle);
    }

    #[test]
    fn test_local_actions_are_classified() {
        let mut r = synced("vid", 10.0, false);

        let play = r.on_local_change(PlayerState::Playing, 10.0, NOW + 100);
        assert_eq!(
            play.outbound,
            vec![ClientMessage::Play {
                video_id: Some("vid".to_string()),
                position: Some(10.0)
            }]
        );

        // Pause after 3s of playback, no jump
        let pause = r.on_local_change(PlayerState::Paused, 13.0, NOW + 3100);
        assert_eq!(pause.outbound, vec![ClientMessage::Pause {}]);

        // Resume somewhere else entirely: both Play and Seek fire
        let jump = r.on_local_change(PlayerState::Playing, 60.0, NOW + 4000);
        assert_eq!(
            jump.outbound,
            vec![
                ClientMessage::Play {
                    video_id: Some("vid".to_string()),
                    position: Some(60.0)
                },
                ClientMessage::Seek {
                    position: Some(60.0)
                }
            ]
        );

        // Scrubbing while playing is caught by the position tick
        let tick = r.on_position_tick(90.0, true, NOW + 4500);
        assert_eq!(
            tick.outbound,
            vec![ClientMessage::Seek {
                position: Some(90.0)
            }]
        );
        assert!(r.on_position_tick(90.5, true, NOW + 5000).is_empty());
    }

    #[test]
    fn test_transitional_states_are_ignored() {
        let mut r = synced("vid", 10.0, true);
        r.suppress_next_local_event = true;
        assert!(r
            .on_local_change(PlayerState::Buffering, 10.0, NOW)
            .is_empty());
        assert!(r.is_suppressing());
    }

    #[test]
    fn test_remote_targets_queue_until_player_ready() {
        let mut r = Reconciler::default();
        let not_ready = PlayerObservation::default();

        let first = r.on_remote(
            ServerMessage::Init {
                video_id: Some("vid".to_string()),
                is_playing: true,
                position: 5.0,
                reference_timestamp: NOW,
            },
            &not_ready,
            NOW,
        );
        assert!(first.await_player);
        assert!(first.commands.is_empty());
        assert_eq!(r.phase(), Phase::AwaitingPlayer);

        // A newer target replaces the queued one without a second wait
        let second = r.on_remote(play_applied(20.0, NOW + 1000), &not_ready, NOW + 1000);
        assert!(!second.await_player);

        let reaction = r.on_player_ready(
            &PlayerObservation {
                ready: true,
                ..Default::default()
            },
            NOW + 3000,
        );
        assert_eq!(
            reaction.commands,
            vec![
                PlayerCommand::Load {
                    video_id: "vid".to_string(),
                    start: 22.0
                },
                PlayerCommand::Play
            ]
        );
        assert_eq!(r.phase(), Phase::Synced);
        assert!(!r.has_pending());
    }

    #[test]
    fn test_newer_remote_event_replaces_queued_target() {
        let mut r = Reconciler::default();
        r.on_remote(
            ServerMessage::Init {
                video_id: Some("vid".to_string()),
                is_playing: true,
                position: 5.0,
                reference_timestamp: NOW,
            },
            &PlayerObservation::default(),
            NOW,
        );
        assert!(r.has_pending());

        // The player came up and a pause arrived before the readiness wait fired
        let reaction = r.on_remote(
            ServerMessage::PauseApplied {
                video_id: "vid".to_string(),
                position: 7.0,
            },
            &PlayerObservation {
                ready: true,
                ..Default::default()
            },
            NOW + 2000,
        );
        assert_eq!(
            reaction.commands,
            vec![
                PlayerCommand::Load {
                    video_id: "vid".to_string(),
                    start: 7.0
                },
                PlayerCommand::Pause
            ]
        );
        assert!(!r.has_pending());

        // The late readiness notification must not resume the old Init
        let late = r.on_player_ready(&ready_player("vid", 7.0, false), NOW + 2100);
        assert!(late.is_empty());
    }

    #[test]
    fn test_load_video_drops_queued_target() {
        let mut r = Reconciler::default();
        r.on_remote(play_applied(5.0, NOW), &PlayerObservation::default(), NOW);
        assert!(r.has_pending());

        r.load_video(
            "fresh".to_string(),
            &PlayerObservation {
                ready: true,
                ..Default::default()
            },
            NOW + 1000,
        );
        assert!(!r.has_pending());
        assert!(r
            .on_player_ready(&ready_player("fresh", 0.0, true), NOW + 1100)
            .is_empty());
    }

    #[test]
    fn test_exhausted_readiness_then_late_ready_resyncs() {
        let mut r = Reconciler::default();
        r.on_remote(play_applied(5.0, NOW), &PlayerObservation::default(), NOW);
        r.on_readiness_exhausted();
        assert_eq!(r.phase(), Phase::Unavailable);

        // Remote events are dropped while unavailable
        let dropped = r.on_remote(play_applied(9.0, NOW), &PlayerObservation::default(), NOW);
        assert!(dropped.is_empty());

        let reaction = r.on_player_ready(
            &PlayerObservation {
                ready: true,
                ..Default::default()
            },
            NOW + 60_000,
        );
        assert_eq!(reaction.outbound, vec![ClientMessage::RequestInit]);
        assert_eq!(r.phase(), Phase::Synced);
    }

    #[test]
    fn test_late_ready_without_resync() {
        let mut r = Reconciler::new(ReconcilerConfig {
            resync_on_late_ready: false,
            ..Default::default()
        });
        r.on_readiness_exhausted();
        let reaction = r.on_player_ready(
            &PlayerObservation {
                ready: true,
                ..Default::default()
            },
            NOW,
        );
        assert!(reaction.is_empty());
        assert_eq!(r.phase(), Phase::Idle);
    }

    #[test]
    fn test_load_video_announces_play() {
        let mut r = Reconciler::default();
        let reaction = r.load_video(
            "fresh".to_string(),
            &PlayerObservation {
                ready: true,
                ..Default::default()
            },
            NOW,
        );
        assert_eq!(
            reaction.outbound,
            vec![ClientMessage::Play {
                video_id: Some("fresh".to_string()),
                position: Some(0.0)
            }]
        );
        assert_eq!(
            reaction.commands,
            vec![
                PlayerCommand::Load {
                    video_id: "fresh".to_string(),
                    start: 0.0
                },
                PlayerCommand::Play
            ]
        );
        // The resulting Playing callback is not sent again
        assert!(r
            .on_local_change(PlayerState::Playing, 0.0, NOW + 300)
            .outbound
            .is_empty());
    }
}
