//! Master Playback State
//!
//! The single authoritative timeline of the room. Positions are seconds,
//! timestamps are wall-clock milliseconds since the UNIX epoch.

use thiserror::Error;

use super::protocol::{EventKind, PlaybackEvent, PlaybackSnapshot, ServerMessage};

/// Get current time in milliseconds since UNIX epoch
pub fn current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Seconds elapsed between two wall-clock instants, zero if `now` is earlier
pub fn elapsed_secs(since_ms: u64, now_ms: u64) -> f64 {
    now_ms.saturating_sub(since_ms) as f64 / 1000.0
}

/// Why an inbound event was dropped before touching the state
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("{0} event is missing a position")]
    MissingPosition(&'static str),

    #[error("invalid position {0}")]
    InvalidPosition(f64),

    #[error("{0} event received before any video was set")]
    NoVideo(&'static str),
}

/// Result of a successful mutation: what fan-out needs to tell everyone else
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedEvent {
    pub kind: EventKind,
    pub video_id: String,
    pub reference_position: f64,
    pub reference_timestamp: u64,
    pub is_playing: bool,
}

impl AppliedEvent {
    /// Kind-specific wire message for the other viewers
    pub fn to_message(&self) -> ServerMessage {
        match self.kind {
            EventKind::Play => ServerMessage::PlayApplied {
                video_id: self.video_id.clone(),
                position: self.reference_position,
                reference_timestamp: self.reference_timestamp,
            },
            EventKind::Pause => ServerMessage::PauseApplied {
                video_id: self.video_id.clone(),
                position: self.reference_position,
            },
            EventKind::Seek => ServerMessage::SeekApplied {
                video_id: self.video_id.clone(),
                position: self.reference_position,
                reference_timestamp: self.is_playing.then_some(self.reference_timestamp),
            },
        }
    }
}

/// What is playing, where, and since when
#[derive(Debug, Clone, PartialEq)]
pub struct MasterPlaybackState {
    video_id: Option<String>,
    is_playing: bool,
    reference_position: f64,
    reference_timestamp: u64,
}

impl Default for MasterPlaybackState {
    fn default() -> Self {
        Self {
            video_id: None,
            is_playing: false,
            reference_position: 0.0,
            reference_timestamp: 0,
        }
    }
}

impl MasterPlaybackState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the state from a persisted snapshot; the saved position is
    /// taken as accurate at `now`
    pub fn from_snapshot(snapshot: &PlaybackSnapshot, now: u64) -> Self {
        let position = if snapshot.position.is_finite() {
            snapshot.position.max(0.0)
        } else {
            0.0
        };
        Self {
            video_id: Some(snapshot.video_id.clone()),
            is_playing: snapshot.is_playing,
            reference_position: position,
            reference_timestamp: now,
        }
    }

    pub fn video_id(&self) -> Option<&str> {
        self.video_id.as_deref()
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    pub fn reference_position(&self) -> f64 {
        self.reference_position
    }

    pub fn reference_timestamp(&self) -> u64 {
        self.reference_timestamp
    }

    /// Extrapolated playback offset at `now`
    pub fn current_position(&self, now: u64) -> f64 {
        if self.is_playing {
            self.reference_position + elapsed_secs(self.reference_timestamp, now)
        } else {
            self.reference_position
        }
    }

    pub fn apply_play(&mut self, video_id: String, position: f64, now: u64) {
        self.video_id = Some(video_id);
        self.reference_position = position;
        self.reference_timestamp = now;
        self.is_playing = true;
    }

    pub fn apply_pause(&mut self, now: u64) {
        self.reference_position = self.current_position(now);
        self.is_playing = false;
    }

    /// Move the timeline without changing play/pause state
    pub fn apply_seek(&mut self, position: f64, now: u64) {
        self.reference_position = position;
        self.reference_timestamp = now;
    }

    /// Validate an inbound event and route it to exactly one transition.
    /// Nothing is mutated when a rejection is returned.
    pub fn apply_event(
        &mut self,
        event: PlaybackEvent,
        now: u64,
    ) -> Result<AppliedEvent, Rejection> {
        let kind = event.kind();
        match event {
            PlaybackEvent::Play { video_id, position } => {
                let position = validate_position("play", position)?;
                let video_id = video_id
                    .filter(|v| !v.is_empty())
                    .or_else(|| self.video_id.clone())
                    .ok_or(Rejection::NoVideo("play"))?;
                self.apply_play(video_id, position, now);
            }
            PlaybackEvent::Pause => {
                if self.video_id.is_none() {
                    return Err(Rejection::NoVideo("pause"));
                }
                self.apply_pause(now);
            }
            PlaybackEvent::Seek { position } => {
                let position = validate_position("seek", position)?;
                if self.video_id.is_none() {
                    return Err(Rejection::NoVideo("seek"));
                }
                self.apply_seek(position, now);
            }
        }

        Ok(AppliedEvent {
            kind,
            video_id: self.video_id.clone().unwrap_or_default(),
            reference_position: self.reference_position,
            reference_timestamp: self.reference_timestamp,
            is_playing: self.is_playing,
        })
    }

    /// Persistable view at `now`, `None` until a video has been set
    pub fn snapshot(&self, now: u64) -> Option<PlaybackSnapshot> {
        self.video_id.as_ref().map(|video_id| PlaybackSnapshot {
            video_id: video_id.clone(),
            position: self.current_position(now),
            is_playing: self.is_playing,
        })
    }

    /// Point-in-time state for a late joiner
    pub fn init_message(&self, now: u64) -> ServerMessage {
        ServerMessage::Init {
            video_id: self.video_id.clone(),
            is_playing: self.is_playing,
            position: self.current_position(now),
            reference_timestamp: now,
        }
    }
}

fn validate_position(event: &'static str, position: Option<f64>) -> Result<f64, Rejection> {
    let position = position.ok_or(Rejection::MissingPosition(event))?;
    if !position.is_finite() || position < 0.0 {
        return Err(Rejection::InvalidPosition(position));
    }
    Ok(position)
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_000_000;

    fn playing_at(position: f64, at: u64) -> MasterPlaybackState {
        let mut state = MasterPlaybackState::new();
        state.apply_play("vid".to_string(), position, at);
        state
    }

    #[test]
    fn test_extrapolates_while_playing() {
        let state = playing_at(10.0, T0);
        let position = state.current_position(T0 + 2000);
        assert!((position - 12.0).abs() <= 0.05, "got {}", position);
    }

    #[test]
    fn test_position_monotonic_while_playing_constant_while_paused() {
        let mut state = playing_at(5.0, T0);
        let mut last = state.current_position(T0);
        for step in 1..50 {
            let now = T0 + step * 137;
            let position = state.current_position(now);
            assert!(position >= last);
            last = position;
        }

        state.apply_pause(T0 + 3000);
        let paused_at = state.current_position(T0 + 3000);
        for step in 1..50 {
            assert_eq!(state.current_position(T0 + 3000 + step * 1000), paused_at);
        }
    }

    #[test]
    fn test_clock_going_backwards_never_yields_negative_position() {
        let state = playing_at(0.0, T0);
        assert_eq!(state.current_position(T0 - 5000), 0.0);
    }

    #[test]
    fn test_pause_is_idempotent() {
        let mut state = playing_at(10.0, T0);
        state.apply_pause(T0 + 4000);
        let first = state.reference_position();
        state.apply_pause(T0 + 9000);
        assert_eq!(state.reference_position(), first);
        assert!((first - 14.0).abs() < 1e-9);
        assert!(!state.is_playing());
    }

    #[test]
    fn test_seek_preserves_play_state() {
        let mut state = playing_at(10.0, T0);
        state.apply_seek(60.0, T0 + 1000);
        assert!(state.is_playing());
        assert!((state.current_position(T0 + 2000) - 61.0).abs() < 1e-9);

        state.apply_pause(T0 + 2000);
        state.apply_seek(90.0, T0 + 3000);
        assert!(!state.is_playing());
        assert_eq!(state.current_position(T0 + 10_000), 90.0);
    }

    #[test]
    fn test_last_writer_wins() {
        let mut state = playing_at(0.0, T0);
        state
            .apply_event(PlaybackEvent::Seek { position: Some(40.0) }, T0 + 10)
            .unwrap();
        state
            .apply_event(PlaybackEvent::Seek { position: Some(55.0) }, T0 + 20)
            .unwrap();
        assert_eq!(state.reference_position(), 55.0);
    }

    #[test]
    fn test_rejections_leave_state_untouched() {
        let mut state = MasterPlaybackState::new();
        let before = state.clone();

        assert_eq!(
            state.apply_event(PlaybackEvent::Pause, T0),
            Err(Rejection::NoVideo("pause"))
        );
        assert_eq!(
            state.apply_event(PlaybackEvent::Seek { position: Some(3.0) }, T0),
            Err(Rejection::NoVideo("seek"))
        );
        assert_eq!(
            state.apply_event(
                PlaybackEvent::Play {
                    video_id: None,
                    position: Some(1.0)
                },
                T0
            ),
            Err(Rejection::NoVideo("play"))
        );
        assert_eq!(state, before);

        let mut state = playing_at(1.0, T0);
        let before = state.clone();
        assert_eq!(
            state.apply_event(PlaybackEvent::Seek { position: None }, T0 + 5),
            Err(Rejection::MissingPosition("seek"))
        );
        assert_eq!(
            state.apply_event(
                PlaybackEvent::Play {
                    video_id: Some("other".to_string()),
                    position: None
                },
                T0 + 5
            ),
            Err(Rejection::MissingPosition("play"))
        );
        assert!(matches!(
            state.apply_event(PlaybackEvent::Seek { position: Some(-2.0) }, T0 + 5),
            Err(Rejection::InvalidPosition(_))
        ));
        assert_eq!(state, before);
    }

    #[test]
    fn test_play_without_video_resumes_current() {
        let mut state = playing_at(10.0, T0);
        state.apply_pause(T0 + 1000);
        let applied = state
            .apply_event(
                PlaybackEvent::Play {
                    video_id: None,
                    position: Some(11.0),
                },
                T0 + 2000,
            )
            .unwrap();
        assert_eq!(applied.video_id, "vid");
        assert!(applied.is_playing);
    }

    #[test]
    fn test_applied_event_messages() {
        let mut state = playing_at(10.0, T0);
        let seek = state
            .apply_event(PlaybackEvent::Seek { position: Some(20.0) }, T0 + 100)
            .unwrap();
        assert_eq!(
            seek.to_message(),
            ServerMessage::SeekApplied {
                video_id: "vid".to_string(),
                position: 20.0,
                reference_timestamp: Some(T0 + 100),
            }
        );

        let pause = state.apply_event(PlaybackEvent::Pause, T0 + 1100).unwrap();
        assert_eq!(
            pause.to_message(),
            ServerMessage::PauseApplied {
                video_id: "vid".to_string(),
                position: 21.0,
            }
        );

        let paused_seek = state
            .apply_event(PlaybackEvent::Seek { position: Some(5.0) }, T0 + 2000)
            .unwrap();
        assert!(matches!(
            paused_seek.to_message(),
            ServerMessage::SeekApplied {
                reference_timestamp: None,
                ..
            }
        ));
    }

    #[test]
    fn test_late_joiner_init_is_extrapolated() {
        let state = playing_at(30.0, T0);
        match state.init_message(T0 + 5000) {
            ServerMessage::Init {
                video_id,
                is_playing,
                position,
                reference_timestamp,
            } => {
                assert_eq!(video_id.as_deref(), Some("vid"));
                assert!(is_playing);
                assert!((position - 35.0).abs() < 0.05);
                assert_eq!(reference_timestamp, T0 + 5000);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_snapshot_round_trip_through_state() {
        let snapshot = PlaybackSnapshot {
            video_id: "vid".to_string(),
            position: 42.0,
            is_playing: false,
        };
        let state = MasterPlaybackState::from_snapshot(&snapshot, T0);
        assert_eq!(state.snapshot(T0 + 60_000), Some(snapshot));
        assert_eq!(MasterPlaybackState::new().snapshot(T0), None);
    }
}
