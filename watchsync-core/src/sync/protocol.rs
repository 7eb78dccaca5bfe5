//! Sync Protocol Messages
//!
//! JSON text frames exchanged over the persistent connection. Every frame is
//! an object tagged by `"type"` with camelCase fields.

use serde::{Deserialize, Serialize};

/// Messages sent by a viewer to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Ask for a point-in-time snapshot of the room (sent on every connect)
    RequestInit,

    /// Start or resume playback. `video_id` may be omitted to resume the
    /// current video.
    Play {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        video_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<f64>,
    },

    /// Pause at whatever position the server extrapolates
    Pause {},

    /// Jump to a new position, keeping the current play/pause state
    Seek {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<f64>,
    },

    /// Clock offset ping, answered with [`ServerMessage::Pong`]
    Ping { sent_at_ms: u64 },
}

/// Messages sent by the server to viewers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Full room state for a (re)connecting viewer. `position` is already
    /// extrapolated to `reference_timestamp`.
    Init {
        video_id: Option<String>,
        is_playing: bool,
        position: f64,
        reference_timestamp: u64,
    },

    /// Someone else started playback
    PlayApplied {
        video_id: String,
        position: f64,
        reference_timestamp: u64,
    },

    /// Someone else paused
    PauseApplied { video_id: String, position: f64 },

    /// Someone else seeked. The timestamp is only present while playing.
    SeekApplied {
        video_id: String,
        position: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reference_timestamp: Option<u64>,
    },

    /// Reply to [`ClientMessage::Ping`]
    Pong { ping_sent_at_ms: u64, server_time_ms: u64 },
}

impl ServerMessage {
    /// Video the message refers to, if any
    pub fn video_id(&self) -> Option<&str> {
        match self {
            ServerMessage::Init { video_id, .. } => video_id.as_deref(),
            ServerMessage::PlayApplied { video_id, .. }
            | ServerMessage::PauseApplied { video_id, .. }
            | ServerMessage::SeekApplied { video_id, .. } => Some(video_id),
            ServerMessage::Pong { .. } => None,
        }
    }
}

/// Kind of a playback mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Play,
    Pause,
    Seek,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Play => "play",
            EventKind::Pause => "pause",
            EventKind::Seek => "seek",
        }
    }
}

/// A playback mutation as received from a viewer, before validation
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    Play {
        video_id: Option<String>,
        position: Option<f64>,
    },
    Pause,
    Seek { position: Option<f64> },
}

impl PlaybackEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PlaybackEvent::Play { .. } => EventKind::Play,
            PlaybackEvent::Pause => EventKind::Pause,
            PlaybackEvent::Seek { .. } => EventKind::Seek,
        }
    }
}

impl ClientMessage {
    /// Split off the playback mutations; control messages return `None`
    pub fn into_playback_event(self) -> Option<PlaybackEvent> {
        match self {
            ClientMessage::Play { video_id, position } => {
                Some(PlaybackEvent::Play { video_id, position })
            }
            ClientMessage::Pause {} => Some(PlaybackEvent::Pause),
            ClientMessage::Seek { position } => Some(PlaybackEvent::Seek { position }),
            ClientMessage::RequestInit | ClientMessage::Ping { .. } => None,
        }
    }
}

/// Durable/HTTP view of the room: `{videoId, position, isPlaying}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackSnapshot {
    pub video_id: String,
    /// Seconds, never negative
    pub position: f64,
    pub is_playing: bool,
}
