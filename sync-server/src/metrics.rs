//! Metrics tracking for the sync server

use chrono::{DateTime, Local};
use std::collections::VecDeque;

use watchsync_core::sync::{EventKind, PlaybackSnapshot};

use crate::registry::ConnectionId;

/// Maximum number of log entries to keep
const MAX_LOG_ENTRIES: usize = 100;

/// A log entry for the dashboard
#[derive(Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Connection,
    Event,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Connection => "CONN",
            LogLevel::Event => "EVENT",
        }
    }
}

/// Server metrics
pub struct Metrics {
    /// Server start time
    pub start_time: DateTime<Local>,

    /// Address the HTTP/WebSocket listener is bound to
    pub bind_addr: Option<String>,

    /// Where snapshots are persisted, `None` when memory-only
    pub snapshot_path: Option<String>,

    /// Current number of connected sessions
    pub connected_sessions: usize,

    /// Total connections since start
    pub total_connections: u64,

    /// Peak simultaneous connections
    pub peak_connections: usize,

    /// Connected sessions (for display)
    pub session_list: Vec<SessionInfo>,

    /// Applied events by kind
    pub plays_applied: u64,
    pub pauses_applied: u64,
    pub seeks_applied: u64,

    /// Events dropped by validation
    pub events_rejected: u64,

    /// Individual messages handed to sessions by fan-out
    pub messages_broadcast: u64,

    pub saves_ok: u64,
    pub saves_failed: u64,

    /// Last state the room settled on
    pub room: Option<PlaybackSnapshot>,

    /// Log entries
    pub logs: VecDeque<LogEntry>,

    /// Server status
    pub status: ServerStatus,
}

#[derive(Clone)]
pub struct SessionInfo {
    pub id: ConnectionId,
    pub remote: Option<String>,
    pub connected_at: DateTime<Local>,
    pub events_sent: u64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ServerStatus {
    Starting,
    Running,
    Error,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Local::now(),
            bind_addr: None,
            snapshot_path: None,
            connected_sessions: 0,
            total_connections: 0,
            peak_connections: 0,
            session_list: Vec::new(),
            plays_applied: 0,
            pauses_applied: 0,
            seeks_applied: 0,
            events_rejected: 0,
            messages_broadcast: 0,
            saves_ok: 0,
            saves_failed: 0,
            room: None,
            logs: VecDeque::with_capacity(MAX_LOG_ENTRIES),
            status: ServerStatus::Starting,
        }
    }

    /// Add a log entry
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        if self.logs.len() >= MAX_LOG_ENTRIES {
            self.logs.pop_front();
        }
        self.logs.push_back(LogEntry {
            timestamp: Local::now(),
            level,
            message: message.into(),
        });
    }

    /// Record a new session
    pub fn session_opened(&mut self, id: ConnectionId, remote: Option<String>) {
        if self.session_list.iter().any(|s| s.id == id) {
            return;
        }

        self.connected_sessions += 1;
        self.total_connections += 1;
        if self.connected_sessions > self.peak_connections {
            self.peak_connections = self.connected_sessions;
        }

        let label = match &remote {
            Some(addr) => format!("Connected: #{} ({})", id, addr),
            None => format!("Connected: #{}", id),
        };
        self.session_list.push(SessionInfo {
            id,
            remote,
            connected_at: Local::now(),
            events_sent: 0,
        });
        self.log(LogLevel::Connection, label);
    }

    /// Record a disconnection (only if the session was tracked)
    pub fn session_closed(&mut self, id: ConnectionId) {
        if !self.session_list.iter().any(|s| s.id == id) {
            return;
        }

        self.connected_sessions = self.connected_sessions.saturating_sub(1);
        self.session_list.retain(|s| s.id != id);
        self.log(LogLevel::Connection, format!("Disconnected: #{}", id));
    }

    /// Record a successfully applied event; `origin` is `None` for HTTP
    pub fn event_applied(
        &mut self,
        origin: Option<ConnectionId>,
        kind: EventKind,
        room: PlaybackSnapshot,
    ) {
        match kind {
            EventKind::Play => self.plays_applied += 1,
            EventKind::Pause => self.pauses_applied += 1,
            EventKind::Seek => self.seeks_applied += 1,
        }

        let source = match origin {
            Some(id) => {
                if let Some(session) = self.session_list.iter_mut().find(|s| s.id == id) {
                    session.events_sent += 1;
                }
                format!("#{}", id)
            }
            None => "http".to_string(),
        };
        self.log(
            LogLevel::Event,
            format!(
                "{} {} {} @ {:.1}s",
                source,
                kind.as_str(),
                truncate_video_id(&room.video_id),
                room.position
            ),
        );
        self.room = Some(room);
    }

    pub fn event_rejected(&mut self, origin: Option<ConnectionId>, reason: &str) {
        self.events_rejected += 1;
        let source = origin
            .map(|id| format!("#{}", id))
            .unwrap_or_else(|| "http".to_string());
        self.log(LogLevel::Warning, format!("Rejected from {}: {}", source, reason));
    }

    pub fn broadcast_delivered(&mut self, recipients: usize) {
        self.messages_broadcast += recipients as u64;
    }

    pub fn save_succeeded(&mut self) {
        self.saves_ok += 1;
    }

    pub fn save_failed(&mut self, error: &str) {
        self.saves_failed += 1;
        self.log(LogLevel::Error, format!("Snapshot save failed: {}", error));
    }

    pub fn total_events(&self) -> u64 {
        self.plays_applied + self.pauses_applied + self.seeks_applied
    }

    /// Get uptime as formatted string
    pub fn uptime(&self) -> String {
        let duration = Local::now().signed_duration_since(self.start_time);
        let secs = duration.num_seconds();

        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m {}s", secs / 60, secs % 60)
        } else {
            let hours = secs / 3600;
            let mins = (secs % 3600) / 60;
            format!("{}h {}m", hours, mins)
        }
    }
}

/// Shorten long video IDs for display
pub fn truncate_video_id(video_id: &str) -> String {
    if video_id.chars().count() > 16 {
        let head: String = video_id.chars().take(12).collect();
        format!("{}...", head)
    } else {
        video_id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(position: f64) -> PlaybackSnapshot {
        PlaybackSnapshot {
            video_id: "vid".to_string(),
            position,
            is_playing: true,
        }
    }

    #[test]
    fn test_session_counters() {
        let mut m = Metrics::new();
        m.session_opened(1, Some("127.0.0.1:50000".to_string()));
        m.session_opened(2, None);
        m.session_opened(2, None);
        assert_eq!(m.connected_sessions, 2);
        assert_eq!(m.total_connections, 2);

        m.session_closed(1);
        m.session_closed(1);
        assert_eq!(m.connected_sessions, 1);
        assert_eq!(m.peak_connections, 2);
        assert_eq!(m.session_list.len(), 1);
    }

    #[test]
    fn test_event_counters() {
        let mut m = Metrics::new();
        m.session_opened(7, None);
        m.event_applied(Some(7), EventKind::Play, room(0.0));
        m.event_applied(Some(7), EventKind::Seek, room(40.0));
        m.event_applied(None, EventKind::Pause, room(41.0));
        m.event_rejected(Some(7), "seek event is missing a position");

        assert_eq!(m.total_events(), 3);
        assert_eq!(m.events_rejected, 1);
        assert_eq!(m.session_list[0].events_sent, 2);
        assert_eq!(m.room.as_ref().map(|r| r.position), Some(41.0));
    }

    #[test]
    fn test_log_ring_buffer_is_bounded() {
        let mut m = Metrics::new();
        for i in 0..(MAX_LOG_ENTRIES + 10) {
            m.log(LogLevel::Info, format!("line {}", i));
        }
        assert_eq!(m.logs.len(), MAX_LOG_ENTRIES);
        assert_eq!(m.logs.front().map(|l| l.message.as_str()), Some("line 10"));
    }

    #[test]
    fn test_truncate_video_id() {
        assert_eq!(truncate_video_id("dQw4w9WgXcQ"), "dQw4w9WgXcQ");
        assert_eq!(
            truncate_video_id("a-very-long-video-identifier"),
            "a-very-long-..."
        );
    }
}
