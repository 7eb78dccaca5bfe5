//! Snapshot persistence
//!
//! Best-effort durable storage of the room's playback snapshot. The server
//! loads it once at startup and saves after every mutation; a failing store
//! never takes the room down.

use std::fs;
use std::io;
use std::path::PathBuf;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::sync::PlaybackSnapshot;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Corrupt snapshot: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Load/save interface to whatever holds the durable snapshot
pub trait PersistenceGateway: Send + Sync {
    /// `Ok(None)` means nothing has been saved yet
    fn load_snapshot(&self) -> Result<Option<PlaybackSnapshot>, PersistenceError>;

    fn save_snapshot(&self, snapshot: &PlaybackSnapshot) -> Result<(), PersistenceError>;
}

/// Stores the snapshot as a single JSON document on disk
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "snapshot".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_err(&self, source: io::Error) -> PersistenceError {
        PersistenceError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl PersistenceGateway for JsonFileStore {
    fn load_snapshot(&self) -> Result<Option<PlaybackSnapshot>, PersistenceError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No snapshot at {}", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(self.io_err(e)),
        };
        let snapshot: PlaybackSnapshot = serde_json::from_slice(&bytes)?;
        info!(
            "Loaded snapshot from {}: {} @ {:.1}s",
            self.path.display(),
            snapshot.video_id,
            snapshot.position
        );
        Ok(Some(snapshot))
    }

    fn save_snapshot(&self, snapshot: &PlaybackSnapshot) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;

        // Ensure parent directory exists
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }

        // Write then rename so a crash never leaves a half-written file
        let tmp = self.tmp_path();
        fs::write(&tmp, bytes).map_err(|e| self.io_err(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))?;
        Ok(())
    }
}

/// Keeps the snapshot in memory only
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: Mutex<Option<PlaybackSnapshot>>,
    failing: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose every call fails, for exercising degraded paths
    pub fn failing() -> Self {
        Self {
            snapshot: Mutex::new(None),
            failing: true,
        }
    }

    pub fn current(&self) -> Option<PlaybackSnapshot> {
        self.snapshot.lock().clone()
    }
}

impl PersistenceGateway for MemoryStore {
    fn load_snapshot(&self) -> Result<Option<PlaybackSnapshot>, PersistenceError> {
        if self.failing {
            return Err(PersistenceError::Unavailable("memory store set to fail".into()));
        }
        Ok(self.snapshot.lock().clone())
    }

    fn save_snapshot(&self, snapshot: &PlaybackSnapshot) -> Result<(), PersistenceError> {
        if self.failing {
            return Err(PersistenceError::Unavailable("memory store set to fail".into()));
        }
        *self.snapshot.lock() = Some(snapshot.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PlaybackSnapshot {
        PlaybackSnapshot {
            video_id: "M7lc1UVf-VE".to_string(),
            position: 73.25,
            is_playing: true,
        }
    }

    #[test]
    fn test_json_store_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("state").join("playback.json"));

        assert!(store.load_snapshot().unwrap().is_none());

        store.save_snapshot(&sample()).unwrap();
        assert_eq!(store.load_snapshot().unwrap(), Some(sample()));
        assert!(!store.tmp_path().exists());

        let paused = PlaybackSnapshot {
            is_playing: false,
            ..sample()
        };
        store.save_snapshot(&paused).unwrap();
        assert_eq!(store.load_snapshot().unwrap(), Some(paused));
    }

    #[test]
    fn test_json_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("playback.json");
        fs::write(&path, b"{not json").unwrap();

        let store = JsonFileStore::new(&path);
        assert!(matches!(
            store.load_snapshot(),
            Err(PersistenceError::Corrupt(_))
        ));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert!(store.load_snapshot().unwrap().is_none());
        store.save_snapshot(&sample()).unwrap();
        assert_eq!(store.load_snapshot().unwrap(), Some(sample()));

        let failing = MemoryStore::failing();
        assert!(failing.load_snapshot().is_err());
        assert!(failing.save_snapshot(&sample()).is_err());
    }
}
