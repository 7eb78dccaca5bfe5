//! watchsync - Core Library
//!
//! Keeps a shared video in lock-step across viewers: the authoritative
//! playback timeline and its wire protocol, the client-side reconciler that
//! turns stale network messages into accurate local positions, and the
//! connection driver that ties a player to the sync server.

pub mod client;
pub mod latency;
pub mod persistence;
pub mod player;
pub mod reconciler;
pub mod sync;

// Re-exports for convenience
pub use client::{ClientConfig, ClientHandle, SyncClient};
pub use player::{SimulatedPlayer, VideoPlayer};
pub use reconciler::{Reconciler, ReconcilerConfig};
pub use sync::{ClientMessage, MasterPlaybackState, PlaybackSnapshot, ServerMessage};
