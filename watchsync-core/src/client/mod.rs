//! Sync Client
//!
//! Async driver that owns the server connection and the video player and
//! feeds both into the [`Reconciler`](crate::reconciler::Reconciler).

mod http;
mod session;

pub use http::SnapshotClient;
pub use session::*;

use thiserror::Error;

/// Errors that can occur when talking to the sync server
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Server rejected update: {0}")]
    Rejected(String),

    #[error("Unexpected response (HTTP {0})")]
    Status(u16),

    #[error("Client task closed")]
    Closed,
}
