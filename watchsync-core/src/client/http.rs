//! HTTP client for the snapshot fallback surface

use std::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::{debug, instrument};

use crate::sync::PlaybackSnapshot;

use super::ClientError;

/// Default connection timeout
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(2);

/// Default request timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Reads and writes the room snapshot over `/api/state`
#[derive(Debug, Clone)]
pub struct SnapshotClient {
    http: Client,
    base_url: String,
}

impl SnapshotClient {
    /// `base_url` is the server root, e.g. `http://127.0.0.1:3000`
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let http = Client::builder()
            .connect_timeout(CONNECTION_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self) -> String {
        format!("{}/api/state", self.base_url)
    }

    /// Current room snapshot, `None` if no video was ever set
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    pub async fn fetch(&self) -> Result<Option<PlaybackSnapshot>, ClientError> {
        let resp = self.http.get(self.url()).send().await?;
        if !resp.status().is_success() {
            return Err(ClientError::Status(resp.status().as_u16()));
        }
        let body = resp.text().await?;
        debug!("Snapshot response: {}", body);
        parse_snapshot(&body)
    }

    /// Overwrite the room state; returns the state the server settled on
    #[instrument(skip(self, snapshot), fields(base_url = %self.base_url))]
    pub async fn publish(
        &self,
        snapshot: &PlaybackSnapshot,
    ) -> Result<PlaybackSnapshot, ClientError> {
        let resp = self.http.post(self.url()).json(snapshot).send().await?;
        match resp.status() {
            StatusCode::OK => Ok(resp.json().await?),
            StatusCode::BAD_REQUEST => Err(ClientError::Rejected(resp.text().await?)),
            status => Err(ClientError::Status(status.as_u16())),
        }
    }
}

/// The server answers `{}` until a video has been set
fn parse_snapshot(body: &str) -> Result<Option<PlaybackSnapshot>, ClientError> {
    let value: serde_json::Value = serde_json::from_str(body)?;
    if value.as_object().is_some_and(|o| o.is_empty()) {
        return Ok(None);
    }
    Ok(Some(serde_json::from_value(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_snapshot() {
        assert_eq!(parse_snapshot("{}").unwrap(), None);
    }

    #[test]
    fn test_parse_snapshot() {
        let snapshot =
            parse_snapshot(r#"{"videoId":"abc","position":3.5,"isPlaying":false}"#).unwrap();
        assert_eq!(
            snapshot,
            Some(PlaybackSnapshot {
                video_id: "abc".to_string(),
                position: 3.5,
                is_playing: false,
            })
        );
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(parse_snapshot("[1,2]"), Err(ClientError::Json(_))));
        assert!(matches!(parse_snapshot("nope"), Err(ClientError::Json(_))));
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let client = SnapshotClient::new("http://localhost:3000/").unwrap();
        assert_eq!(client.url(), "http://localhost:3000/api/state");
    }
}
