//! Error types for fetches and profile handling.

use std::path::PathBuf;
use thiserror::Error;

/// A fetch could not complete. Contained at the entity boundary by the scheduler.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid gateway url: {0}")]
    InvalidUrl(String),

    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    #[error("websocket error: {0}")]
    Transport(String),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("connection closed before a reply arrived")]
    Closed,

    #[error("gateway returned an error: {0}")]
    Remote(String),

    #[error("malformed reply: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for SourceError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SourceError::Transport(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode profiles: {0}")]
    Encode(#[from] serde_json::Error),
}
