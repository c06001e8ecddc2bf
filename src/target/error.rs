use std::path::PathBuf;

use thiserror::Error;

use crate::retry::Retryable;

#[derive(Debug, Error)]
pub enum TargetError {
    /// Navidrome is running (or its database is locked) in database mode.
    #[error("Navidrome appears to be running: {0}. Stop it before a database sync.")]
    LivenessConflict(String),

    #[error("Failed to open Navidrome database at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[error("Navidrome database query failed: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("No users found in the Navidrome user table")]
    NoUsers,

    #[error("Navidrome user '{0}' not found")]
    UnknownUser(String),

    #[error("Subsonic request {endpoint} failed: {source}")]
    Http {
        endpoint: &'static str,
        source: reqwest::Error,
    },

    #[error("Subsonic returned HTTP {status} for {endpoint}")]
    HttpStatus { endpoint: &'static str, status: u16 },

    #[error("Subsonic API error {code}: {message}")]
    Api { code: u32, message: String },

    #[error("Unexpected Subsonic response for {endpoint}: {detail}")]
    InvalidResponse {
        endpoint: &'static str,
        detail: String,
    },

    /// The API can only add plays; lowering a count is impossible.
    #[error("Cannot lower play count of {track_id} from {current} to {requested} through the API")]
    DecreaseUnsupported {
        track_id: String,
        current: u64,
        requested: u64,
    },

    #[error("Operator input failed: {0}")]
    Prompt(String),

    #[error("Failed to spawn blocking task: {0}")]
    Spawn(#[from] tokio::task::JoinError),
}

impl Retryable for TargetError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Http { source, .. } => source.is_timeout() || source.is_connect(),
            Self::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            // Subsonic 0 is "a generic error"; Navidrome uses it for transient
            // backend failures.
            Self::Api { code, .. } => *code == 0,
            _ => false,
        }
    }
}
