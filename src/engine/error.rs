use thiserror::Error;

use crate::cache::CacheError;
use crate::lastfm::LastfmError;
use crate::retry::Retryable;
use crate::target::TargetError;

use super::decision::DecisionError;

/// Failures that end a sync run.
///
/// Unresolved matches, policy downgrades and malformed records are not here:
/// they are logged, counted and reported without aborting.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Last.fm stayed unreachable or rate-limited through every retry.
    /// The checkpoint was not advanced.
    #[error("Last.fm unavailable after retries: {0}")]
    TransientFetch(LastfmError),

    #[error("Last.fm request failed: {0}")]
    Lastfm(LastfmError),

    /// Navidrome is running while database mode was requested.
    #[error("Navidrome appears to be running: {0}. Stop it before a database sync.")]
    LivenessConflict(String),

    #[error(transparent)]
    Target(TargetError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Decision(#[from] DecisionError),

    #[error("Sync interrupted")]
    Interrupted,

    #[error("Failed to write report {path}: {source}")]
    Report {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

impl From<LastfmError> for SyncError {
    fn from(e: LastfmError) -> Self {
        if e.is_retryable() {
            Self::TransientFetch(e)
        } else {
            Self::Lastfm(e)
        }
    }
}

impl From<TargetError> for SyncError {
    fn from(e: TargetError) -> Self {
        match e {
            TargetError::LivenessConflict(reason) => Self::LivenessConflict(reason),
            other => Self::Target(other),
        }
    }
}
