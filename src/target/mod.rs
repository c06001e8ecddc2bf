//! Navidrome access.
//!
//! Two interchangeable adapters sit behind [`TargetAdapter`]: direct writes
//! to the Navidrome SQLite database while the server is stopped, and the
//! Subsonic REST API while it is running. The reconciler is written once
//! against the trait and asks [`TargetAdapter::supports_decrease`] before
//! lowering a count.

pub mod error;
pub mod store;
pub mod subsonic;

use async_trait::async_trait;

pub use error::TargetError;
pub use store::NavidromeStore;
pub use subsonic::SubsonicClient;

use crate::types::AccessMode;

/// Snapshot of one Navidrome track for the configured user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetTrackState {
    pub id: String,
    pub artist: String,
    pub title: String,
    pub album: String,
    pub play_count: u64,
    pub starred: bool,
    /// Epoch seconds of the last recorded play, if any.
    pub play_date: Option<i64>,
}

/// A Navidrome account, for user selection in database mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUser {
    pub id: String,
    pub user_name: String,
}

#[async_trait]
pub trait TargetAdapter: Send + Sync {
    fn mode(&self) -> AccessMode;

    /// Whether counts can be lowered or overwritten below the current value.
    fn supports_decrease(&self) -> bool;

    /// Current state of a track, `None` if it no longer exists.
    async fn read_state(&self, track_id: &str) -> Result<Option<TargetTrackState>, TargetError>;

    /// Candidate tracks for a Last.fm `(artist, title)`. May over-approximate;
    /// the matcher does the final comparison.
    async fn search(&self, artist: &str, title: &str)
        -> Result<Vec<TargetTrackState>, TargetError>;

    /// Bring the play count of `track` to `new_count`. `timestamps` are the
    /// Last.fm plays, ascending, used for play dates or scrobble submission.
    /// Returns the count the track actually reached, which is lower than
    /// `new_count` when only some plays were accepted.
    async fn apply_count(
        &self,
        track: &TargetTrackState,
        new_count: u64,
        timestamps: &[i64],
    ) -> Result<u64, TargetError>;

    /// Star a track. Tracks are never unstarred.
    async fn apply_star(&self, track_id: &str) -> Result<(), TargetError>;

    /// Flush derived state once all tracks are applied.
    async fn finish(&self) -> Result<(), TargetError>;
}
