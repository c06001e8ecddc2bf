//! Last.fm listening-history source.

pub mod client;
pub mod error;
pub mod responses;

use async_trait::async_trait;

pub use client::{LastfmClient, LastfmSettings};
pub use error::LastfmError;

use crate::cache::ScrobbleEvent;

/// One page of `user.getRecentTracks`, newest first.
#[derive(Debug, Default)]
pub struct RecentPage {
    pub events: Vec<ScrobbleEvent>,
    pub total_pages: u32,
    /// Entries skipped because they could not be parsed.
    pub malformed: u64,
}

/// Remote scrobble history the cache is refreshed from.
#[async_trait]
pub trait ScrobbleSource: Send + Sync {
    /// Fetch page `page` (1-based) of plays strictly newer than `since`.
    async fn recent_page(&self, since: i64, page: u32) -> Result<RecentPage, LastfmError>;

    /// The full loved-tracks list as raw `(artist, title)` pairs.
    async fn loved_tracks(&self) -> Result<Vec<(String, String)>, LastfmError>;

    /// Mark a track as loved on the source. Needs write credentials.
    async fn love(&self, artist: &str, title: &str) -> Result<(), LastfmError>;

    fn can_love(&self) -> bool;
}
