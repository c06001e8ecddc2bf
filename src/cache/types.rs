//! Records stored in the scrobble cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One play reported by Last.fm.
///
/// Uniqueness in the cache is `(artist, title, timestamp)`; re-fetching the
/// same play is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrobbleEvent {
    pub artist: String,
    pub title: String,
    pub album: String,
    /// Epoch seconds.
    pub timestamp: i64,
    /// Opaque identifier from the source (MusicBrainz id when available).
    pub source_id: String,
}

impl ScrobbleEvent {
    pub fn new(artist: impl Into<String>, title: impl Into<String>, timestamp: i64) -> Self {
        Self {
            artist: artist.into(),
            title: title.into(),
            album: String::new(),
            timestamp,
            source_id: String::new(),
        }
    }

    pub fn with_album(mut self, album: impl Into<String>) -> Self {
        self.album = album.into();
        self
    }

    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = source_id.into();
        self
    }
}

/// Loved state of a raw (artist, title) pair as last reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LovedFlag {
    pub artist: String,
    pub title: String,
    pub loved: bool,
    pub updated_at: i64,
}

/// Normalized `(artist, title)` join key between Last.fm and Navidrome.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalKey {
    pub artist: String,
    pub title: String,
}

impl CanonicalKey {
    pub fn new(artist: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            artist: artist.into(),
            title: title.into(),
        }
    }
}

impl std::fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} || {}", self.artist, self.title)
    }
}

/// How a mapping was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchConfidence {
    Exact,
    FuzzyConfirmed,
}

impl MatchConfidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::FuzzyConfirmed => "fuzzy_confirmed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "exact" => Some(Self::Exact),
            "fuzzy_confirmed" | "fuzzy" => Some(Self::FuzzyConfirmed),
            _ => None,
        }
    }
}

/// Persisted binding from a canonical key to a Navidrome track id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchMapping {
    pub key: CanonicalKey,
    pub target_track_id: String,
    pub confidence: MatchConfidence,
}

/// Last count decision taken for a canonical key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub target_track_id: String,
    /// Source play count the decision was based on.
    pub source_count: u64,
    /// Navidrome play count right after the decision.
    pub target_count: u64,
}

/// Outcome counters for a single sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub applied: u64,
    pub skipped: u64,
    pub missing: u64,
    pub interrupted: bool,
}

/// Snapshot of cache contents for `status`.
#[derive(Debug, Clone)]
pub struct CacheSummary {
    pub total_events: u64,
    pub loved_tracks: u64,
    pub mappings: u64,
    pub fuzzy_mappings: u64,
    pub declined: u64,
    pub checkpoint: i64,
    pub oldest_event: Option<DateTime<Utc>>,
    pub newest_event: Option<DateTime<Utc>>,
    pub last_sync_started: Option<DateTime<Utc>>,
    pub last_sync_completed: Option<DateTime<Utc>>,
    pub last_run: Option<RunStats>,
}
