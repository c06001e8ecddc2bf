//! Local scrobble cache.
//!
//! Holds the incremental Last.fm history plus everything the reconciler
//! needs to remember between runs: the ingest checkpoint, confirmed and
//! declined matches, the per-track decision ledger and run history.

pub mod db;
pub mod error;
pub mod schema;
pub mod types;

pub use db::{EventCache, SqliteEventCache};
pub use error::CacheError;
pub use types::{
    CacheSummary, CanonicalKey, LedgerEntry, LovedFlag, MatchConfidence, MatchMapping, RunStats,
    ScrobbleEvent,
};
