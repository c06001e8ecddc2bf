//! Scrobble cache trait and SQLite implementation.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};

use super::error::CacheError;
use super::schema;
use super::types::{
    CacheSummary, CanonicalKey, LedgerEntry, LovedFlag, MatchConfidence, MatchMapping, RunStats,
    ScrobbleEvent,
};

const CHECKPOINT_KEY: &str = "checkpoint";
const LAST_SYNC_KEY: &str = "last_sync_time";

/// Durable store of Last.fm history and reconciliation bookkeeping.
///
/// Object-safe so the engine can hold an `Arc<dyn EventCache>`.
#[async_trait]
pub trait EventCache: Send + Sync {
    /// Insert events in one transaction, ignoring `(artist, title, timestamp)`
    /// duplicates. Returns the number of rows actually added.
    async fn insert_events(&self, events: &[ScrobbleEvent]) -> Result<u64, CacheError>;

    /// Every cached event, oldest first.
    async fn get_all_events(&self) -> Result<Vec<ScrobbleEvent>, CacheError>;

    async fn latest_event_timestamp(&self) -> Result<Option<i64>, CacheError>;

    async fn set_loved(&self, artist: &str, title: &str, loved: bool) -> Result<(), CacheError>;

    /// Apply a fresh snapshot of the source's loved list: listed tracks become
    /// loved, previously loved tracks missing from it become unloved.
    async fn replace_loved(&self, loved: &[(String, String)]) -> Result<(), CacheError>;

    /// Loved state keyed by the raw `(artist, title)` pair.
    async fn get_loved_map(&self) -> Result<HashMap<(String, String), bool>, CacheError>;

    async fn get_loved(&self) -> Result<Vec<LovedFlag>, CacheError>;

    /// Epoch seconds of the newest fully-ingested event, 0 when never synced.
    async fn checkpoint(&self) -> Result<i64, CacheError>;

    /// Move the checkpoint forward. A smaller value is ignored.
    async fn advance_checkpoint(&self, timestamp: i64) -> Result<(), CacheError>;

    async fn reset_checkpoint(&self) -> Result<(), CacheError>;

    async fn get_mapping(&self, key: &CanonicalKey) -> Result<Option<MatchMapping>, CacheError>;

    async fn save_mapping(&self, mapping: &MatchMapping) -> Result<(), CacheError>;

    async fn remove_mapping(&self, key: &CanonicalKey) -> Result<(), CacheError>;

    /// Candidate ids the operator already turned down for `key`.
    async fn get_declined(&self, key: &CanonicalKey) -> Result<Option<BTreeSet<String>>, CacheError>;

    async fn save_declined(
        &self,
        key: &CanonicalKey,
        candidate_ids: &BTreeSet<String>,
    ) -> Result<(), CacheError>;

    async fn clear_declined(&self, key: &CanonicalKey) -> Result<(), CacheError>;

    async fn get_ledger(&self, key: &CanonicalKey) -> Result<Option<LedgerEntry>, CacheError>;

    async fn save_ledger(&self, key: &CanonicalKey, entry: &LedgerEntry) -> Result<(), CacheError>;

    async fn start_sync_run(&self) -> Result<i64, CacheError>;

    async fn complete_sync_run(&self, run_id: i64, stats: &RunStats) -> Result<(), CacheError>;

    async fn get_summary(&self) -> Result<CacheSummary, CacheError>;
}

/// SQLite-backed [`EventCache`].
pub struct SqliteEventCache {
    /// rusqlite::Connection is not Sync.
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl std::fmt::Debug for SqliteEventCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteEventCache")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteEventCache {
    /// Open or create the cache, creating parent directories as needed.
    pub async fn open(path: &Path) -> Result<Self, CacheError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            if let Some(parent) = path_clone.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        CacheError::Query(format!(
                            "cannot create cache directory {}: {}",
                            parent.display(),
                            e
                        ))
                    })?;
                }
            }

            let conn = Connection::open(&path_clone).map_err(|e| CacheError::Open {
                path: path_clone.clone(),
                source: e,
            })?;

            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(CacheError::Migration)?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(CacheError::Migration)?;

            schema::migrate(&conn)?;

            Ok::<_, CacheError>(conn)
        })
        .await??;

        tracing::debug!(path = %path.display(), "Opened scrobble cache");

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory().map_err(|e| CacheError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, CacheError> {
        self.conn
            .lock()
            .map_err(|e| CacheError::Query(e.to_string()))
    }
}

fn get_metadata(conn: &Connection, key: &str) -> Result<Option<String>, CacheError> {
    conn.query_row(
        "SELECT value FROM sync_metadata WHERE key = ?1",
        [key],
        |row| row.get(0),
    )
    .optional()
    .map_err(CacheError::query)
}

fn set_metadata(conn: &Connection, key: &str, value: &str) -> Result<(), CacheError> {
    conn.execute(
        "INSERT INTO sync_metadata (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [key, value],
    )
    .map_err(CacheError::query)?;
    Ok(())
}

fn count(conn: &Connection, sql: &str) -> Result<u64, CacheError> {
    conn.query_row(sql, [], |row| row.get::<_, i64>(0))
        .map(|n| n.max(0) as u64)
        .map_err(CacheError::query)
}

fn to_datetime(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.and_then(|ts| Utc.timestamp_opt(ts, 0).single())
}

/// Run `body` inside `BEGIN`/`COMMIT`, rolling back on error.
fn in_transaction<T>(
    conn: &Connection,
    body: impl FnOnce() -> Result<T, CacheError>,
) -> Result<T, CacheError> {
    conn.execute_batch("BEGIN TRANSACTION")
        .map_err(CacheError::query)?;
    match body() {
        Ok(value) => {
            conn.execute_batch("COMMIT").map_err(CacheError::query)?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

#[async_trait]
impl EventCache for SqliteEventCache {
    async fn insert_events(&self, events: &[ScrobbleEvent]) -> Result<u64, CacheError> {
        if events.is_empty() {
            return Ok(0);
        }

        let conn = self.lock()?;
        in_transaction(&conn, || {
            let mut stmt = conn
                .prepare_cached(
                    "INSERT OR IGNORE INTO scrobbles (artist, title, album, timestamp, source_id)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .map_err(CacheError::query)?;

            let mut added = 0u64;
            for event in events {
                added += stmt
                    .execute(rusqlite::params![
                        event.artist,
                        event.title,
                        event.album,
                        event.timestamp,
                        event.source_id,
                    ])
                    .map_err(CacheError::query)? as u64;
            }
            Ok(added)
        })
    }

    async fn get_all_events(&self) -> Result<Vec<ScrobbleEvent>, CacheError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT artist, title, album, timestamp, source_id FROM scrobbles
                 ORDER BY timestamp ASC, id ASC",
            )
            .map_err(CacheError::query)?;

        let events = stmt
            .query_map([], |row| {
                Ok(ScrobbleEvent {
                    artist: row.get(0)?,
                    title: row.get(1)?,
                    album: row.get(2)?,
                    timestamp: row.get(3)?,
                    source_id: row.get(4)?,
                })
            })
            .map_err(CacheError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(CacheError::query)?;

        Ok(events)
    }

    async fn latest_event_timestamp(&self) -> Result<Option<i64>, CacheError> {
        let conn = self.lock()?;
        conn.query_row("SELECT MAX(timestamp) FROM scrobbles", [], |row| row.get(0))
            .map_err(CacheError::query)
    }

    async fn set_loved(&self, artist: &str, title: &str, loved: bool) -> Result<(), CacheError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO loved_tracks (artist, title, loved, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(artist, title) DO UPDATE SET
                loved = excluded.loved,
                updated_at = excluded.updated_at",
            rusqlite::params![artist, title, loved as i64, Utc::now().timestamp()],
        )
        .map_err(CacheError::query)?;
        Ok(())
    }

    async fn replace_loved(&self, loved: &[(String, String)]) -> Result<(), CacheError> {
        let now = Utc::now().timestamp();
        let conn = self.lock()?;
        in_transaction(&conn, || {
            conn.execute(
                "UPDATE loved_tracks SET loved = 0, updated_at = ?1 WHERE loved = 1",
                [now],
            )
            .map_err(CacheError::query)?;
            let mut stmt = conn
                .prepare_cached(
                    "INSERT INTO loved_tracks (artist, title, loved, updated_at)
                     VALUES (?1, ?2, 1, ?3)
                     ON CONFLICT(artist, title) DO UPDATE SET
                        loved = 1,
                        updated_at = excluded.updated_at",
                )
                .map_err(CacheError::query)?;
            for (artist, title) in loved {
                stmt.execute(rusqlite::params![artist, title, now])
                    .map_err(CacheError::query)?;
            }
            Ok(())
        })
    }

    async fn get_loved_map(&self) -> Result<HashMap<(String, String), bool>, CacheError> {
        Ok(self
            .get_loved()
            .await?
            .into_iter()
            .map(|f| ((f.artist, f.title), f.loved))
            .collect())
    }

    async fn get_loved(&self) -> Result<Vec<LovedFlag>, CacheError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT artist, title, loved, updated_at FROM loved_tracks")
            .map_err(CacheError::query)?;
        let flags = stmt
            .query_map([], |row| {
                Ok(LovedFlag {
                    artist: row.get(0)?,
                    title: row.get(1)?,
                    loved: row.get::<_, i64>(2)? != 0,
                    updated_at: row.get(3)?,
                })
            })
            .map_err(CacheError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(CacheError::query)?;
        Ok(flags)
    }

    async fn checkpoint(&self) -> Result<i64, CacheError> {
        let conn = self.lock()?;
        Ok(get_metadata(&conn, CHECKPOINT_KEY)?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0))
    }

    async fn advance_checkpoint(&self, timestamp: i64) -> Result<(), CacheError> {
        let conn = self.lock()?;
        let current = get_metadata(&conn, CHECKPOINT_KEY)?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        if timestamp <= current {
            tracing::debug!(current, requested = timestamp, "Checkpoint not advanced");
            return Ok(());
        }
        in_transaction(&conn, || {
            set_metadata(&conn, CHECKPOINT_KEY, &timestamp.to_string())?;
            set_metadata(&conn, LAST_SYNC_KEY, &Utc::now().timestamp().to_string())
        })
    }

    async fn reset_checkpoint(&self) -> Result<(), CacheError> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM sync_metadata WHERE key IN (?1, ?2)",
            [CHECKPOINT_KEY, LAST_SYNC_KEY],
        )
        .map_err(CacheError::query)?;
        Ok(())
    }

    async fn get_mapping(&self, key: &CanonicalKey) -> Result<Option<MatchMapping>, CacheError> {
        let conn = self.lock()?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT target_track_id, confidence FROM match_mappings
                 WHERE artist_key = ?1 AND title_key = ?2",
                [&key.artist, &key.title],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(CacheError::query)?;

        Ok(row.map(|(target_track_id, confidence)| MatchMapping {
            key: key.clone(),
            target_track_id,
            confidence: MatchConfidence::from_str(&confidence).unwrap_or(MatchConfidence::Exact),
        }))
    }

    async fn save_mapping(&self, mapping: &MatchMapping) -> Result<(), CacheError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO match_mappings (artist_key, title_key, target_track_id, confidence, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(artist_key, title_key) DO UPDATE SET
                target_track_id = excluded.target_track_id,
                confidence = excluded.confidence,
                created_at = excluded.created_at",
            rusqlite::params![
                mapping.key.artist,
                mapping.key.title,
                mapping.target_track_id,
                mapping.confidence.as_str(),
                Utc::now().timestamp(),
            ],
        )
        .map_err(CacheError::query)?;
        Ok(())
    }

    async fn remove_mapping(&self, key: &CanonicalKey) -> Result<(), CacheError> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM match_mappings WHERE artist_key = ?1 AND title_key = ?2",
            [&key.artist, &key.title],
        )
        .map_err(CacheError::query)?;
        Ok(())
    }

    async fn get_declined(&self, key: &CanonicalKey) -> Result<Option<BTreeSet<String>>, CacheError> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT candidate_ids FROM match_declined WHERE artist_key = ?1 AND title_key = ?2",
                [&key.artist, &key.title],
                |row| row.get(0),
            )
            .optional()
            .map_err(CacheError::query)?;

        match raw {
            None => Ok(None),
            Some(json) => match serde_json::from_str::<BTreeSet<String>>(&json) {
                Ok(ids) => Ok(Some(ids)),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Unreadable declined-match memo, ignoring");
                    Ok(None)
                }
            },
        }
    }

    async fn save_declined(
        &self,
        key: &CanonicalKey,
        candidate_ids: &BTreeSet<String>,
    ) -> Result<(), CacheError> {
        let json = serde_json::to_string(candidate_ids)
            .map_err(|e| CacheError::Query(e.to_string()))?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO match_declined (artist_key, title_key, candidate_ids, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(artist_key, title_key) DO UPDATE SET
                candidate_ids = excluded.candidate_ids,
                updated_at = excluded.updated_at",
            rusqlite::params![key.artist, key.title, json, Utc::now().timestamp()],
        )
        .map_err(CacheError::query)?;
        Ok(())
    }

    async fn clear_declined(&self, key: &CanonicalKey) -> Result<(), CacheError> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM match_declined WHERE artist_key = ?1 AND title_key = ?2",
            [&key.artist, &key.title],
        )
        .map_err(CacheError::query)?;
        Ok(())
    }

    async fn get_ledger(&self, key: &CanonicalKey) -> Result<Option<LedgerEntry>, CacheError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT target_track_id, source_count, target_count FROM reconciled
             WHERE artist_key = ?1 AND title_key = ?2",
            [&key.artist, &key.title],
            |row| {
                Ok(LedgerEntry {
                    target_track_id: row.get(0)?,
                    source_count: row.get::<_, i64>(1)?.max(0) as u64,
                    target_count: row.get::<_, i64>(2)?.max(0) as u64,
                })
            },
        )
        .optional()
        .map_err(CacheError::query)
    }

    async fn save_ledger(&self, key: &CanonicalKey, entry: &LedgerEntry) -> Result<(), CacheError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO reconciled (artist_key, title_key, target_track_id, source_count, target_count, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(artist_key, title_key) DO UPDATE SET
                target_track_id = excluded.target_track_id,
                source_count = excluded.source_count,
                target_count = excluded.target_count,
                updated_at = excluded.updated_at",
            rusqlite::params![
                key.artist,
                key.title,
                entry.target_track_id,
                entry.source_count as i64,
                entry.target_count as i64,
                Utc::now().timestamp(),
            ],
        )
        .map_err(CacheError::query)?;
        Ok(())
    }

    async fn start_sync_run(&self) -> Result<i64, CacheError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sync_runs (started_at) VALUES (?1)",
            [Utc::now().timestamp()],
        )
        .map_err(CacheError::query)?;
        Ok(conn.last_insert_rowid())
    }

    async fn complete_sync_run(&self, run_id: i64, stats: &RunStats) -> Result<(), CacheError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE sync_runs SET completed_at = ?1, applied = ?2, skipped = ?3, missing = ?4, interrupted = ?5
             WHERE id = ?6",
            rusqlite::params![
                Utc::now().timestamp(),
                stats.applied as i64,
                stats.skipped as i64,
                stats.missing as i64,
                stats.interrupted as i64,
                run_id,
            ],
        )
        .map_err(CacheError::query)?;
        Ok(())
    }

    async fn get_summary(&self) -> Result<CacheSummary, CacheError> {
        let conn = self.lock()?;

        let total_events = count(&conn, "SELECT COUNT(*) FROM scrobbles")?;
        let loved_tracks = count(&conn, "SELECT COUNT(*) FROM loved_tracks WHERE loved = 1")?;
        let mappings = count(&conn, "SELECT COUNT(*) FROM match_mappings")?;
        let fuzzy_mappings = count(
            &conn,
            "SELECT COUNT(*) FROM match_mappings WHERE confidence = 'fuzzy_confirmed'",
        )?;
        let declined = count(&conn, "SELECT COUNT(*) FROM match_declined")?;
        let checkpoint = get_metadata(&conn, CHECKPOINT_KEY)?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);

        let (oldest, newest): (Option<i64>, Option<i64>) = conn
            .query_row(
                "SELECT MIN(timestamp), MAX(timestamp) FROM scrobbles",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(CacheError::query)?;

        let last_run: Option<(Option<i64>, Option<i64>, i64, i64, i64, i64)> = conn
            .query_row(
                "SELECT started_at, completed_at, applied, skipped, missing, interrupted
                 FROM sync_runs ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                        row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                        row.get::<_, Option<i64>>(4)?.unwrap_or(0),
                        row.get::<_, Option<i64>>(5)?.unwrap_or(0),
                    ))
                },
            )
            .optional()
            .map_err(CacheError::query)?;

        let (last_sync_started, last_sync_completed, last_run) = match last_run {
            Some((started, completed, applied, skipped, missing, interrupted)) => (
                to_datetime(started),
                to_datetime(completed),
                Some(RunStats {
                    applied: applied.max(0) as u64,
                    skipped: skipped.max(0) as u64,
                    missing: missing.max(0) as u64,
                    interrupted: interrupted != 0,
                }),
            ),
            None => (None, None, None),
        };

        Ok(CacheSummary {
            total_events,
            loved_tracks,
            mappings,
            fuzzy_mappings,
            declined,
            checkpoint,
            oldest_event: to_datetime(oldest),
            newest_event: to_datetime(newest),
            last_sync_started,
            last_sync_completed,
            last_run,
        })
    }
}
