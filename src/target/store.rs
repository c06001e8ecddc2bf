//! Direct access to the Navidrome SQLite database.
//!
//! Navidrome must be stopped: [`check_liveness`] refuses to proceed when the
//! server answers on its API or the database shows signs of a live writer.
//! The catalog and the user's annotations are read once into memory; writes
//! go straight to the `annotation` table.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rand::Rng as _;
use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension};

use super::error::TargetError;
use super::subsonic::SubsonicClient;
use super::{TargetAdapter, TargetTrackState, TargetUser};
use crate::engine::normalize::tokens;
use crate::types::AccessMode;

const PLAY_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone)]
struct CatalogEntry {
    artist: String,
    title: String,
    album: String,
}

#[derive(Debug, Clone, Default)]
struct Annotation {
    play_count: u64,
    starred: bool,
    play_date: Option<i64>,
}

pub struct NavidromeStore {
    conn: Mutex<Connection>,
    path: PathBuf,
    user_id: String,
    catalog: HashMap<String, CatalogEntry>,
    /// Folded title word -> track ids.
    title_index: HashMap<String, Vec<String>>,
    /// Folded artist word -> track ids; used when a title has no words.
    artist_index: HashMap<String, Vec<String>>,
    annotations: Mutex<HashMap<String, Annotation>>,
    /// Tracks written this run, for album/artist roll-ups in `finish`.
    touched: Mutex<BTreeSet<String>>,
    has_ann_id: bool,
    has_starred_at: bool,
}

impl std::fmt::Debug for NavidromeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NavidromeStore")
            .field("path", &self.path)
            .field("user_id", &self.user_id)
            .field("tracks", &self.catalog.len())
            .finish_non_exhaustive()
    }
}

fn open_existing(path: &Path) -> Result<Connection, TargetError> {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|source| TargetError::Open {
        path: path.to_path_buf(),
        source,
    })
}

fn wal_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push("-wal");
    PathBuf::from(os)
}

/// Refuse to run while Navidrome may be using the database.
///
/// Three probes, any of which is fatal: the Subsonic API answers `ping`
/// (only when credentials are configured), a non-empty `-wal` file exists,
/// or an immediate exclusive transaction cannot be taken.
pub async fn check_liveness(
    db_path: &Path,
    api: Option<&SubsonicClient>,
) -> Result<(), TargetError> {
    if let Some(api) = api {
        match api.ping().await {
            Ok(()) => {
                return Err(TargetError::LivenessConflict(
                    "the Subsonic API answered ping".into(),
                ))
            }
            Err(e) => tracing::debug!(error = %e, "API not answering, assuming Navidrome is stopped"),
        }
    } else {
        tracing::info!("No API credentials configured, checking the database lock only");
    }

    let wal = wal_path(db_path);
    if let Ok(meta) = tokio::fs::metadata(&wal).await {
        if meta.len() > 0 {
            return Err(TargetError::LivenessConflict(format!(
                "write-ahead log {} is not empty",
                wal.display()
            )));
        }
    }

    let path = db_path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let conn = open_existing(&path)?;
        conn.busy_timeout(std::time::Duration::ZERO)?;
        match conn.execute_batch("BEGIN EXCLUSIVE; ROLLBACK;") {
            Ok(()) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                Err(TargetError::LivenessConflict("the database is locked".into()))
            }
            Err(e) => Err(TargetError::Query(e)),
        }
    })
    .await??;

    tracing::debug!(path = %db_path.display(), "Navidrome database is not in use");
    Ok(())
}

/// Accounts in the `user` table, ordered by name.
pub async fn list_users(db_path: &Path) -> Result<Vec<TargetUser>, TargetError> {
    let path = db_path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let conn = open_existing(&path)?;
        let mut stmt = conn.prepare("SELECT id, user_name FROM user ORDER BY user_name, id")?;
        let users = stmt
            .query_map([], |row| {
                Ok(TargetUser {
                    id: row.get(0)?,
                    user_name: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok::<_, TargetError>(users)
    })
    .await?
}

fn parse_play_date(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp());
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(dt.timestamp());
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|dt| Utc.from_utc_datetime(&dt).timestamp())
}

fn format_play_date(ts: i64) -> Option<String> {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format(PLAY_DATE_FORMAT).to_string())
}

fn column_names(conn: &Connection, table: &str) -> Result<Vec<String>, TargetError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

fn new_ann_id() -> String {
    let mut rng = rand::thread_rng();
    format!("{:016x}{:016x}", rng.gen::<u64>(), rng.gen::<u64>())
}

fn index_words(index: &mut HashMap<String, Vec<String>>, text: &str, id: &str) {
    let mut words = tokens(text);
    words.sort();
    words.dedup();
    for word in words {
        index.entry(word).or_default().push(id.to_string());
    }
}

impl NavidromeStore {
    /// Load the catalog and `user_id`'s annotations.
    pub async fn open(db_path: &Path, user_id: &str) -> Result<Self, TargetError> {
        let path = db_path.to_path_buf();
        let user = user_id.to_string();

        let (conn, catalog, annotations, has_ann_id, has_starred_at) =
            tokio::task::spawn_blocking(move || {
                let conn = open_existing(&path)?;

                let mut catalog = HashMap::new();
                let mut malformed = 0u64;
                {
                    let mut stmt = conn.prepare("SELECT id, title, artist, album FROM media_file")?;
                    let mut rows = stmt.query([])?;
                    while let Some(row) = rows.next()? {
                        let id: Option<String> = row.get(0)?;
                        let title: Option<String> = row.get(1)?;
                        match (id, title) {
                            (Some(id), Some(title)) if !id.is_empty() => {
                                catalog.insert(
                                    id,
                                    CatalogEntry {
                                        title,
                                        artist: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                                        album: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                                    },
                                );
                            }
                            _ => malformed += 1,
                        }
                    }
                }
                if malformed > 0 {
                    tracing::warn!(malformed, "Skipped media_file rows without id or title");
                }

                let mut annotations = HashMap::new();
                {
                    let mut stmt = conn.prepare(
                        "SELECT item_id, play_count, starred, play_date FROM annotation
                         WHERE user_id = ?1 AND item_type = 'media_file'",
                    )?;
                    let mut rows = stmt.query([&user])?;
                    while let Some(row) = rows.next()? {
                        let item_id: String = row.get(0)?;
                        let play_count: Option<i64> = row.get(1)?;
                        let starred: Option<bool> = row.get(2)?;
                        let play_date: Option<String> = row.get(3)?;
                        annotations.insert(
                            item_id,
                            Annotation {
                                play_count: play_count.unwrap_or(0).max(0) as u64,
                                starred: starred.unwrap_or(false),
                                play_date: play_date.as_deref().and_then(parse_play_date),
                            },
                        );
                    }
                }

                let columns = column_names(&conn, "annotation")?;
                let has_ann_id = columns.iter().any(|c| c == "ann_id");
                let has_starred_at = columns.iter().any(|c| c == "starred_at");

                Ok::<_, TargetError>((conn, catalog, annotations, has_ann_id, has_starred_at))
            })
            .await??;

        let mut title_index = HashMap::new();
        let mut artist_index = HashMap::new();
        for (id, entry) in &catalog {
            index_words(&mut title_index, &entry.title, id);
            index_words(&mut artist_index, &entry.artist, id);
        }

        tracing::info!(
            tracks = catalog.len(),
            annotated = annotations.len(),
            "Loaded Navidrome library"
        );

        Ok(Self {
            conn: Mutex::new(conn),
            path: db_path.to_path_buf(),
            user_id: user_id.to_string(),
            catalog,
            title_index,
            artist_index,
            annotations: Mutex::new(annotations),
            touched: Mutex::new(BTreeSet::new()),
            has_ann_id,
            has_starred_at,
        })
    }

    pub fn track_count(&self) -> usize {
        self.catalog.len()
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, TargetError> {
        self.conn
            .lock()
            .map_err(|e| TargetError::InvalidResponse {
                endpoint: "annotation",
                detail: e.to_string(),
            })
    }

    fn state_of(&self, id: &str, annotations: &HashMap<String, Annotation>) -> Option<TargetTrackState> {
        let entry = self.catalog.get(id)?;
        let ann = annotations.get(id).cloned().unwrap_or_default();
        Some(TargetTrackState {
            id: id.to_string(),
            artist: entry.artist.clone(),
            title: entry.title.clone(),
            album: entry.album.clone(),
            play_count: ann.play_count,
            starred: ann.starred,
            play_date: ann.play_date,
        })
    }

    /// Update the row for `(user, item_id, item_type)` or insert it.
    fn upsert_annotation(
        &self,
        conn: &Connection,
        item_id: &str,
        item_type: &str,
        play_count: u64,
        play_date: Option<&str>,
        starred: bool,
    ) -> Result<(), TargetError> {
        let starred_at = if starred {
            Some(Utc::now().format(PLAY_DATE_FORMAT).to_string())
        } else {
            None
        };

        let updated = if self.has_starred_at {
            conn.execute(
                "UPDATE annotation SET play_count = ?1, play_date = ?2,
                    starred = ?3, starred_at = CASE WHEN ?3 AND NOT starred THEN ?4 ELSE starred_at END
                 WHERE user_id = ?5 AND item_id = ?6 AND item_type = ?7",
                rusqlite::params![
                    play_count as i64,
                    play_date,
                    starred,
                    starred_at,
                    self.user_id,
                    item_id,
                    item_type
                ],
            )?
        } else {
            conn.execute(
                "UPDATE annotation SET play_count = ?1, play_date = ?2, starred = ?3
                 WHERE user_id = ?4 AND item_id = ?5 AND item_type = ?6",
                rusqlite::params![
                    play_count as i64,
                    play_date,
                    starred,
                    self.user_id,
                    item_id,
                    item_type
                ],
            )?
        };
        if updated > 0 {
            return Ok(());
        }

        let mut columns = vec!["user_id", "item_id", "item_type", "play_count", "play_date", "starred"];
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![
            Box::new(self.user_id.clone()),
            Box::new(item_id.to_string()),
            Box::new(item_type.to_string()),
            Box::new(play_count as i64),
            Box::new(play_date.map(str::to_string)),
            Box::new(starred),
        ];
        if self.has_starred_at {
            columns.push("starred_at");
            values.push(Box::new(starred_at));
        }
        if self.has_ann_id {
            columns.push("ann_id");
            values.push(Box::new(new_ann_id()));
        }
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "INSERT INTO annotation ({}) VALUES ({})",
            columns.join(", "),
            placeholders.join(", ")
        );
        conn.execute(&sql, rusqlite::params_from_iter(values.iter()))?;
        Ok(())
    }

    fn roll_up(&self, conn: &Connection, column: &str, item_type: &str, ids: &BTreeSet<String>) -> Result<u64, TargetError> {
        let mut parents: BTreeSet<String> = BTreeSet::new();
        {
            let mut stmt = conn.prepare(&format!("SELECT {} FROM media_file WHERE id = ?1", column))?;
            for id in ids {
                let parent: Option<String> = stmt
                    .query_row([id], |row| row.get::<_, Option<String>>(0))
                    .optional()?
                    .flatten();
                if let Some(parent) = parent.filter(|p| !p.is_empty()) {
                    parents.insert(parent);
                }
            }
        }

        let sum_sql = format!(
            "SELECT COALESCE(SUM(a.play_count), 0), MAX(a.play_date)
             FROM annotation a JOIN media_file m ON a.item_id = m.id
             WHERE a.user_id = ?1 AND a.item_type = 'media_file' AND m.{} = ?2",
            column
        );
        let starred_sql = "SELECT starred FROM annotation WHERE user_id = ?1 AND item_id = ?2 AND item_type = ?3";

        for parent in &parents {
            let (total, last): (i64, Option<String>) =
                conn.query_row(&sum_sql, [&self.user_id, parent], |row| Ok((row.get(0)?, row.get(1)?)))?;
            let starred: bool = conn
                .query_row(starred_sql, [&self.user_id, parent, &item_type.to_string()], |row| {
                    row.get::<_, Option<bool>>(0)
                })
                .optional()?
                .flatten()
                .unwrap_or(false);
            self.upsert_annotation(conn, parent, item_type, total.max(0) as u64, last.as_deref(), starred)?;
        }
        Ok(parents.len() as u64)
    }
}

#[async_trait]
impl TargetAdapter for NavidromeStore {
    fn mode(&self) -> AccessMode {
        AccessMode::Database
    }

    fn supports_decrease(&self) -> bool {
        true
    }

    async fn read_state(&self, track_id: &str) -> Result<Option<TargetTrackState>, TargetError> {
        let annotations = self.annotations.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.state_of(track_id, &annotations))
    }

    async fn search(&self, artist: &str, title: &str) -> Result<Vec<TargetTrackState>, TargetError> {
        let mut words = tokens(title);
        let index = if words.is_empty() {
            words = tokens(artist);
            &self.artist_index
        } else {
            &self.title_index
        };

        let mut ids: BTreeSet<&str> = BTreeSet::new();
        for word in &words {
            if let Some(hits) = index.get(word) {
                ids.extend(hits.iter().map(String::as_str));
            }
        }

        let annotations = self.annotations.lock().unwrap_or_else(|e| e.into_inner());
        Ok(ids
            .into_iter()
            .filter_map(|id| self.state_of(id, &annotations))
            .collect())
    }

    async fn apply_count(
        &self,
        track: &TargetTrackState,
        new_count: u64,
        timestamps: &[i64],
    ) -> Result<u64, TargetError> {
        let current = {
            let annotations = self.annotations.lock().unwrap_or_else(|e| e.into_inner());
            annotations.get(&track.id).cloned().unwrap_or_default()
        };

        // play_date never moves backwards.
        let play_date = match (timestamps.last().copied(), current.play_date) {
            (Some(latest), Some(existing)) => Some(latest.max(existing)),
            (latest, existing) => latest.or(existing),
        };
        let play_date_str = play_date.and_then(format_play_date);

        {
            let conn = self.lock_conn()?;
            self.upsert_annotation(
                &conn,
                &track.id,
                "media_file",
                new_count,
                play_date_str.as_deref(),
                current.starred,
            )?;
        }

        let mut annotations = self.annotations.lock().unwrap_or_else(|e| e.into_inner());
        let ann = annotations.entry(track.id.clone()).or_default();
        ann.play_count = new_count;
        ann.play_date = play_date;
        drop(annotations);

        self.touched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(track.id.clone());
        tracing::debug!(track_id = %track.id, from = current.play_count, to = new_count, "Wrote play count");
        Ok(new_count)
    }

    async fn apply_star(&self, track_id: &str) -> Result<(), TargetError> {
        let current = {
            let annotations = self.annotations.lock().unwrap_or_else(|e| e.into_inner());
            annotations.get(track_id).cloned().unwrap_or_default()
        };
        if current.starred {
            return Ok(());
        }

        {
            let conn = self.lock_conn()?;
            let play_date_str = current.play_date.and_then(format_play_date);
            self.upsert_annotation(
                &conn,
                track_id,
                "media_file",
                current.play_count,
                play_date_str.as_deref(),
                true,
            )?;
        }

        self.annotations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(track_id.to_string())
            .or_default()
            .starred = true;
        tracing::debug!(track_id = %track_id, "Starred track");
        Ok(())
    }

    /// Recompute album and artist play counts for every track written.
    async fn finish(&self) -> Result<(), TargetError> {
        let touched = self.touched.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if touched.is_empty() {
            return Ok(());
        }

        let conn = self.lock_conn()?;
        let media_columns = column_names(&conn, "media_file")?;
        let has = |c: &str| media_columns.iter().any(|m| m == c);
        if !has("album_id") || !has("artist_id") {
            tracing::warn!("media_file has no album_id/artist_id, skipping album and artist play counts");
            return Ok(());
        }

        conn.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| {
            let albums = self.roll_up(&conn, "album_id", "album", &touched)?;
            let artists = self.roll_up(&conn, "artist_id", "artist", &touched)?;
            Ok::<_, TargetError>((albums, artists))
        })();
        match result {
            Ok((albums, artists)) => {
                conn.execute_batch("COMMIT")?;
                tracing::info!(albums, artists, "Updated album and artist play counts");
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }
}
