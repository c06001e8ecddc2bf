//! Cache schema and migrations.

use rusqlite::Connection;

use super::error::CacheError;

pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS scrobbles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    artist TEXT NOT NULL,
    title TEXT NOT NULL,
    album TEXT NOT NULL DEFAULT '',
    timestamp INTEGER NOT NULL,
    source_id TEXT NOT NULL DEFAULT '',
    UNIQUE(artist, title, timestamp)
);

CREATE INDEX IF NOT EXISTS idx_scrobbles_timestamp ON scrobbles(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_scrobbles_artist_title ON scrobbles(artist, title);

CREATE TABLE IF NOT EXISTS loved_tracks (
    artist TEXT NOT NULL,
    title TEXT NOT NULL,
    loved INTEGER NOT NULL DEFAULT 1,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (artist, title)
);

CREATE TABLE IF NOT EXISTS sync_metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS match_mappings (
    artist_key TEXT NOT NULL,
    title_key TEXT NOT NULL,
    target_track_id TEXT NOT NULL,
    confidence TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (artist_key, title_key)
);

CREATE TABLE IF NOT EXISTS match_declined (
    artist_key TEXT NOT NULL,
    title_key TEXT NOT NULL,
    candidate_ids TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (artist_key, title_key)
);

CREATE TABLE IF NOT EXISTS reconciled (
    artist_key TEXT NOT NULL,
    title_key TEXT NOT NULL,
    target_track_id TEXT NOT NULL,
    source_count INTEGER NOT NULL,
    target_count INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (artist_key, title_key)
);

CREATE TABLE IF NOT EXISTS sync_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at INTEGER NOT NULL,
    completed_at INTEGER,
    applied INTEGER DEFAULT 0,
    skipped INTEGER DEFAULT 0,
    missing INTEGER DEFAULT 0,
    interrupted INTEGER DEFAULT 0
);
"#;

pub(crate) fn get_schema_version(conn: &Connection) -> Result<i32, CacheError> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), CacheError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

/// Create or upgrade the schema. Safe to call on every open.
pub(crate) fn migrate(conn: &Connection) -> Result<(), CacheError> {
    let current_version = get_schema_version(conn)?;

    if current_version > SCHEMA_VERSION {
        return Err(CacheError::UnsupportedSchemaVersion {
            found: current_version,
            expected: SCHEMA_VERSION,
        });
    }

    if current_version < SCHEMA_VERSION {
        conn.execute_batch(SCHEMA_V1)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
        tracing::debug!(
            "Scrobble cache schema {} -> {}",
            current_version,
            SCHEMA_VERSION
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_db_migration() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_idempotent_migration() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_unsupported_version() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
            .unwrap();
        assert!(matches!(
            migrate(&conn),
            Err(CacheError::UnsupportedSchemaVersion { .. })
        ));
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        for table in [
            "scrobbles",
            "loved_tracks",
            "sync_metadata",
            "match_mappings",
            "match_declined",
            "reconciled",
            "sync_runs",
        ] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })
                .unwrap();
            assert_eq!(count, 0, "table {} should start empty", table);
        }
    }

    #[test]
    fn test_duplicate_scrobble_rejected_by_unique_key() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        let sql = "INSERT OR IGNORE INTO scrobbles (artist, title, timestamp) VALUES ('a', 't', 1)";
        assert_eq!(conn.execute(sql, []).unwrap(), 1);
        assert_eq!(conn.execute(sql, []).unwrap(), 0);
    }
}
