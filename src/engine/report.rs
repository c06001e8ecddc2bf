//! `missing_scrobbles.json` and `missing_loved.json`.
//!
//! Both documents map normalized artist -> normalized title -> entry and are
//! rewritten in full on every run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};
use serde::Serialize;

use super::aggregate::CanonicalTrack;
use super::error::SyncError;

pub const MISSING_SCROBBLES_FILE: &str = "missing_scrobbles.json";
pub const MISSING_LOVED_FILE: &str = "missing_loved.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportEntry {
    pub artist: String,
    pub title: String,
    pub album: String,
    pub scrobbles: u64,
    pub loved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_played: Option<String>,
}

pub type Report = BTreeMap<String, BTreeMap<String, ReportEntry>>;

fn entry(track: &CanonicalTrack) -> ReportEntry {
    ReportEntry {
        artist: track.display_artist.clone(),
        title: track.display_title.clone(),
        album: track.album.clone(),
        scrobbles: track.play_count,
        loved: track.loved,
        last_played: track
            .last_played()
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string()),
    }
}

pub fn build_report<'a>(tracks: impl IntoIterator<Item = &'a CanonicalTrack>) -> Report {
    let mut report = Report::new();
    for track in tracks {
        report
            .entry(track.key.artist.clone())
            .or_default()
            .insert(track.key.title.clone(), entry(track));
    }
    report
}

#[derive(Debug, Clone)]
pub struct ReportPaths {
    pub missing_scrobbles: PathBuf,
    pub missing_loved: PathBuf,
}

/// Write both reports into `dir`, creating it if needed.
pub async fn write_reports(
    dir: &Path,
    missing_scrobbles: &[CanonicalTrack],
    missing_loved: &[CanonicalTrack],
) -> Result<ReportPaths, SyncError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| SyncError::Report {
            path: dir.to_path_buf(),
            source,
        })?;

    let paths = ReportPaths {
        missing_scrobbles: dir.join(MISSING_SCROBBLES_FILE),
        missing_loved: dir.join(MISSING_LOVED_FILE),
    };
    write_json(&paths.missing_scrobbles, &build_report(missing_scrobbles)).await?;
    write_json(&paths.missing_loved, &build_report(missing_loved)).await?;
    tracing::info!(
        scrobbles = missing_scrobbles.len(),
        loved = missing_loved.len(),
        dir = %dir.display(),
        "Wrote missing-track reports"
    );
    Ok(paths)
}

/// Serialize to `<path>.part` and rename over `path`.
async fn write_json(path: &Path, report: &Report) -> Result<(), SyncError> {
    let io_err = |source: std::io::Error| SyncError::Report {
        path: path.to_path_buf(),
        source,
    };
    let mut body = serde_json::to_vec_pretty(report).map_err(|e| io_err(e.into()))?;
    body.push(b'\n');

    let part = path.with_extension("json.part");
    tokio::fs::write(&part, &body).await.map_err(io_err)?;
    tokio::fs::rename(&part, path).await.map_err(io_err)?;
    Ok(())
}
