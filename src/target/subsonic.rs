//! Subsonic REST adapter, usable while Navidrome is running.
//!
//! The API has no way to set a play count, only to submit plays, so this
//! adapter can raise counts but never lower them.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use md5::{Digest, Md5};
use rand::Rng as _;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;

use super::error::TargetError;
use super::{TargetAdapter, TargetTrackState};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::types::AccessMode;

const API_VERSION: &str = "1.16.1";
const CLIENT_NAME: &str = "navisync-rs";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const SEARCH_SONG_COUNT: &str = "20";
/// Subsonic "requested data was not found".
const NOT_FOUND: u32 = 70;

#[derive(Clone)]
pub struct SubsonicSettings {
    pub base_url: String,
    pub user: String,
    pub password: String,
    pub request_delay: Duration,
    pub retry: RetryConfig,
}

pub struct SubsonicClient {
    http: reqwest::Client,
    settings: SubsonicSettings,
    next_slot: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for SubsonicClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubsonicClient")
            .field("base_url", &self.settings.base_url)
            .field("user", &self.settings.user)
            .finish_non_exhaustive()
    }
}

/// A `song` object from `search3`/`getSong`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Song {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    artist: String,
    #[serde(default)]
    album: String,
    #[serde(default)]
    play_count: u64,
    #[serde(default)]
    starred: Option<String>,
    #[serde(default)]
    played: Option<String>,
}

impl From<Song> for TargetTrackState {
    fn from(song: Song) -> Self {
        let play_date = song
            .played
            .as_deref()
            .and_then(|p| chrono::DateTime::parse_from_rfc3339(p).ok())
            .map(|dt| dt.timestamp());
        Self {
            id: song.id,
            artist: song.artist,
            title: song.title,
            album: song.album,
            play_count: song.play_count,
            starred: song.starred.is_some(),
            play_date,
        }
    }
}

/// Subsonic token auth: `t = md5(password + salt)`.
pub(crate) fn auth_token(password: &str, salt: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(salt.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Unwrap the `subsonic-response` envelope, turning `status: failed` into an
/// [`TargetError::Api`].
fn unwrap_envelope(endpoint: &'static str, body: Value) -> Result<Value, TargetError> {
    let Some(inner) = body.get("subsonic-response") else {
        return Err(TargetError::InvalidResponse {
            endpoint,
            detail: "missing subsonic-response".into(),
        });
    };
    if inner.get("status").and_then(Value::as_str) == Some("ok") {
        return Ok(inner.clone());
    }
    let code = inner
        .pointer("/error/code")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    let message = inner
        .pointer("/error/message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    Err(TargetError::Api { code, message })
}

/// `song` may be a list, a single object, or absent.
fn songs_from(value: Option<&Value>) -> Vec<Song> {
    let items: Vec<Value> = match value {
        Some(Value::Array(items)) => items.clone(),
        Some(obj @ Value::Object(_)) => vec![obj.clone()],
        _ => Vec::new(),
    };
    items
        .into_iter()
        .filter_map(|v| match serde_json::from_value::<Song>(v) {
            Ok(song) => Some(song),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed Subsonic song");
                None
            }
        })
        .collect()
}

impl SubsonicClient {
    pub fn new(mut settings: SubsonicSettings) -> Result<Self, TargetError> {
        settings.base_url = settings.base_url.trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| TargetError::Http {
                endpoint: "client",
                source,
            })?;
        Ok(Self {
            http,
            settings,
            next_slot: Mutex::new(None),
        })
    }

    async fn pace(&self) {
        let wait = {
            let mut slot = self.next_slot.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            let start = slot.map_or(now, |t| t.max(now));
            *slot = Some(start + self.settings.request_delay);
            start - now
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    fn auth_params(&self) -> Vec<(&'static str, String)> {
        let salt = format!("{:012x}", rand::thread_rng().gen::<u64>() & 0xffff_ffff_ffff);
        vec![
            ("u", self.settings.user.clone()),
            ("t", auth_token(&self.settings.password, &salt)),
            ("s", salt),
            ("v", API_VERSION.to_string()),
            ("c", CLIENT_NAME.to_string()),
            ("f", "json".to_string()),
        ]
    }

    async fn call_once(
        &self,
        endpoint: &'static str,
        params: &[(&'static str, String)],
    ) -> Result<Value, TargetError> {
        self.pace().await;

        let url = format!("{}/rest/{}", self.settings.base_url, endpoint);
        let mut query = self.auth_params();
        query.extend(params.iter().cloned());

        let response = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|source| TargetError::Http { endpoint, source })?;
        let status = response.status();
        if !status.is_success() {
            return Err(TargetError::HttpStatus {
                endpoint,
                status: status.as_u16(),
            });
        }
        let body: Value = response
            .json()
            .await
            .map_err(|source| TargetError::Http { endpoint, source })?;
        unwrap_envelope(endpoint, body)
    }

    async fn call(
        &self,
        endpoint: &'static str,
        params: &[(&'static str, String)],
    ) -> Result<Value, TargetError> {
        retry_with_backoff(&self.settings.retry, endpoint, || {
            self.call_once(endpoint, params)
        })
        .await
    }

    /// Single attempt, no retries: used for liveness probing.
    pub async fn ping(&self) -> Result<(), TargetError> {
        self.call_once("ping.view", &[]).await.map(|_| ())
    }

    pub async fn scrobble(&self, track_id: &str, timestamp: i64) -> Result<(), TargetError> {
        self.call(
            "scrobble.view",
            &[
                ("id", track_id.to_string()),
                ("time", (timestamp * 1000).to_string()),
                ("submission", "false".to_string()),
            ],
        )
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl TargetAdapter for SubsonicClient {
    fn mode(&self) -> AccessMode {
        AccessMode::Api
    }

    fn supports_decrease(&self) -> bool {
        false
    }

    async fn read_state(&self, track_id: &str) -> Result<Option<TargetTrackState>, TargetError> {
        match self.call("getSong.view", &[("id", track_id.to_string())]).await {
            Ok(body) => Ok(songs_from(body.get("song"))
                .into_iter()
                .next()
                .map(TargetTrackState::from)),
            Err(TargetError::Api { code: NOT_FOUND, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn search(
        &self,
        artist: &str,
        title: &str,
    ) -> Result<Vec<TargetTrackState>, TargetError> {
        let body = self
            .call(
                "search3.view",
                &[
                    ("query", format!("{} {}", artist, title)),
                    ("songCount", SEARCH_SONG_COUNT.to_string()),
                    ("artistCount", "0".to_string()),
                    ("albumCount", "0".to_string()),
                ],
            )
            .await?;
        let mut songs: Vec<TargetTrackState> = songs_from(body.pointer("/searchResult3/song"))
            .into_iter()
            .map(TargetTrackState::from)
            .collect();

        // Full-text search can miss title-only matches on long credits.
        if songs.is_empty() && !title.trim().is_empty() {
            let body = self
                .call(
                    "search3.view",
                    &[
                        ("query", title.to_string()),
                        ("songCount", SEARCH_SONG_COUNT.to_string()),
                        ("artistCount", "0".to_string()),
                        ("albumCount", "0".to_string()),
                    ],
                )
                .await?;
            songs = songs_from(body.pointer("/searchResult3/song"))
                .into_iter()
                .map(TargetTrackState::from)
                .collect();
        }
        Ok(songs)
    }

    async fn apply_count(
        &self,
        track: &TargetTrackState,
        new_count: u64,
        timestamps: &[i64],
    ) -> Result<u64, TargetError> {
        if new_count < track.play_count {
            return Err(TargetError::DecreaseUnsupported {
                track_id: track.id.clone(),
                current: track.play_count,
                requested: new_count,
            });
        }
        let missing = (new_count - track.play_count) as usize;
        if missing == 0 {
            return Ok(track.play_count);
        }

        // Most recent plays first; pad with "now" if Last.fm has fewer.
        let mut plays: Vec<i64> = timestamps.iter().rev().take(missing).copied().collect();
        if plays.len() < missing {
            let now = chrono::Utc::now().timestamp();
            plays.resize(missing, now);
        }

        let mut failed = 0usize;
        for ts in &plays {
            if let Err(e) = self.scrobble(&track.id, *ts).await {
                tracing::warn!(track_id = %track.id, timestamp = ts, error = %e, "Scrobble failed");
                failed += 1;
            }
        }
        if failed == plays.len() {
            return Err(TargetError::InvalidResponse {
                endpoint: "scrobble.view",
                detail: format!("all {} scrobbles for {} failed", failed, track.id),
            });
        }
        if failed > 0 {
            tracing::warn!(
                track_id = %track.id,
                submitted = plays.len() - failed,
                failed,
                "Some scrobbles were not accepted"
            );
        }
        Ok(track.play_count + (plays.len() - failed) as u64)
    }

    async fn apply_star(&self, track_id: &str) -> Result<(), TargetError> {
        self.call("star.view", &[("id", track_id.to_string())])
            .await
            .map(|_| ())
    }

    async fn finish(&self) -> Result<(), TargetError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> SubsonicClient {
        SubsonicClient::new(SubsonicSettings {
            base_url: "http://127.0.0.1:9/".into(),
            user: "admin".into(),
            password: "sesame".into(),
            request_delay: Duration::ZERO,
            retry: RetryConfig {
                max_retries: 0,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
            },
        })
        .unwrap()
    }

    #[test]
    fn test_auth_token_matches_subsonic_docs() {
        assert_eq!(
            auth_token("sesame", "c19b2d"),
            "26719a1196d2a940705a59634eb18eab"
        );
    }

    #[test]
    fn test_auth_params_fresh_salt() {
        let c = client();
        let a = c.auth_params();
        let b = c.auth_params();
        let salt = |p: &[(&str, String)]| p.iter().find(|(k, _)| *k == "s").unwrap().1.clone();
        assert_ne!(salt(&a), salt(&b));
        assert!(a.iter().any(|(k, v)| *k == "v" && v == API_VERSION));
        assert!(a.iter().any(|(k, v)| *k == "f" && v == "json"));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        assert_eq!(client().settings.base_url, "http://127.0.0.1:9");
    }

    #[test]
    fn test_envelope_ok() {
        let body = json!({"subsonic-response": {"status": "ok", "version": "1.16.1"}});
        assert!(unwrap_envelope("ping.view", body).is_ok());
    }

    #[test]
    fn test_envelope_failed() {
        let body = json!({"subsonic-response": {
            "status": "failed",
            "error": {"code": 40, "message": "Wrong username or password"}
        }});
        match unwrap_envelope("ping.view", body) {
            Err(TargetError::Api { code, message }) => {
                assert_eq!(code, 40);
                assert!(message.contains("Wrong"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_songs_list_and_single() {
        let list = json!([
            {"id": "1", "title": "Song 2", "artist": "Blur", "playCount": 4,
             "starred": "2024-01-01T00:00:00Z", "played": "2024-02-01T10:00:00Z"},
            {"id": "2", "title": "Tender", "artist": "Blur"},
            {"title": "no id"}
        ]);
        let songs: Vec<TargetTrackState> = songs_from(Some(&list))
            .into_iter()
            .map(TargetTrackState::from)
            .collect();
        assert_eq!(songs.len(), 2);
        assert_eq!(songs[0].play_count, 4);
        assert!(songs[0].starred);
        assert_eq!(songs[0].play_date, Some(1_706_781_600));
        assert!(!songs[1].starred);
        assert_eq!(songs[1].play_count, 0);

        let single = json!({"id": "9", "title": "x", "artist": "y"});
        assert_eq!(songs_from(Some(&single)).len(), 1);
        assert!(songs_from(None).is_empty());
    }

    #[tokio::test]
    async fn test_api_count_writes_against_unreachable_server() {
        let c = client();
        let track = TargetTrackState {
            id: "t1".into(),
            artist: "A".into(),
            title: "x".into(),
            album: String::new(),
            play_count: 10,
            starred: false,
            play_date: None,
        };
        let err = c.apply_count(&track, 5, &[1, 2, 3]).await.unwrap_err();
        assert!(matches!(err, TargetError::DecreaseUnsupported { .. }));
        // equal count is a no-op and needs no request
        assert_eq!(c.apply_count(&track, 10, &[]).await.unwrap(), 10);
        assert!(!c.supports_decrease());
        // nothing listens on the discard port, so no play is accepted
        let err = c.apply_count(&track, 12, &[1, 2]).await.unwrap_err();
        assert!(matches!(err, TargetError::InvalidResponse { .. }));
    }
}
