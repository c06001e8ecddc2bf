//! HTTP client for the Last.fm 2.0 web service.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use md5::{Digest, Md5};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;

use super::error::LastfmError;
use super::responses::{
    ApiErrorResponse, LovedTracksResponse, RawTrack, RecentTracksResponse, Rejected,
};
use super::{RecentPage, ScrobbleSource};
use crate::retry::{retry_with_backoff, RetryConfig};

pub const DEFAULT_BASE_URL: &str = "https://ws.audioscrobbler.com/2.0/";
const PAGE_LIMIT: &str = "200";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Credentials and pacing for [`LastfmClient`].
#[derive(Clone)]
pub struct LastfmSettings {
    pub user: String,
    pub api_key: String,
    pub api_secret: Option<String>,
    pub session_key: Option<String>,
    pub request_delay: Duration,
    pub retry: RetryConfig,
}

pub struct LastfmClient {
    http: reqwest::Client,
    base_url: String,
    settings: LastfmSettings,
    /// When the next request may be sent.
    next_slot: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for LastfmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LastfmClient")
            .field("user", &self.settings.user)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl LastfmClient {
    pub fn new(settings: LastfmSettings) -> Result<Self, LastfmError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("navisync-rs/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|source| LastfmError::Http {
                method: "client",
                source,
            })?;
        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            settings,
            next_slot: Mutex::new(None),
        })
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.to_string();
        self
    }

    /// Wait until `request_delay` has passed since the previous request.
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

    async fn call_once(
        &self,
        method: &'static str,
        params: &[(&str, String)],
        signed: bool,
    ) -> Result<Value, LastfmError> {
        self.pace().await;

        let mut query: Vec<(&str, String)> = params.to_vec();
        query.push(("method", method.to_string()));
        query.push(("api_key", self.settings.api_key.clone()));

        let request = if signed {
            let secret = self
                .settings
                .api_secret
                .as_deref()
                .ok_or(LastfmError::MissingCredential("LASTFM_API_SECRET"))?;
            let sk = self
                .settings
                .session_key
                .clone()
                .ok_or(LastfmError::MissingCredential("LASTFM_SESSION_KEY"))?;
            query.push(("sk", sk));
            let sig = api_signature(&query, secret);
            query.push(("api_sig", sig));
            query.push(("format", "json".to_string()));
            self.http.post(&self.base_url).form(&query)
        } else {
            query.push(("format", "json".to_string()));
            self.http.get(&self.base_url).query(&query)
        };

        let response = request
            .send()
            .await
            .map_err(|source| LastfmError::Http { method, source })?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| LastfmError::Http { method, source })?;

        // Error envelopes arrive with both 200 and 4xx statuses.
        if let Ok(err) = serde_json::from_str::<ApiErrorResponse>(&body) {
            return Err(LastfmError::Api {
                code: err.error,
                message: err.message,
            });
        }
        if !status.is_success() {
            return Err(LastfmError::HttpStatus {
                method,
                status: status.as_u16(),
            });
        }

        serde_json::from_str(&body).map_err(|e| LastfmError::InvalidResponse {
            method,
            detail: e.to_string(),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: &[(&str, String)],
        signed: bool,
    ) -> Result<T, LastfmError> {
        let value = retry_with_backoff(&self.settings.retry, method, || {
            self.call_once(method, params, signed)
        })
        .await?;
        serde_json::from_value(value).map_err(|e| LastfmError::InvalidResponse {
            method,
            detail: e.to_string(),
        })
    }

    /// Total scrobbles on the account; used as a connectivity probe.
    pub async fn user_playcount(&self) -> Result<u64, LastfmError> {
        let value: Value = self
            .call(
                "user.getInfo",
                &[("user", self.settings.user.clone())],
                false,
            )
            .await?;
        let playcount = value
            .pointer("/user/playcount")
            .and_then(|v| match v {
                Value::String(s) => s.parse().ok(),
                Value::Number(n) => n.as_u64(),
                _ => None,
            })
            .unwrap_or(0);
        Ok(playcount)
    }
}

/// `api_sig`: MD5 over the parameters sorted by name and concatenated as
/// `name` + `value`, followed by the shared secret. `format` and `callback`
/// are excluded.
pub(crate) fn api_signature(params: &[(&str, String)], secret: &str) -> String {
    let mut sorted: Vec<&(&str, String)> = params
        .iter()
        .filter(|(k, _)| *k != "format" && *k != "callback")
        .collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = Md5::new();
    for (k, v) in sorted {
        hasher.update(k.as_bytes());
        hasher.update(v.as_bytes());
    }
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[async_trait]
impl ScrobbleSource for LastfmClient {
    async fn recent_page(&self, since: i64, page: u32) -> Result<RecentPage, LastfmError> {
        let mut params = vec![
            ("user", self.settings.user.clone()),
            ("limit", PAGE_LIMIT.to_string()),
            ("page", page.to_string()),
            ("extended", "1".to_string()),
        ];
        if since > 0 {
            params.push(("from", (since + 1).to_string()));
        }

        let resp: RecentTracksResponse = self.call("user.getRecentTracks", &params, false).await?;
        let total_pages = resp.recenttracks.attr.total_pages();

        let mut events = Vec::new();
        let mut malformed = 0u64;
        for raw in resp.recenttracks.track.into_vec() {
            let track = match serde_json::from_value::<RawTrack>(raw) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(page, error = %e, "Skipping unparseable scrobble");
                    malformed += 1;
                    continue;
                }
            };
            match track.into_event() {
                Ok(event) if event.timestamp > since => events.push(event),
                Ok(_) => {}
                Err(Rejected::NowPlaying) => {}
                Err(Rejected::Malformed(reason)) => {
                    tracing::warn!(page, reason = %reason, "Skipping malformed scrobble");
                    malformed += 1;
                }
            }
        }

        tracing::debug!(page, total_pages, events = events.len(), "Fetched recent tracks page");
        Ok(RecentPage {
            events,
            total_pages,
            malformed,
        })
    }

    async fn loved_tracks(&self) -> Result<Vec<(String, String)>, LastfmError> {
        let mut loved = Vec::new();
        let mut page = 1u32;
        loop {
            let params = vec![
                ("user", self.settings.user.clone()),
                ("limit", PAGE_LIMIT.to_string()),
                ("page", page.to_string()),
            ];
            let resp: LovedTracksResponse = self.call("user.getLovedTracks", &params, false).await?;
            let total_pages = resp.lovedtracks.attr.total_pages();

            for raw in resp.lovedtracks.track.into_vec() {
                match serde_json::from_value::<RawTrack>(raw) {
                    Ok(t) if !t.artist_name().is_empty() && !t.name.trim().is_empty() => {
                        loved.push((t.artist_name().to_string(), t.name.trim().to_string()));
                    }
                    Ok(_) => tracing::warn!(page, "Skipping loved track without artist or title"),
                    Err(e) => tracing::warn!(page, error = %e, "Skipping unparseable loved track"),
                }
            }

            tracing::debug!(page, total_pages, loved = loved.len(), "Fetched loved tracks page");
            if page >= total_pages {
                break;
            }
            page += 1;
        }
        Ok(loved)
    }

    async fn love(&self, artist: &str, title: &str) -> Result<(), LastfmError> {
        let params = vec![("artist", artist.to_string()), ("track", title.to_string())];
        let _: Value = self.call("track.love", &params, true).await?;
        Ok(())
    }

    fn can_love(&self) -> bool {
        self.settings.api_secret.is_some() && self.settings.session_key.is_some()
    }
}
