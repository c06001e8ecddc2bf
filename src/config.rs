//! Runtime configuration, built once from CLI flags and environment variables.
//!
//! Validation happens here so that the engine only ever sees a consistent
//! [`Config`]. Credentials are redacted from its `Debug` output.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

use crate::cli::SyncArgs;
use crate::engine::{MatchOptions, ReconcileOptions, SyncConfig};
use crate::lastfm::LastfmSettings;
use crate::retry::RetryConfig;
use crate::target::subsonic::SubsonicSettings;
use crate::types::{AccessMode, ConflictPolicy};

/// Application configuration, validated once at startup.
///
/// Heap types first, then numbers, then enums, with the booleans grouped at
/// the end.
pub struct Config {
    pub lastfm_user: String,
    pub lastfm_api_key: String,
    pub lastfm_api_secret: Option<String>,
    pub lastfm_session_key: Option<String>,
    pub navidrome_url: Option<String>,
    pub navidrome_user: Option<String>,
    pub navidrome_password: Option<String>,
    pub navidrome_db: Option<PathBuf>,
    pub cache_db: PathBuf,
    pub report_dir: PathBuf,
    pub first_artist_whitelist: Vec<String>,

    pub request_delay: Duration,
    pub fuzzy_threshold: f64,

    pub access_mode: AccessMode,
    pub conflict_policy: ConflictPolicy,

    pub first_artist_only: bool,
    pub fuzzy_matching: bool,
    pub reverse_sync: bool,
    pub dry_run: bool,
    pub assume_yes: bool,
    pub no_progress_bar: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("Config")
            .field("lastfm_user", &self.lastfm_user)
            .field("lastfm_api_key", &"<redacted>")
            .field("lastfm_api_secret", &redact(&self.lastfm_api_secret))
            .field("lastfm_session_key", &redact(&self.lastfm_session_key))
            .field("navidrome_url", &self.navidrome_url)
            .field("navidrome_user", &self.navidrome_user)
            .field("navidrome_password", &redact(&self.navidrome_password))
            .field("navidrome_db", &self.navidrome_db)
            .field("access_mode", &self.access_mode)
            .field("conflict_policy", &self.conflict_policy)
            .field("fuzzy_matching", &self.fuzzy_matching)
            .field("reverse_sync", &self.reverse_sync)
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Empty or whitespace-only values count as unset, as in a `.env` file with
/// `KEY=`.
fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `FIRST_ARTIST_WHITELIST` is a JSON array of strings.
pub(crate) fn parse_whitelist(raw: &str) -> anyhow::Result<Vec<String>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<String> = serde_json::from_str(raw).with_context(|| {
        format!(
            "FIRST_ARTIST_WHITELIST must be a JSON array of strings, got '{}'",
            raw
        )
    })?;
    Ok(entries)
}

impl Config {
    /// Validate `args`. `interactive` is whether stdin is a terminal.
    pub fn from_args(args: SyncArgs, interactive: bool) -> anyhow::Result<Self> {
        let lastfm_user = non_empty(args.lastfm.lastfm_user)
            .context("LASTFM_USER is not set (--lastfm-user)")?;
        let lastfm_api_key = non_empty(args.lastfm.lastfm_api_key)
            .context("LASTFM_API_KEY is not set (--lastfm-api-key)")?;
        let lastfm_api_secret = non_empty(args.lastfm.lastfm_api_secret);
        let lastfm_session_key = non_empty(args.lastfm.lastfm_session_key);

        let navidrome_url = non_empty(args.navidrome.navidrome_url);
        let navidrome_user = non_empty(args.navidrome.navidrome_user);
        let navidrome_password = non_empty(args.navidrome.navidrome_password);
        let navidrome_db = non_empty(args.navidrome.navidrome_db).map(|p| expand_tilde(&p));

        match args.navidrome.access_mode {
            AccessMode::Api => {
                if navidrome_url.is_none() || navidrome_user.is_none() || navidrome_password.is_none() {
                    anyhow::bail!(
                        "API mode needs NAVIDROME_URL, NAVIDROME_USER and NAVIDROME_PASSWORD"
                    );
                }
            }
            AccessMode::Database => {
                let Some(db) = &navidrome_db else {
                    anyhow::bail!("Database mode needs NAVIDROME_DB_PATH (--navidrome-db)");
                };
                if !db.is_file() {
                    anyhow::bail!("Navidrome database not found at {}", db.display());
                }
            }
        }

        if args.conflict_resolution == ConflictPolicy::Ask && !interactive && !args.dry_run {
            anyhow::bail!(
                "PLAYCOUNT_CONFLICT_RESOLUTION=ask needs an interactive terminal; \
                 use navidrome, lastfm, higher or increment for unattended runs"
            );
        }

        let mut fuzzy_matching = args.fuzzy_matching;
        if fuzzy_matching && !interactive {
            tracing::warn!("Fuzzy matching needs confirmation at a terminal, disabling it");
            fuzzy_matching = false;
        }

        if args.reverse_sync && (lastfm_api_secret.is_none() || lastfm_session_key.is_none()) {
            anyhow::bail!("REVERSE_SYNC needs LASTFM_API_SECRET and LASTFM_SESSION_KEY");
        }

        if !(0.0..=1.0).contains(&args.fuzzy_threshold) {
            anyhow::bail!(
                "--fuzzy-threshold must be between 0 and 1, got {}",
                args.fuzzy_threshold
            );
        }

        Ok(Self {
            lastfm_user,
            lastfm_api_key,
            lastfm_api_secret,
            lastfm_session_key,
            navidrome_url,
            navidrome_user,
            navidrome_password,
            navidrome_db,
            cache_db: expand_tilde(&args.cache.cache_db),
            report_dir: expand_tilde(&args.report_dir),
            first_artist_whitelist: parse_whitelist(&args.first_artist_whitelist)?,
            request_delay: Duration::from_millis(args.lastfm.request_delay_ms),
            fuzzy_threshold: args.fuzzy_threshold,
            access_mode: args.navidrome.access_mode,
            conflict_policy: args.conflict_resolution,
            first_artist_only: args.first_artist_only,
            fuzzy_matching,
            reverse_sync: args.reverse_sync,
            dry_run: args.dry_run,
            assume_yes: args.yes,
            no_progress_bar: args.no_progress_bar,
        })
    }

    pub fn lastfm_settings(&self) -> LastfmSettings {
        LastfmSettings {
            user: self.lastfm_user.clone(),
            api_key: self.lastfm_api_key.clone(),
            api_secret: self.lastfm_api_secret.clone(),
            session_key: self.lastfm_session_key.clone(),
            request_delay: self.request_delay,
            retry: RetryConfig::default(),
        }
    }

    /// Subsonic connection, when URL, user and password are all configured.
    pub fn subsonic_settings(&self) -> Option<SubsonicSettings> {
        Some(SubsonicSettings {
            base_url: self.navidrome_url.clone()?,
            user: self.navidrome_user.clone()?,
            password: self.navidrome_password.clone()?,
            request_delay: self.request_delay,
            retry: RetryConfig::default(),
        })
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            first_artist_only: self.first_artist_only,
            first_artist_whitelist: self.first_artist_whitelist.clone(),
            report_dir: self.report_dir.clone(),
            reconcile: ReconcileOptions {
                policy: self.conflict_policy,
                reverse_sync: self.reverse_sync,
                dry_run: self.dry_run,
                matching: MatchOptions {
                    fuzzy: self.fuzzy_matching,
                    threshold: self.fuzzy_threshold,
                    ..MatchOptions::default()
                },
            },
        }
    }
}
