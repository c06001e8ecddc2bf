use clap::builder::BoolishValueParser;
use clap::{Args, Parser, Subcommand};

use crate::types::{AccessMode, ConflictPolicy, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "navisync-rs",
    version,
    about = "Sync Last.fm scrobbles and loved tracks into Navidrome"
)]
pub struct Cli {
    /// Log level (overridden by RUST_LOG)
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch new scrobbles and reconcile them into Navidrome
    Sync(SyncArgs),
    /// Show what the local scrobble cache holds
    Status(StatusArgs),
    /// Forget the fetch checkpoint so the next sync re-reads all history
    ResetCheckpoint(ResetCheckpointArgs),
    /// Validate configuration and probe Last.fm and Navidrome
    Check(SyncArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CacheArgs {
    /// Scrobble cache database
    #[arg(long, env = "CACHE_DB_PATH", default_value = "~/.navisync-rs/cache.db")]
    pub cache_db: String,
}

#[derive(Args, Debug, Clone)]
pub struct LastfmArgs {
    /// Last.fm user whose history is synced
    #[arg(long, env = "LASTFM_USER")]
    pub lastfm_user: Option<String>,

    /// Last.fm API key
    #[arg(long, env = "LASTFM_API_KEY", hide_env_values = true)]
    pub lastfm_api_key: Option<String>,

    /// Last.fm API secret, only needed for reverse sync
    #[arg(long, env = "LASTFM_API_SECRET", hide_env_values = true)]
    pub lastfm_api_secret: Option<String>,

    /// Last.fm session key, only needed for reverse sync
    #[arg(long, env = "LASTFM_SESSION_KEY", hide_env_values = true)]
    pub lastfm_session_key: Option<String>,

    /// Minimum delay between Last.fm requests, in milliseconds
    #[arg(long, env = "REQUEST_DELAY_MS", default_value_t = 250)]
    pub request_delay_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct NavidromeArgs {
    /// How Navidrome is accessed
    #[arg(long, value_enum, env = "ACCESS_MODE", default_value = "api")]
    pub access_mode: AccessMode,

    /// Navidrome base URL (API mode, and liveness check in database mode)
    #[arg(long, env = "NAVIDROME_URL")]
    pub navidrome_url: Option<String>,

    /// Navidrome user name
    #[arg(long, env = "NAVIDROME_USER")]
    pub navidrome_user: Option<String>,

    /// Navidrome password.
    /// WARNING: passing via --navidrome-password is visible in process listings.
    /// Prefer the NAVIDROME_PASSWORD environment variable instead.
    #[arg(long, env = "NAVIDROME_PASSWORD", hide_env_values = true)]
    pub navidrome_password: Option<String>,

    /// Path to navidrome.db (database mode)
    #[arg(long, env = "NAVIDROME_DB_PATH")]
    pub navidrome_db: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct SyncArgs {
    #[command(flatten)]
    pub cache: CacheArgs,

    #[command(flatten)]
    pub lastfm: LastfmArgs,

    #[command(flatten)]
    pub navidrome: NavidromeArgs,

    /// Count collaborations under their lead artist
    #[arg(
        long,
        env = "SCROBBLED_FIRSTARTISTONLY",
        default_value = "true",
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    pub first_artist_only: bool,

    /// JSON array of artist credits never split by --first-artist-only
    #[arg(long, env = "FIRST_ARTIST_WHITELIST", default_value = "[]")]
    pub first_artist_whitelist: String,

    /// Offer near-miss matches for confirmation
    #[arg(
        long,
        env = "FUZZY_MATCHING",
        default_value = "false",
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    pub fuzzy_matching: bool,

    /// Minimum similarity (0-1) for a fuzzy candidate
    #[arg(long, default_value_t = 0.85)]
    pub fuzzy_threshold: f64,

    /// What to do when Navidrome has at least as many plays as Last.fm
    #[arg(
        long,
        value_enum,
        env = "PLAYCOUNT_CONFLICT_RESOLUTION",
        default_value = "ask"
    )]
    pub conflict_resolution: ConflictPolicy,

    /// Love tracks on Last.fm that are starred in Navidrome
    #[arg(
        long,
        env = "REVERSE_SYNC",
        default_value = "false",
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    pub reverse_sync: bool,

    /// Directory for missing_scrobbles.json and missing_loved.json
    #[arg(long, env = "REPORT_DIR", default_value = "~/.navisync-rs/json")]
    pub report_dir: String,

    /// Plan and report, but write nothing to Navidrome or Last.fm
    #[arg(long)]
    pub dry_run: bool,

    /// Apply without the final confirmation prompt
    #[arg(short = 'y', long)]
    pub yes: bool,

    /// Disable progress bar
    #[arg(long)]
    pub no_progress_bar: bool,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub cache: CacheArgs,

    /// List the loved tracks held in the cache
    #[arg(long)]
    pub loved: bool,
}

#[derive(Args, Debug)]
pub struct ResetCheckpointArgs {
    #[command(flatten)]
    pub cache: CacheArgs,

    /// Skip confirmation prompt
    #[arg(short = 'y', long)]
    pub yes: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("navisync-rs").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_sync_defaults() {
        let cli = parse(&["sync", "--lastfm-user", "alice"]);
        let Command::Sync(args) = cli.command else {
            panic!("expected sync");
        };
        assert_eq!(args.lastfm.lastfm_user.as_deref(), Some("alice"));
        assert!(args.first_artist_only);
        assert!(!args.fuzzy_matching);
        assert_eq!(args.first_artist_whitelist, "[]");
        assert_eq!(args.fuzzy_threshold, 0.85);
        assert!(!args.dry_run);
    }

    #[test]
    fn test_boolish_flags() {
        let cli = parse(&[
            "sync",
            "--first-artist-only",
            "False",
            "--fuzzy-matching",
            "--reverse-sync=yes",
        ]);
        let Command::Sync(args) = cli.command else {
            panic!("expected sync");
        };
        assert!(!args.first_artist_only);
        assert!(args.fuzzy_matching);
        assert!(args.reverse_sync);
    }

    #[test]
    fn test_policy_and_mode_aliases() {
        let cli = parse(&[
            "sync",
            "--conflict-resolution",
            "target-wins",
            "--access-mode",
            "db",
        ]);
        let Command::Sync(args) = cli.command else {
            panic!("expected sync");
        };
        assert_eq!(args.conflict_resolution, ConflictPolicy::Navidrome);
        assert_eq!(args.navidrome.access_mode, AccessMode::Database);
    }

    #[test]
    fn test_reset_checkpoint_yes() {
        let cli = parse(&["reset-checkpoint", "-y", "--log-level", "warn"]);
        assert_eq!(cli.log_level, LogLevel::Warn);
        assert!(matches!(cli.command, Command::ResetCheckpoint(ResetCheckpointArgs { yes: true, .. })));
    }
}
