//! navisync-rs: reconcile Last.fm listening history into Navidrome.
//!
//! Scrobbles are cached locally in SQLite and fetched incrementally from a
//! checkpoint, then folded into per-track play counts and matched against the
//! Navidrome library. Differences are applied through the Subsonic API, or
//! straight to `navidrome.db` while the server is stopped. Conflicts follow
//! the configured policy or are asked at the terminal.

#![warn(clippy::all)]

mod cache;
mod cli;
mod config;
mod engine;
mod lastfm;
mod retry;
mod shutdown;
mod target;
mod types;

use std::io::IsTerminal;

use anyhow::Context;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use cache::{EventCache, SqliteEventCache};
use cli::Command;
use config::{expand_tilde, Config};
use engine::{ConflictChoice, DecisionProvider, ScriptedDecisions, SyncError, TerminalDecisions};
use lastfm::LastfmClient;
use target::{NavidromeStore, SubsonicClient, TargetAdapter};
use types::AccessMode;

/// Progress bar for the match/plan phase.
///
/// Hidden when the user passed `--no-progress-bar` or stderr is not a TTY.
fn create_progress_bar(no_progress_bar: bool) -> ProgressBar {
    if no_progress_bar || !std::io::stderr().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .expect("valid template")
        .progress_chars("=> "),
    );
    pb
}

/// Connect to Navidrome in the configured access mode.
///
/// Database mode runs the liveness check first and refuses to open the
/// database while Navidrome may be using it.
async fn open_target(
    config: &Config,
    decisions: &dyn DecisionProvider,
) -> anyhow::Result<Box<dyn TargetAdapter>> {
    match config.access_mode {
        AccessMode::Api => {
            let settings = config
                .subsonic_settings()
                .context("API mode needs Navidrome URL, user and password")?;
            let client = SubsonicClient::new(settings)?;
            client
                .ping()
                .await
                .context("Cannot reach the Navidrome API")?;
            tracing::info!("Connected to the Navidrome API");
            Ok(Box::new(client))
        }
        AccessMode::Database => {
            let db_path = config
                .navidrome_db
                .as_deref()
                .context("Database mode needs NAVIDROME_DB_PATH")?;
            let api = config
                .subsonic_settings()
                .map(SubsonicClient::new)
                .transpose()?;
            target::store::check_liveness(db_path, api.as_ref())
                .await
                .map_err(SyncError::from)?;

            let users = target::store::list_users(db_path).await?;
            let user = match (&config.navidrome_user, users.len()) {
                (_, 0) => return Err(target::TargetError::NoUsers.into()),
                (Some(name), _) => users
                    .iter()
                    .find(|u| u.user_name.eq_ignore_ascii_case(name))
                    .cloned()
                    .ok_or_else(|| target::TargetError::UnknownUser(name.clone()))?,
                (None, 1) => users[0].clone(),
                (None, _) => {
                    let idx = decisions.choose_user(&users).await?;
                    users[idx.min(users.len() - 1)].clone()
                }
            };
            tracing::info!(user = %user.user_name, "Using Navidrome user");

            let store = NavidromeStore::open(db_path, &user.id).await?;
            Ok(Box::new(store))
        }
    }
}

async fn run_sync(args: cli::SyncArgs) -> anyhow::Result<()> {
    let interactive = std::io::stdin().is_terminal();
    let config = Config::from_args(args, interactive)?;
    tracing::debug!(?config, "Configuration");
    tracing::info!(
        mode = config.access_mode.as_str(),
        policy = config.conflict_policy.as_str(),
        dry_run = config.dry_run,
        "Starting navisync-rs"
    );

    let shutdown_token = shutdown::install_signal_handler();
    let progress = create_progress_bar(config.no_progress_bar);

    let decisions: Box<dyn DecisionProvider> = if interactive {
        Box::new(TerminalDecisions::new(config.assume_yes, progress.clone()))
    } else {
        if !config.assume_yes && !config.dry_run {
            tracing::warn!("Not running in a terminal and --yes not given: changes will be planned but not applied");
        }
        let conflict =
            ConflictChoice::from_policy(config.conflict_policy).unwrap_or(ConflictChoice::Skip);
        Box::new(ScriptedDecisions::new(conflict, config.assume_yes))
    };

    let cache = SqliteEventCache::open(&config.cache_db).await?;
    let source = LastfmClient::new(config.lastfm_settings())?;
    let target = open_target(&config, decisions.as_ref()).await?;

    let result = engine::run_sync(
        &cache,
        &source,
        target.as_ref(),
        decisions.as_ref(),
        &config.sync_config(),
        progress,
        &shutdown_token,
    )
    .await;

    let report = match result {
        Ok(report) => report,
        Err(SyncError::Interrupted) => {
            tracing::info!("Shutdown requested, exiting...");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let s = &report.summary;
    println!();
    println!("Sync complete:");
    println!(
        "  Scrobbles fetched:   {} ({} new)",
        report.ingest.fetched, report.ingest.inserted
    );
    println!("  Tracks updated:      {}", s.applied);
    println!("  Unchanged:           {}", s.unchanged);
    println!("  Skipped:             {}", s.skipped);
    if s.downgraded > 0 {
        println!("    (not lowerable in {} mode: {})", config.access_mode.as_str(), s.downgraded);
    }
    println!("  Missing in Navidrome: {}", s.missing);
    println!("  Starred:             {}", s.starred);
    if config.reverse_sync {
        println!("  Loved on Last.fm:    {}", s.reverse_loved);
    }
    if s.interrupted {
        println!("  (interrupted before all updates were applied)");
    }
    println!();
    println!("Reports:");
    println!("  {}", report.reports.missing_scrobbles.display());
    println!("  {}", report.reports.missing_loved.display());

    Ok(())
}

/// Run the status command.
async fn run_status(args: cli::StatusArgs) -> anyhow::Result<()> {
    let db_path = expand_tilde(&args.cache.cache_db);

    if !db_path.exists() {
        println!("No scrobble cache found at {}", db_path.display());
        println!("Run a sync first to create it.");
        return Ok(());
    }

    let cache = SqliteEventCache::open(&db_path).await?;
    let summary = cache.get_summary().await?;

    println!("Scrobble cache: {}", cache.path().display());
    println!();
    println!("Scrobbles:    {}", summary.total_events);
    if let (Some(oldest), Some(newest)) = (&summary.oldest_event, &summary.newest_event) {
        println!(
            "  From {} to {}",
            oldest.format("%Y-%m-%d %H:%M:%S UTC"),
            newest.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    println!("Loved tracks: {}", summary.loved_tracks);
    println!(
        "Mappings:     {} ({} confirmed fuzzy, {} declined)",
        summary.mappings, summary.fuzzy_mappings, summary.declined
    );
    if summary.checkpoint > 0 {
        let checkpoint = chrono::DateTime::from_timestamp(summary.checkpoint, 0)
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| summary.checkpoint.to_string());
        println!("Checkpoint:   {}", checkpoint);
    } else {
        println!("Checkpoint:   none (next sync fetches the full history)");
    }
    println!();

    if let Some(started) = &summary.last_sync_started {
        println!(
            "Last sync started:   {}",
            started.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(completed) = &summary.last_sync_completed {
        println!(
            "Last sync completed: {}",
            completed.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(run) = &summary.last_run {
        println!(
            "Last run: {} applied, {} skipped, {} missing{}",
            run.applied,
            run.skipped,
            run.missing,
            if run.interrupted { " (interrupted)" } else { "" }
        );
    }

    if args.loved && summary.loved_tracks > 0 {
        println!();
        println!("Loved tracks:");
        for flag in cache.get_loved().await?.iter().filter(|f| f.loved) {
            println!("  {} - {}", flag.artist, flag.title);
        }
    }

    Ok(())
}

/// Run the reset-checkpoint command.
async fn run_reset_checkpoint(args: cli::ResetCheckpointArgs) -> anyhow::Result<()> {
    let db_path = expand_tilde(&args.cache.cache_db);

    if !db_path.exists() {
        println!("No scrobble cache found at {}", db_path.display());
        return Ok(());
    }

    if !args.yes {
        println!("This resets the fetch checkpoint in:");
        println!("  {}", db_path.display());
        println!("The next sync re-reads the full Last.fm history (cached scrobbles are kept).");
        println!();
        print!("Are you sure? [y/N] ");
        use std::io::Write;
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    let cache = SqliteEventCache::open(&db_path).await?;
    cache.reset_checkpoint().await?;
    println!("Checkpoint reset.");
    Ok(())
}

/// Run the check command: validate configuration and probe both services.
async fn run_check(args: cli::SyncArgs) -> anyhow::Result<()> {
    let interactive = std::io::stdin().is_terminal();
    let config = match Config::from_args(args, interactive) {
        Ok(config) => config,
        Err(e) => {
            println!("Configuration: FAILED");
            println!("  {:#}", e);
            anyhow::bail!("configuration is invalid");
        }
    };
    println!("Configuration: OK");
    println!("  Access mode:         {}", config.access_mode.as_str());
    println!("  Conflict resolution: {}", config.conflict_policy.describe());
    println!("  First artist only:   {}", config.first_artist_only);
    if !config.first_artist_whitelist.is_empty() {
        println!("  Whitelist:           {}", config.first_artist_whitelist.join(", "));
    }
    println!("  Fuzzy matching:      {}", config.fuzzy_matching);

    let mut failures = 0;

    let source = LastfmClient::new(config.lastfm_settings())?;
    match source.user_playcount().await {
        Ok(count) => println!("Last.fm: OK ({} has {} scrobbles)", config.lastfm_user, count),
        Err(e) => {
            failures += 1;
            println!("Last.fm: FAILED ({})", e);
        }
    }

    match config.access_mode {
        AccessMode::Api => {
            let settings = config
                .subsonic_settings()
                .context("API mode needs Navidrome URL, user and password")?;
            match SubsonicClient::new(settings)?.ping().await {
                Ok(()) => println!("Navidrome API: OK"),
                Err(e) => {
                    failures += 1;
                    println!("Navidrome API: FAILED ({})", e);
                }
            }
        }
        AccessMode::Database => {
            let db_path = config
                .navidrome_db
                .as_deref()
                .context("Database mode needs NAVIDROME_DB_PATH")?;
            let api = config
                .subsonic_settings()
                .map(SubsonicClient::new)
                .transpose()?;
            match target::store::check_liveness(db_path, api.as_ref()).await {
                Ok(()) => println!("Navidrome database: not in use"),
                Err(e) => {
                    failures += 1;
                    println!("Navidrome database: FAILED ({})", e);
                }
            }
            match target::store::list_users(db_path).await {
                Ok(users) => {
                    let names: Vec<&str> = users.iter().map(|u| u.user_name.as_str()).collect();
                    println!("Navidrome users: {}", names.join(", "));
                    if let Some(user) = users.first() {
                        let store = NavidromeStore::open(db_path, &user.id).await?;
                        println!("Navidrome tracks: {}", store.track_count());
                    }
                }
                Err(e) => {
                    failures += 1;
                    println!("Navidrome users: FAILED ({})", e);
                }
            }
        }
    }

    if config.cache_db.exists() {
        let cache = SqliteEventCache::open(&config.cache_db).await?;
        let summary = cache.get_summary().await?;
        println!(
            "Cache: {} scrobbles at {}",
            summary.total_events,
            config.cache_db.display()
        );
    } else {
        println!("Cache: not created yet ({})", config.cache_db.display());
    }

    if failures > 0 {
        anyhow::bail!("{} check(s) failed", failures);
    }
    println!();
    println!("All checks passed.");
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Sync(args) => run_sync(args).await,
        Command::Status(args) => run_status(args).await,
        Command::ResetCheckpoint(args) => run_reset_checkpoint(args).await,
        Command::Check(args) => run_check(args).await,
    }
}
