//! The reconciliation pipeline: ingest, aggregate, match, reconcile, report.

pub mod aggregate;
pub mod decision;
pub mod error;
pub mod ingest;
pub mod matcher;
pub mod normalize;
pub mod reconcile;
pub mod report;

#[cfg(test)]
pub(crate) mod testing;

use std::path::PathBuf;

use indicatif::ProgressBar;
use tokio_util::sync::CancellationToken;

use crate::cache::{EventCache, RunStats};
use crate::lastfm::ScrobbleSource;
use crate::target::TargetAdapter;

pub use decision::{ConflictChoice, DecisionProvider, ScriptedDecisions, TerminalDecisions};
pub use error::SyncError;
pub use ingest::IngestStats;
pub use matcher::MatchOptions;
pub use normalize::Normalizer;
pub use reconcile::{ReconcileOptions, RunSummary};
pub use report::ReportPaths;

/// Engine settings derived from [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub first_artist_only: bool,
    pub first_artist_whitelist: Vec<String>,
    pub report_dir: PathBuf,
    pub reconcile: ReconcileOptions,
}

#[derive(Debug)]
pub struct SyncReport {
    pub ingest: IngestStats,
    pub summary: RunSummary,
    pub reports: ReportPaths,
}

/// Run the whole pipeline once and record it in the run history.
pub async fn run_sync(
    cache: &dyn EventCache,
    source: &dyn ScrobbleSource,
    target: &dyn TargetAdapter,
    decisions: &dyn DecisionProvider,
    config: &SyncConfig,
    progress: ProgressBar,
    cancel: &CancellationToken,
) -> Result<SyncReport, SyncError> {
    let run_id = cache.start_sync_run().await?;
    let result = sync_once(cache, source, target, decisions, config, progress, cancel).await;

    match &result {
        Ok(report) => {
            cache
                .complete_sync_run(run_id, &report.summary.to_stats())
                .await?
        }
        Err(SyncError::Interrupted) => {
            let stats = RunStats {
                interrupted: true,
                ..RunStats::default()
            };
            cache.complete_sync_run(run_id, &stats).await?
        }
        Err(e) => {
            // Close the row so `status` does not show a run still in progress.
            if let Err(close) = cache.complete_sync_run(run_id, &RunStats::default()).await {
                tracing::warn!(error = %close, "Could not record the failed run");
            }
            tracing::debug!(error = %e, "Sync run failed");
        }
    }
    result
}

async fn sync_once(
    cache: &dyn EventCache,
    source: &dyn ScrobbleSource,
    target: &dyn TargetAdapter,
    decisions: &dyn DecisionProvider,
    config: &SyncConfig,
    progress: ProgressBar,
    cancel: &CancellationToken,
) -> Result<SyncReport, SyncError> {
    let ingest = ingest::fetch_incremental(source, cache, cancel).await?;

    let events = cache.get_all_events().await?;
    let loved = cache.get_loved_map().await?;
    let normalizer = Normalizer::new(
        config.first_artist_only,
        config.first_artist_whitelist.clone(),
    );
    let tracks = aggregate::aggregate(&events, &loved, &normalizer);
    tracing::info!(
        events = events.len(),
        tracks = tracks.len(),
        first_artist_only = config.first_artist_only,
        "Aggregated scrobble history"
    );

    let outcome = reconcile::Reconciler::new(
        cache,
        source,
        target,
        decisions,
        &normalizer,
        config.reconcile.clone(),
    )
    .with_progress(progress)
    .run(&tracks, cancel)
    .await?;

    let reports = report::write_reports(
        &config.report_dir,
        &outcome.missing_scrobbles,
        &outcome.missing_loved,
    )
    .await?;

    Ok(SyncReport {
        ingest,
        summary: outcome.summary,
        reports,
    })
}
