//! Diff Last.fm against Navidrome and apply the result.
//!
//! A run has three phases: plan (match every canonical track and decide what
//! to do with it, prompting where the policy asks), a single confirmation,
//! then apply. Every count decision is written to the reconciliation ledger
//! so that re-running on unchanged data neither prompts nor writes.

use std::collections::BTreeMap;

use indicatif::ProgressBar;
use tokio_util::sync::CancellationToken;

use crate::cache::{CanonicalKey, EventCache, LedgerEntry, RunStats};
use crate::lastfm::ScrobbleSource;
use crate::target::{TargetAdapter, TargetTrackState};
use crate::types::ConflictPolicy;

use super::aggregate::CanonicalTrack;
use super::decision::{ConflictChoice, DecisionProvider};
use super::error::SyncError;
use super::matcher::{MatchOptions, MatchOutcome, Matcher};
use super::normalize::Normalizer;

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub policy: ConflictPolicy,
    pub reverse_sync: bool,
    pub dry_run: bool,
    pub matching: MatchOptions,
}

/// What to do with a matched track's play count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountDecision {
    /// Nothing to write or record.
    Unchanged,
    /// Write this count.
    Set(u64),
    /// Keep the Navidrome count, but remember the decision.
    Keep,
    /// Operator skipped; ask again next run.
    Skip,
    /// The access mode cannot lower the count to this value.
    Downgraded(u64),
}

#[derive(Debug, Clone)]
pub struct PlannedUpdate<'t> {
    pub track: &'t CanonicalTrack,
    pub target: TargetTrackState,
    pub count: CountDecision,
    pub star: bool,
    pub love_source: bool,
}

impl PlannedUpdate<'_> {
    /// Whether applying this touches Navidrome or Last.fm.
    fn writes(&self) -> bool {
        matches!(self.count, CountDecision::Set(_)) || self.star || self.love_source
    }
}

#[derive(Debug, Default)]
pub struct Plan<'t> {
    pub updates: Vec<PlannedUpdate<'t>>,
    pub missing_scrobbles: Vec<CanonicalTrack>,
    pub missing_loved: Vec<CanonicalTrack>,
    pub unchanged: u64,
    pub skipped: u64,
    pub downgraded: u64,
}

impl Plan<'_> {
    pub fn pending_writes(&self) -> usize {
        self.updates.iter().filter(|u| u.writes()).count()
    }
}

/// End-of-run counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Tracks with at least one successful write.
    pub applied: u64,
    pub skipped: u64,
    pub missing: u64,
    pub unchanged: u64,
    pub starred: u64,
    pub reverse_loved: u64,
    pub downgraded: u64,
    pub interrupted: bool,
}

impl RunSummary {
    pub fn to_stats(&self) -> RunStats {
        RunStats {
            applied: self.applied,
            skipped: self.skipped,
            missing: self.missing,
            interrupted: self.interrupted,
        }
    }
}

#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub summary: RunSummary,
    pub missing_scrobbles: Vec<CanonicalTrack>,
    pub missing_loved: Vec<CanonicalTrack>,
}

pub struct Reconciler<'a> {
    cache: &'a dyn EventCache,
    source: &'a dyn ScrobbleSource,
    target: &'a dyn TargetAdapter,
    decisions: &'a dyn DecisionProvider,
    normalizer: &'a Normalizer,
    options: ReconcileOptions,
    progress: ProgressBar,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        cache: &'a dyn EventCache,
        source: &'a dyn ScrobbleSource,
        target: &'a dyn TargetAdapter,
        decisions: &'a dyn DecisionProvider,
        normalizer: &'a Normalizer,
        options: ReconcileOptions,
    ) -> Self {
        Self {
            cache,
            source,
            target,
            decisions,
            normalizer,
            options,
            progress: ProgressBar::hidden(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    pub async fn run(
        &self,
        tracks: &BTreeMap<CanonicalKey, CanonicalTrack>,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, SyncError> {
        let plan = self.plan(tracks, cancel).await?;
        let pending = plan.pending_writes();
        tracing::info!(
            tracks = tracks.len(),
            pending,
            unchanged = plan.unchanged,
            missing = plan.missing_scrobbles.len(),
            missing_loved = plan.missing_loved.len(),
            downgraded = plan.downgraded,
            "Reconciliation planned"
        );

        let mut summary = RunSummary {
            missing: plan.missing_scrobbles.len() as u64,
            unchanged: plan.unchanged,
            skipped: plan.skipped,
            downgraded: plan.downgraded,
            ..RunSummary::default()
        };

        let proceed = if self.options.dry_run {
            for update in plan.updates.iter().filter(|u| u.writes()) {
                log_planned(update);
            }
            tracing::info!(pending, "Dry run, nothing written");
            false
        } else if pending == 0 {
            true
        } else {
            let question = format!(
                "Apply {} update(s) to Navidrome ({} mode)?",
                pending,
                self.target.mode().as_str()
            );
            let yes = self.decisions.confirm(&question).await?;
            if !yes {
                tracing::info!("Update cancelled by operator");
            }
            yes
        };

        if proceed {
            self.apply(&plan, cancel, &mut summary).await?;
        } else {
            summary.skipped += pending as u64;
        }

        Ok(ReconcileOutcome {
            summary,
            missing_scrobbles: plan.missing_scrobbles,
            missing_loved: plan.missing_loved,
        })
    }

    /// Match every track and decide its updates, in key order.
    pub async fn plan<'t>(
        &self,
        tracks: &'t BTreeMap<CanonicalKey, CanonicalTrack>,
        cancel: &CancellationToken,
    ) -> Result<Plan<'t>, SyncError> {
        let mut matcher = Matcher::new(
            self.cache,
            self.target,
            self.decisions,
            self.normalizer,
            self.options.matching.clone(),
        );
        let mut plan = Plan::default();
        self.progress.set_length(tracks.len() as u64);
        self.progress.set_message("matching");

        for track in tracks.values() {
            if cancel.is_cancelled() {
                self.progress.abandon_with_message("interrupted");
                return Err(SyncError::Interrupted);
            }

            match matcher.resolve(track).await? {
                MatchOutcome::Missing(reason) => {
                    tracing::debug!(key = %track.key, ?reason, "No Navidrome match");
                    if track.play_count > 0 {
                        plan.missing_scrobbles.push(track.clone());
                    }
                    if track.loved {
                        plan.missing_loved.push(track.clone());
                    }
                }
                MatchOutcome::Matched { target, .. } => {
                    let count = self.decide_count(track, &target).await?;
                    match count {
                        CountDecision::Skip => plan.skipped += 1,
                        CountDecision::Downgraded(requested) => {
                            self.progress.suspend(|| {
                                tracing::warn!(
                                    key = %track.key,
                                    track_id = %target.id,
                                    current = target.play_count,
                                    requested,
                                    mode = self.target.mode().as_str(),
                                    "Access mode cannot lower play counts, skipping"
                                )
                            });
                            plan.downgraded += 1;
                            plan.skipped += 1;
                        }
                        _ => {}
                    }

                    let star = track.loved && !target.starred;
                    let love_source = !track.loved
                        && target.starred
                        && self.options.reverse_sync
                        && self.source.can_love();
                    let update = PlannedUpdate {
                        track,
                        target,
                        count,
                        star,
                        love_source,
                    };
                    if update.writes() || count == CountDecision::Keep {
                        plan.updates.push(update);
                    } else if count == CountDecision::Unchanged {
                        plan.unchanged += 1;
                    }
                }
            }
            self.progress.inc(1);
        }

        self.progress.finish_and_clear();
        Ok(plan)
    }

    /// Count decision for one matched track.
    pub async fn decide_count(
        &self,
        track: &CanonicalTrack,
        target: &TargetTrackState,
    ) -> Result<CountDecision, SyncError> {
        let source = track.play_count;
        let current = target.play_count;
        // Loved-only entries carry no plays to reconcile.
        if source == 0 {
            return Ok(CountDecision::Unchanged);
        }

        let ledger = self
            .cache
            .get_ledger(&track.key)
            .await?
            .filter(|l| l.target_track_id == target.id);
        if let Some(entry) = &ledger {
            if entry.source_count == source && entry.target_count == current {
                return Ok(CountDecision::Unchanged);
            }
        }

        if source > current {
            return Ok(CountDecision::Set(source));
        }
        if source == current && self.options.policy != ConflictPolicy::Increment {
            return Ok(CountDecision::Unchanged);
        }

        let choice = match ConflictChoice::from_policy(self.options.policy) {
            Some(choice) => choice,
            None => {
                let choice = self.decisions.resolve_conflict(track, target).await?;
                tracing::debug!(key = %track.key, ?choice, "Operator resolved conflict");
                choice
            }
        };
        let already_counted = ledger.map_or(0, |l| l.source_count.min(source));

        Ok(match choice.apply(source, current, already_counted) {
            None => CountDecision::Skip,
            Some(n) if n == current => CountDecision::Keep,
            Some(n) if n < current && !self.target.supports_decrease() => {
                CountDecision::Downgraded(n)
            }
            Some(n) => CountDecision::Set(n),
        })
    }

    async fn apply(
        &self,
        plan: &Plan<'_>,
        cancel: &CancellationToken,
        summary: &mut RunSummary,
    ) -> Result<(), SyncError> {
        for update in &plan.updates {
            if cancel.is_cancelled() {
                tracing::warn!("Interrupted, remaining updates not applied");
                summary.interrupted = true;
                break;
            }
            let track = update.track;
            let mut wrote = false;
            let mut failed = false;

            match update.count {
                CountDecision::Set(n) => {
                    match self
                        .target
                        .apply_count(&update.target, n, &track.timestamps)
                        .await
                    {
                        Ok(reached) if reached >= n => {
                            tracing::debug!(
                                key = %track.key,
                                track_id = %update.target.id,
                                from = update.target.play_count,
                                to = n,
                                "Play count updated"
                            );
                            self.record(track, &update.target, track.play_count, n)
                                .await?;
                            wrote = true;
                        }
                        Ok(reached) => {
                            // Only the plays that landed count as reconciled,
                            // so the next run retries the rest.
                            let shortfall = n - reached;
                            tracing::warn!(
                                key = %track.key,
                                track_id = %update.target.id,
                                requested = n,
                                reached,
                                "Play count only partly updated"
                            );
                            self.record(
                                track,
                                &update.target,
                                track.play_count.saturating_sub(shortfall),
                                reached,
                            )
                            .await?;
                            failed = true;
                        }
                        Err(e) => {
                            tracing::warn!(key = %track.key, error = %e, "Play count update failed");
                            failed = true;
                        }
                    }
                }
                CountDecision::Keep => {
                    self.record(
                        track,
                        &update.target,
                        track.play_count,
                        update.target.play_count,
                    )
                    .await?;
                }
                _ => {}
            }

            if update.star {
                match self.target.apply_star(&update.target.id).await {
                    Ok(()) => {
                        summary.starred += 1;
                        wrote = true;
                    }
                    Err(e) => {
                        tracing::warn!(key = %track.key, error = %e, "Starring failed");
                        failed = true;
                    }
                }
            }

            if update.love_source {
                match self
                    .source
                    .love(&track.display_artist, &track.display_title)
                    .await
                {
                    Ok(()) => {
                        self.cache
                            .set_loved(&track.display_artist, &track.display_title, true)
                            .await?;
                        summary.reverse_loved += 1;
                        wrote = true;
                    }
                    Err(e) => {
                        tracing::warn!(key = %track.key, error = %e, "Loving on Last.fm failed");
                        failed = true;
                    }
                }
            }

            if wrote {
                summary.applied += 1;
            }
            if failed {
                summary.skipped += 1;
            }
        }

        self.target.finish().await?;
        Ok(())
    }

    async fn record(
        &self,
        track: &CanonicalTrack,
        target: &TargetTrackState,
        source_count: u64,
        target_count: u64,
    ) -> Result<(), SyncError> {
        self.cache
            .save_ledger(
                &track.key,
                &LedgerEntry {
                    target_track_id: target.id.clone(),
                    source_count,
                    target_count,
                },
            )
            .await?;
        Ok(())
    }
}

fn log_planned(update: &PlannedUpdate<'_>) {
    if let CountDecision::Set(n) = update.count {
        tracing::info!(
            artist = %update.track.display_artist,
            title = %update.track.display_title,
            from = update.target.play_count,
            to = n,
            "Would update play count"
        );
    }
    if update.star {
        tracing::info!(
            artist = %update.track.display_artist,
            title = %update.track.display_title,
            "Would star"
        );
    }
    if update.love_source {
        tracing::info!(
            artist = %update.track.display_artist,
            title = %update.track.display_title,
            "Would love on Last.fm"
        );
    }
}
