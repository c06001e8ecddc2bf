//! Binding canonical tracks to Navidrome track ids.
//!
//! Resolution order for each key: a stored mapping, then an exact key match
//! among the search candidates, then (when enabled) fuzzy candidates that the
//! operator must confirm. Tracks are resolved in key order and the first key
//! to bind a Navidrome track keeps it; later keys never see a claimed track.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use strsim::normalized_levenshtein;

use crate::cache::{CanonicalKey, EventCache, MatchConfidence, MatchMapping};
use crate::target::{TargetAdapter, TargetTrackState};

use super::aggregate::CanonicalTrack;
use super::decision::DecisionProvider;
use super::error::SyncError;
use super::normalize::Normalizer;

/// Share of the combined score carried by the title.
const TITLE_WEIGHT: f64 = 0.7;
const ARTIST_WEIGHT: f64 = 0.3;
/// Fuzzy candidates whose artist is further off than this are never offered.
const MIN_ARTIST_SCORE: f64 = 0.7;

#[derive(Debug, Clone)]
pub struct MatchOptions {
    pub fuzzy: bool,
    pub threshold: f64,
    pub max_candidates: usize,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            fuzzy: false,
            threshold: 0.85,
            max_candidates: 5,
        }
    }
}

/// A near-miss offered to the operator.
#[derive(Debug, Clone)]
pub struct FuzzyCandidate {
    pub track: TargetTrackState,
    pub score: f64,
    pub artist_score: f64,
    pub title_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    NoCandidates,
    Declined,
    AlreadyClaimed,
}

#[derive(Debug, Clone)]
pub enum MatchOutcome {
    Matched {
        target: TargetTrackState,
        confidence: MatchConfidence,
    },
    Missing(MissReason),
}

pub struct Matcher<'a> {
    cache: &'a dyn EventCache,
    target: &'a dyn TargetAdapter,
    decisions: &'a dyn DecisionProvider,
    normalizer: &'a Normalizer,
    options: MatchOptions,
    /// Navidrome id -> key that bound it this run.
    claimed: HashMap<String, CanonicalKey>,
}

impl<'a> Matcher<'a> {
    pub fn new(
        cache: &'a dyn EventCache,
        target: &'a dyn TargetAdapter,
        decisions: &'a dyn DecisionProvider,
        normalizer: &'a Normalizer,
        options: MatchOptions,
    ) -> Self {
        Self {
            cache,
            target,
            decisions,
            normalizer,
            options,
            claimed: HashMap::new(),
        }
    }

    pub async fn resolve(&mut self, track: &CanonicalTrack) -> Result<MatchOutcome, SyncError> {
        if let Some(mapping) = self.cache.get_mapping(&track.key).await? {
            match self.target.read_state(&mapping.target_track_id).await? {
                Some(state) => {
                    if let Some(owner) = self.claimed.get(&state.id) {
                        tracing::warn!(
                            key = %track.key,
                            track_id = %state.id,
                            claimed_by = %owner,
                            "Stored mapping points at a track already matched this run"
                        );
                        return Ok(MatchOutcome::Missing(MissReason::AlreadyClaimed));
                    }
                    tracing::debug!(key = %track.key, track_id = %state.id, "Using stored mapping");
                    self.claim(&state.id, &track.key);
                    return Ok(MatchOutcome::Matched {
                        target: state,
                        confidence: mapping.confidence,
                    });
                }
                None => {
                    tracing::warn!(
                        key = %track.key,
                        track_id = %mapping.target_track_id,
                        "Mapped track no longer exists in Navidrome, matching again"
                    );
                    self.cache.remove_mapping(&track.key).await?;
                }
            }
        }

        let candidates: Vec<TargetTrackState> = self
            .target
            .search(&track.display_artist, &track.display_title)
            .await?
            .into_iter()
            .filter(|c| !self.claimed.contains_key(&c.id))
            .collect();

        let mut exact: Vec<&TargetTrackState> = candidates
            .iter()
            .filter(|c| self.normalizer.normalize(&c.artist, &c.title).key == track.key)
            .collect();
        if !exact.is_empty() {
            exact.sort_by(|a, b| a.id.cmp(&b.id));
            if exact.len() > 1 {
                tracing::info!(
                    key = %track.key,
                    candidates = exact.len(),
                    chosen = %exact[0].id,
                    "Several exact matches, using the lowest id"
                );
            }
            let chosen = exact[0].clone();
            self.bind(track, &chosen, MatchConfidence::Exact).await?;
            return Ok(MatchOutcome::Matched {
                target: chosen,
                confidence: MatchConfidence::Exact,
            });
        }

        if !self.options.fuzzy {
            return Ok(MatchOutcome::Missing(MissReason::NoCandidates));
        }

        let fuzzy = self.rank(&track.key, candidates);
        if fuzzy.is_empty() {
            return Ok(MatchOutcome::Missing(MissReason::NoCandidates));
        }

        let offered: BTreeSet<String> = fuzzy.iter().map(|c| c.track.id.clone()).collect();
        let declined = self.cache.get_declined(&track.key).await?.unwrap_or_default();
        if offered.is_subset(&declined) {
            tracing::debug!(key = %track.key, "Candidates were declined before, not asking again");
            return Ok(MatchOutcome::Missing(MissReason::Declined));
        }

        match self.decisions.confirm_match(track, &fuzzy).await? {
            Some(idx) if idx < fuzzy.len() => {
                let chosen = fuzzy[idx].track.clone();
                tracing::info!(
                    key = %track.key,
                    track_id = %chosen.id,
                    score = fuzzy[idx].score,
                    "Fuzzy match confirmed"
                );
                self.bind(track, &chosen, MatchConfidence::FuzzyConfirmed)
                    .await?;
                self.cache.clear_declined(&track.key).await?;
                Ok(MatchOutcome::Matched {
                    target: chosen,
                    confidence: MatchConfidence::FuzzyConfirmed,
                })
            }
            _ => {
                let memo: BTreeSet<String> = declined.union(&offered).cloned().collect();
                self.cache.save_declined(&track.key, &memo).await?;
                Ok(MatchOutcome::Missing(MissReason::Declined))
            }
        }
    }

    /// Score `candidates` against `key`, best first, keeping those above the
    /// artist floor and the configured threshold.
    fn rank(&self, key: &CanonicalKey, candidates: Vec<TargetTrackState>) -> Vec<FuzzyCandidate> {
        let mut scored: Vec<FuzzyCandidate> = candidates
            .into_iter()
            .filter_map(|c| {
                let other = self.normalizer.normalize(&c.artist, &c.title).key;
                let (score, artist_score, title_score) = similarity(key, &other);
                (artist_score >= MIN_ARTIST_SCORE && score >= self.options.threshold).then_some(
                    FuzzyCandidate {
                        track: c,
                        score,
                        artist_score,
                        title_score,
                    },
                )
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.track.id.cmp(&b.track.id))
        });
        scored.truncate(self.options.max_candidates);
        scored
    }

    async fn bind(
        &mut self,
        track: &CanonicalTrack,
        target: &TargetTrackState,
        confidence: MatchConfidence,
    ) -> Result<(), SyncError> {
        self.cache
            .save_mapping(&MatchMapping {
                key: track.key.clone(),
                target_track_id: target.id.clone(),
                confidence,
            })
            .await?;
        self.claim(&target.id, &track.key);
        Ok(())
    }

    fn claim(&mut self, track_id: &str, key: &CanonicalKey) {
        self.claimed.insert(track_id.to_string(), key.clone());
    }
}

/// `(combined, artist, title)` similarity between two folded keys, each in
/// `0.0..=1.0` and symmetric in its arguments.
pub fn similarity(a: &CanonicalKey, b: &CanonicalKey) -> (f64, f64, f64) {
    let artist = normalized_levenshtein(&a.artist, &b.artist);
    let title = normalized_levenshtein(&a.title, &b.title);
    (TITLE_WEIGHT * title + ARTIST_WEIGHT * artist, artist, title)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SqliteEventCache;
    use crate::engine::decision::{ConflictChoice, ScriptedDecisions};
    use crate::engine::testing::{track, FakeTarget};

    fn canonical(normalizer: &Normalizer, artist: &str, title: &str, plays: u64) -> CanonicalTrack {
        let n = normalizer.normalize(artist, title);
        CanonicalTrack {
            key: n.key,
            display_artist: n.display_artist,
            display_title: n.display_title,
            album: String::new(),
            play_count: plays,
            loved: false,
            timestamps: (1..=plays as i64).collect(),
        }
    }

    fn fuzzy() -> MatchOptions {
        MatchOptions {
            fuzzy: true,
            ..MatchOptions::default()
        }
    }

    #[test]
    fn test_similarity_symmetric_and_bounded() {
        let a = CanonicalKey::new("the beatles", "let it be");
        let b = CanonicalKey::new("beatles", "let it be remastered");
        assert_eq!(similarity(&a, &b), similarity(&b, &a));
        let (score, _, _) = similarity(&a, &b);
        assert!((0.0..=1.0).contains(&score));
        assert_eq!(similarity(&a, &a).0, 1.0);
    }

    #[tokio::test]
    async fn test_exact_match_persisted_without_prompt() {
        let cache = SqliteEventCache::open_in_memory().unwrap();
        let target = FakeTarget::new(vec![track("t1", "Blur", "Song 2", 3)], true);
        let decisions = ScriptedDecisions::new(ConflictChoice::Skip, true);
        let normalizer = Normalizer::default();
        let mut matcher = Matcher::new(&cache, &target, &decisions, &normalizer, fuzzy());

        let t = canonical(&normalizer, "blur", "song 2", 4);
        let outcome = matcher.resolve(&t).await.unwrap();
        assert!(matches!(
            outcome,
            MatchOutcome::Matched { ref target, confidence: MatchConfidence::Exact } if target.id == "t1"
        ));
        assert_eq!(decisions.prompts(), 0);
        let stored = cache.get_mapping(&t.key).await.unwrap().unwrap();
        assert_eq!(stored.target_track_id, "t1");
    }

    #[tokio::test]
    async fn test_several_exact_matches_pick_lowest_id() {
        let cache = SqliteEventCache::open_in_memory().unwrap();
        let target = FakeTarget::new(
            vec![track("t9", "Blur", "Song 2", 0), track("t2", "blur", "Song 2", 0)],
            true,
        );
        let decisions = ScriptedDecisions::new(ConflictChoice::Skip, true);
        let normalizer = Normalizer::default();
        let mut matcher =
            Matcher::new(&cache, &target, &decisions, &normalizer, MatchOptions::default());

        let outcome = matcher
            .resolve(&canonical(&normalizer, "Blur", "Song 2", 1))
            .await
            .unwrap();
        assert!(matches!(outcome, MatchOutcome::Matched { ref target, .. } if target.id == "t2"));
    }

    #[tokio::test]
    async fn test_fuzzy_confirmed_match_is_memoized() {
        let cache = SqliteEventCache::open_in_memory().unwrap();
        let target = FakeTarget::new(
            vec![track("t7", "The Great Hall and the Prophecies", "", 2)],
            true,
        );
        let normalizer = Normalizer::default();
        let t = canonical(&normalizer, "The Great Hall & The Prophecy", "", 5);
        assert_eq!(t.key, CanonicalKey::new("the great hall and the prophecy", ""));

        let first = ScriptedDecisions::new(ConflictChoice::Skip, true).accepting_match(0);
        let mut matcher = Matcher::new(&cache, &target, &first, &normalizer, fuzzy());
        let outcome = matcher.resolve(&t).await.unwrap();
        assert!(matches!(
            outcome,
            MatchOutcome::Matched { confidence: MatchConfidence::FuzzyConfirmed, .. }
        ));
        assert_eq!(first.prompts(), 1);

        // second run: same key, same candidates, no prompt
        let second = ScriptedDecisions::new(ConflictChoice::Skip, true);
        let mut matcher = Matcher::new(&cache, &target, &second, &normalizer, fuzzy());
        let outcome = matcher.resolve(&t).await.unwrap();
        assert!(matches!(
            outcome,
            MatchOutcome::Matched { ref target, confidence: MatchConfidence::FuzzyConfirmed }
                if target.id == "t7"
        ));
        assert_eq!(second.prompts(), 0);
    }

    #[tokio::test]
    async fn test_declined_candidates_not_offered_again() {
        let cache = SqliteEventCache::open_in_memory().unwrap();
        let target = FakeTarget::new(vec![track("t1", "Radiohead", "Creepy", 0)], true);
        let normalizer = Normalizer::default();
        let t = canonical(&normalizer, "Radiohead", "Creep", 3);

        let decisions = ScriptedDecisions::new(ConflictChoice::Skip, true);
        let mut matcher = Matcher::new(&cache, &target, &decisions, &normalizer, fuzzy());
        assert!(matches!(
            matcher.resolve(&t).await.unwrap(),
            MatchOutcome::Missing(MissReason::Declined)
        ));
        assert_eq!(decisions.prompts(), 1);

        let mut matcher = Matcher::new(&cache, &target, &decisions, &normalizer, fuzzy());
        assert!(matches!(
            matcher.resolve(&t).await.unwrap(),
            MatchOutcome::Missing(MissReason::Declined)
        ));
        assert_eq!(decisions.prompts(), 1);
    }

    #[tokio::test]
    async fn test_fuzzy_disabled_reports_missing() {
        let cache = SqliteEventCache::open_in_memory().unwrap();
        let target = FakeTarget::new(vec![track("t1", "Radiohead", "Creepy", 0)], true);
        let decisions = ScriptedDecisions::new(ConflictChoice::Skip, true).accepting_match(0);
        let normalizer = Normalizer::default();
        let mut matcher =
            Matcher::new(&cache, &target, &decisions, &normalizer, MatchOptions::default());
        let outcome = matcher
            .resolve(&canonical(&normalizer, "Radiohead", "Creep", 1))
            .await
            .unwrap();
        assert!(matches!(outcome, MatchOutcome::Missing(MissReason::NoCandidates)));
        assert_eq!(decisions.prompts(), 0);
    }

    #[tokio::test]
    async fn test_stale_mapping_falls_through() {
        let cache = SqliteEventCache::open_in_memory().unwrap();
        let target = FakeTarget::new(vec![track("t2", "Blur", "Song 2", 0)], true);
        let normalizer = Normalizer::default();
        let t = canonical(&normalizer, "Blur", "Song 2", 1);
        cache
            .save_mapping(&MatchMapping {
                key: t.key.clone(),
                target_track_id: "gone".into(),
                confidence: MatchConfidence::FuzzyConfirmed,
            })
            .await
            .unwrap();

        let decisions = ScriptedDecisions::new(ConflictChoice::Skip, true);
        let mut matcher =
            Matcher::new(&cache, &target, &decisions, &normalizer, MatchOptions::default());
        let outcome = matcher.resolve(&t).await.unwrap();
        assert!(matches!(outcome, MatchOutcome::Matched { ref target, .. } if target.id == "t2"));
        assert_eq!(
            cache.get_mapping(&t.key).await.unwrap().unwrap().target_track_id,
            "t2"
        );
    }

    #[tokio::test]
    async fn test_first_key_keeps_a_shared_track() {
        let cache = SqliteEventCache::open_in_memory().unwrap();
        let target = FakeTarget::new(vec![track("t1", "Blur", "Song 2", 0)], true);
        let normalizer = Normalizer::default();
        let first = canonical(&normalizer, "Blur", "Song 2", 1);
        let second = canonical(&normalizer, "Blur", "Song Two", 1);
        cache
            .save_mapping(&MatchMapping {
                key: second.key.clone(),
                target_track_id: "t1".into(),
                confidence: MatchConfidence::FuzzyConfirmed,
            })
            .await
            .unwrap();

        let decisions = ScriptedDecisions::new(ConflictChoice::Skip, true);
        let mut matcher = Matcher::new(&cache, &target, &decisions, &normalizer, fuzzy());
        assert!(matches!(
            matcher.resolve(&first).await.unwrap(),
            MatchOutcome::Matched { .. }
        ));
        assert!(matches!(
            matcher.resolve(&second).await.unwrap(),
            MatchOutcome::Missing(MissReason::AlreadyClaimed)
        ));
    }
}
