//! Operator decisions: fuzzy-match confirmation, count conflicts, the final
//! go-ahead and Navidrome user selection.
//!
//! The matcher and reconciler only see [`DecisionProvider`]. A terminal run
//! uses [`TerminalDecisions`]; unattended runs and tests use
//! [`ScriptedDecisions`], which answers from fixed settings.

use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use indicatif::ProgressBar;
use thiserror::Error;

use crate::target::{TargetTrackState, TargetUser};
use crate::types::ConflictPolicy;

use super::aggregate::CanonicalTrack;
use super::matcher::FuzzyCandidate;

#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("Failed to read operator input: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to spawn prompt task: {0}")]
    Spawn(#[from] tokio::task::JoinError),

    #[error("Standard input closed while waiting for an answer")]
    Closed,

    #[error("Cannot {0} without an interactive terminal")]
    NonInteractive(&'static str),
}

/// Resolution of a single play-count conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictChoice {
    /// Use the Last.fm count.
    Source,
    /// Keep the Navidrome count.
    Target,
    /// Use the larger of the two.
    Higher,
    /// Add Last.fm plays not yet counted on top of Navidrome.
    Increment,
    /// Leave the track alone and record nothing.
    Skip,
}

impl ConflictChoice {
    /// The fixed choice a non-interactive policy stands for. `Ask` has none.
    pub fn from_policy(policy: ConflictPolicy) -> Option<Self> {
        match policy {
            ConflictPolicy::Ask => None,
            ConflictPolicy::Navidrome => Some(Self::Target),
            ConflictPolicy::Lastfm => Some(Self::Source),
            ConflictPolicy::Higher => Some(Self::Higher),
            ConflictPolicy::Increment => Some(Self::Increment),
        }
    }

    /// Resulting Navidrome count, or `None` for [`ConflictChoice::Skip`].
    ///
    /// `already_counted` is how many Last.fm plays an earlier increment for the
    /// same track has already added.
    pub fn apply(self, source: u64, target: u64, already_counted: u64) -> Option<u64> {
        match self {
            Self::Source => Some(source),
            Self::Target => Some(target),
            Self::Higher => Some(source.max(target)),
            Self::Increment => Some(target + source.saturating_sub(already_counted)),
            Self::Skip => None,
        }
    }
}

#[async_trait]
pub trait DecisionProvider: Send + Sync {
    /// Pick one of `candidates` for `track`, or `None` to decline them all.
    async fn confirm_match(
        &self,
        track: &CanonicalTrack,
        candidates: &[FuzzyCandidate],
    ) -> Result<Option<usize>, DecisionError>;

    /// Navidrome has at least as many plays as Last.fm; decide what to keep.
    async fn resolve_conflict(
        &self,
        track: &CanonicalTrack,
        target: &TargetTrackState,
    ) -> Result<ConflictChoice, DecisionError>;

    /// Yes/no question, default no.
    async fn confirm(&self, question: &str) -> Result<bool, DecisionError>;

    /// Index into `users` of the account to sync. `users` is never empty.
    async fn choose_user(&self, users: &[TargetUser]) -> Result<usize, DecisionError>;
}

/// Prompts on stdin/stdout, pausing the progress bar while waiting.
pub struct TerminalDecisions {
    assume_yes: bool,
    bar: ProgressBar,
}

impl TerminalDecisions {
    pub fn new(assume_yes: bool, bar: ProgressBar) -> Self {
        Self { assume_yes, bar }
    }

    /// Print `text` and read one trimmed line.
    async fn ask(&self, text: String) -> Result<String, DecisionError> {
        let bar = self.bar.clone();
        tokio::task::spawn_blocking(move || {
            bar.suspend(|| {
                print!("{}", text);
                io::stdout().flush()?;
                let mut line = String::new();
                if io::stdin().read_line(&mut line)? == 0 {
                    return Err(DecisionError::Closed);
                }
                Ok(line.trim().to_string())
            })
        })
        .await?
    }
}

fn describe_track(track: &CanonicalTrack) -> String {
    let loved = if track.loved { ", loved" } else { "" };
    format!(
        "{} - {} ({} scrobbles{})",
        track.display_artist, track.display_title, track.play_count, loved
    )
}

fn candidate_line(number: usize, c: &FuzzyCandidate) -> String {
    format!(
        "  [{}] {} - {} [{}] ({} plays, similarity {:.0}%: artist {:.0}%, title {:.0}%)\n",
        number,
        c.track.artist,
        c.track.title,
        c.track.album,
        c.track.play_count,
        c.score * 100.0,
        c.artist_score * 100.0,
        c.title_score * 100.0
    )
}

/// Parse a conflict answer. Empty input keeps Navidrome.
fn parse_conflict_choice(answer: &str) -> Option<ConflictChoice> {
    match answer.to_ascii_lowercase().as_str() {
        "" | "n" | "navidrome" | "t" | "target" => Some(ConflictChoice::Target),
        "l" | "lastfm" | "s" | "source" => Some(ConflictChoice::Source),
        "h" | "higher" => Some(ConflictChoice::Higher),
        "i" | "increment" => Some(ConflictChoice::Increment),
        "k" | "skip" => Some(ConflictChoice::Skip),
        _ => None,
    }
}

/// Parse a `0..=count` selection; `0` or empty declines.
fn parse_selection(answer: &str, count: usize) -> Option<Option<usize>> {
    if answer.is_empty() || answer == "0" {
        return Some(None);
    }
    match answer.parse::<usize>() {
        Ok(n) if (1..=count).contains(&n) => Some(Some(n - 1)),
        _ => None,
    }
}

#[async_trait]
impl DecisionProvider for TerminalDecisions {
    async fn confirm_match(
        &self,
        track: &CanonicalTrack,
        candidates: &[FuzzyCandidate],
    ) -> Result<Option<usize>, DecisionError> {
        let mut text = format!("\nFuzzy match for Last.fm: {}\n", describe_track(track));
        for (idx, c) in candidates.iter().enumerate() {
            text.push_str(&candidate_line(idx + 1, c));
        }
        text.push_str("  [0] None of these (skip)\n");
        let prompt = format!("Select match [0-{}]: ", candidates.len());

        let mut header = Some(text);
        loop {
            let shown = match header.take() {
                Some(h) => h + &prompt,
                None => prompt.clone(),
            };
            let answer = self.ask(shown).await?;
            if let Some(choice) = parse_selection(&answer, candidates.len()) {
                return Ok(choice);
            }
            println!(
                "Invalid choice. Enter a number between 0 and {}.",
                candidates.len()
            );
        }
    }

    async fn resolve_conflict(
        &self,
        track: &CanonicalTrack,
        target: &TargetTrackState,
    ) -> Result<ConflictChoice, DecisionError> {
        let mut text = format!(
            "\n{} - {}\n  Navidrome: {} | Last.fm: {}\n",
            track.display_artist, track.display_title, target.play_count, track.play_count
        );
        text.push_str(
            "Keep (N)avidrome, use (L)ast.fm, (H)igher, (I)ncrement or s(K)ip? [N/L/H/I/K, default=N]: ",
        );
        let mut shown = text;
        loop {
            let answer = self.ask(shown).await?;
            if let Some(choice) = parse_conflict_choice(&answer) {
                return Ok(choice);
            }
            shown = "Please answer N, L, H, I or K: ".to_string();
        }
    }

    async fn confirm(&self, question: &str) -> Result<bool, DecisionError> {
        if self.assume_yes {
            return Ok(true);
        }
        let answer = self.ask(format!("{} [y/N]: ", question)).await?;
        Ok(matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes"))
    }

    async fn choose_user(&self, users: &[TargetUser]) -> Result<usize, DecisionError> {
        let mut text = String::from("Multiple Navidrome users found:\n");
        for (idx, user) in users.iter().enumerate() {
            text.push_str(&format!("  {}: {} ({})\n", idx + 1, user.user_name, user.id));
        }
        text.push_str("Select the user to sync [1]: ");
        let answer = self.ask(text).await?;
        if answer.is_empty() {
            return Ok(0);
        }
        match answer.parse::<usize>() {
            Ok(n) if (1..=users.len()).contains(&n) => Ok(n - 1),
            _ => {
                tracing::warn!(answer = %answer, "Invalid selection, using the first user");
                Ok(0)
            }
        }
    }
}

/// Fixed answers for unattended runs and tests.
///
/// Fuzzy candidates are declined unless `match_choice` is set, conflicts get
/// `conflict`, and `confirm` returns `proceed`. Every question asked is
/// counted.
pub struct ScriptedDecisions {
    conflict: ConflictChoice,
    match_choice: Option<usize>,
    proceed: bool,
    user: Option<usize>,
    prompts: AtomicUsize,
}

impl ScriptedDecisions {
    pub fn new(conflict: ConflictChoice, proceed: bool) -> Self {
        Self {
            conflict,
            match_choice: None,
            proceed,
            user: None,
            prompts: AtomicUsize::new(0),
        }
    }

    /// Accept the candidate at `index` whenever a fuzzy match is offered.
    pub fn accepting_match(mut self, index: usize) -> Self {
        self.match_choice = Some(index);
        self
    }

    pub fn with_user(mut self, index: usize) -> Self {
        self.user = Some(index);
        self
    }

    /// Questions answered so far.
    pub fn prompts(&self) -> usize {
        self.prompts.load(Ordering::Relaxed)
    }

    fn count(&self) {
        self.prompts.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl DecisionProvider for ScriptedDecisions {
    async fn confirm_match(
        &self,
        track: &CanonicalTrack,
        candidates: &[FuzzyCandidate],
    ) -> Result<Option<usize>, DecisionError> {
        self.count();
        let choice = self.match_choice.filter(|idx| *idx < candidates.len());
        tracing::debug!(
            key = %track.key,
            candidates = candidates.len(),
            accepted = choice.is_some(),
            "Scripted fuzzy match answer"
        );
        Ok(choice)
    }

    async fn resolve_conflict(
        &self,
        _track: &CanonicalTrack,
        _target: &TargetTrackState,
    ) -> Result<ConflictChoice, DecisionError> {
        self.count();
        Ok(self.conflict)
    }

    async fn confirm(&self, question: &str) -> Result<bool, DecisionError> {
        self.count();
        tracing::debug!(question, answer = self.proceed, "Scripted confirmation");
        Ok(self.proceed)
    }

    async fn choose_user(&self, users: &[TargetUser]) -> Result<usize, DecisionError> {
        self.count();
        match self.user {
            Some(idx) if idx < users.len() => Ok(idx),
            _ if users.len() == 1 => Ok(0),
            _ => Err(DecisionError::NonInteractive(
                "choose between several Navidrome users (set NAVIDROME_USER)",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_table_source_10_target_20() {
        let apply = |policy| {
            ConflictChoice::from_policy(policy)
                .and_then(|c| c.apply(10, 20, 0))
        };
        assert_eq!(apply(ConflictPolicy::Navidrome), Some(20));
        assert_eq!(apply(ConflictPolicy::Lastfm), Some(10));
        assert_eq!(apply(ConflictPolicy::Higher), Some(20));
        assert_eq!(apply(ConflictPolicy::Increment), Some(30));
        assert_eq!(apply(ConflictPolicy::Ask), None);
    }

    #[test]
    fn test_increment_only_adds_uncounted_plays() {
        assert_eq!(ConflictChoice::Increment.apply(12, 30, 10), Some(32));
        assert_eq!(ConflictChoice::Increment.apply(10, 30, 10), Some(30));
        assert_eq!(ConflictChoice::Skip.apply(10, 20, 0), None);
    }

    #[test]
    fn test_parse_conflict_choice() {
        assert_eq!(parse_conflict_choice(""), Some(ConflictChoice::Target));
        assert_eq!(parse_conflict_choice("L"), Some(ConflictChoice::Source));
        assert_eq!(parse_conflict_choice("h"), Some(ConflictChoice::Higher));
        assert_eq!(parse_conflict_choice("i"), Some(ConflictChoice::Increment));
        assert_eq!(parse_conflict_choice("k"), Some(ConflictChoice::Skip));
        assert_eq!(parse_conflict_choice("maybe"), None);
    }

    #[test]
    fn test_parse_selection() {
        assert_eq!(parse_selection("", 3), Some(None));
        assert_eq!(parse_selection("0", 3), Some(None));
        assert_eq!(parse_selection("2", 3), Some(Some(1)));
        assert_eq!(parse_selection("4", 3), None);
        assert_eq!(parse_selection("x", 3), None);
    }

    #[test]
    fn test_candidate_line_shows_scores() {
        let c = FuzzyCandidate {
            track: TargetTrackState {
                id: "t7".into(),
                artist: "The Great Hall".into(),
                title: "Prophecies".into(),
                album: "Ruins".into(),
                play_count: 3,
                starred: false,
                play_date: None,
            },
            score: 0.912,
            artist_score: 1.0,
            title_score: 0.874,
        };
        assert_eq!(
            candidate_line(2, &c),
            "  [2] The Great Hall - Prophecies [Ruins] (3 plays, similarity 91%: artist 100%, title 87%)\n"
        );
    }

    fn users(n: usize) -> Vec<TargetUser> {
        (0..n)
            .map(|i| TargetUser {
                id: format!("u{}", i),
                user_name: format!("user{}", i),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_scripted_user_choice() {
        let d = ScriptedDecisions::new(ConflictChoice::Skip, false);
        assert_eq!(d.choose_user(&users(1)).await.unwrap(), 0);
        assert!(matches!(
            d.choose_user(&users(2)).await,
            Err(DecisionError::NonInteractive(_))
        ));
        let d = d.with_user(1);
        assert_eq!(d.choose_user(&users(2)).await.unwrap(), 1);
        assert_eq!(d.prompts(), 3);
    }

    #[tokio::test]
    async fn test_scripted_confirm() {
        assert!(ScriptedDecisions::new(ConflictChoice::Skip, true)
            .confirm("Proceed?")
            .await
            .unwrap());
        assert!(!ScriptedDecisions::new(ConflictChoice::Skip, false)
            .confirm("Proceed?")
            .await
            .unwrap());
    }
}
