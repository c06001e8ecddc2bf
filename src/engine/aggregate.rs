//! Per-track play counts from the cached scrobble history.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::cache::{CanonicalKey, ScrobbleEvent};

use super::normalize::Normalizer;

/// Aggregated view of one canonical track. Recomputed every run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalTrack {
    pub key: CanonicalKey,
    /// Display fields come from the most recent play.
    pub display_artist: String,
    pub display_title: String,
    pub album: String,
    pub play_count: u64,
    pub loved: bool,
    /// Play timestamps, ascending.
    pub timestamps: Vec<i64>,
}

impl CanonicalTrack {
    pub fn last_played(&self) -> Option<i64> {
        self.timestamps.last().copied()
    }
}

/// Group events by canonical key and merge in loved flags.
///
/// The result depends only on the multiset of inputs: events are deduplicated
/// on `(artist, title, timestamp)` and display-string ties are broken
/// lexically, so input order never matters.
pub fn aggregate(
    events: &[ScrobbleEvent],
    loved: &HashMap<(String, String), bool>,
    normalizer: &Normalizer,
) -> BTreeMap<CanonicalKey, CanonicalTrack> {
    let mut tracks: BTreeMap<CanonicalKey, CanonicalTrack> = BTreeMap::new();
    // (timestamp, artist, title, album) of the event the display fields came from.
    let mut display_source: HashMap<CanonicalKey, (i64, String, String, String)> = HashMap::new();
    let mut seen: HashSet<(&str, &str, i64)> = HashSet::with_capacity(events.len());

    for event in events {
        if !seen.insert((event.artist.as_str(), event.title.as_str(), event.timestamp)) {
            continue;
        }
        let n = normalizer.normalize(&event.artist, &event.title);
        let candidate = (
            event.timestamp,
            n.display_artist.clone(),
            n.display_title.clone(),
            event.album.clone(),
        );

        let entry = tracks
            .entry(n.key.clone())
            .or_insert_with(|| CanonicalTrack {
                key: n.key.clone(),
                display_artist: n.display_artist.clone(),
                display_title: n.display_title.clone(),
                album: event.album.clone(),
                play_count: 0,
                loved: false,
                timestamps: Vec::new(),
            });
        entry.play_count += 1;
        entry.timestamps.push(event.timestamp);

        let replace = display_source
            .get(&n.key)
            .map_or(true, |current| candidate > *current);
        if replace {
            entry.display_artist = candidate.1.clone();
            entry.display_title = candidate.2.clone();
            entry.album = candidate.3.clone();
            display_source.insert(n.key, candidate);
        }
    }

    for track in tracks.values_mut() {
        track.timestamps.sort_unstable();
    }

    // Sorted so loved-only entries get deterministic display strings.
    let mut loved_pairs: Vec<&(String, String)> = loved
        .iter()
        .filter(|(_, is_loved)| **is_loved)
        .map(|(pair, _)| pair)
        .collect();
    loved_pairs.sort();

    for (artist, title) in loved_pairs {
        let n = normalizer.normalize(artist, title);
        tracks
            .entry(n.key.clone())
            .or_insert_with(|| CanonicalTrack {
                key: n.key,
                display_artist: n.display_artist,
                display_title: n.display_title,
                album: String::new(),
                play_count: 0,
                loved: false,
                timestamps: Vec::new(),
            })
            .loved = true;
    }

    tracks
}
