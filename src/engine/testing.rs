//! In-memory stand-ins for Last.fm and Navidrome used by engine tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::cache::ScrobbleEvent;
use crate::lastfm::{LastfmError, RecentPage, ScrobbleSource};
use crate::target::{TargetAdapter, TargetError, TargetTrackState};
use crate::types::AccessMode;

use super::normalize::tokens;

pub struct FakeSource {
    history: Vec<ScrobbleEvent>,
    page_size: usize,
    fail_on_page: Mutex<Option<u32>>,
    garbled_page: Mutex<Option<(u32, u64)>>,
    loved: Vec<(String, String)>,
    can_love: bool,
    pub loved_calls: Mutex<Vec<(String, String)>>,
    pub pages_served: Mutex<Vec<(i64, u32)>>,
}

impl FakeSource {
    pub fn new(history: Vec<ScrobbleEvent>, page_size: usize) -> Self {
        Self {
            history,
            page_size,
            fail_on_page: Mutex::new(None),
            garbled_page: Mutex::new(None),
            loved: Vec::new(),
            can_love: false,
            loved_calls: Mutex::new(Vec::new()),
            pages_served: Mutex::new(Vec::new()),
        }
    }

    pub fn with_loved(mut self, loved: &[(&str, &str)]) -> Self {
        self.loved = loved
            .iter()
            .map(|(a, t)| (a.to_string(), t.to_string()))
            .collect();
        self
    }

    pub fn with_love_support(mut self) -> Self {
        self.can_love = true;
        self
    }

    /// Make `page` fail with a 503 until cleared.
    pub fn fail_on(&self, page: Option<u32>) {
        *self.fail_on_page.lock().unwrap() = page;
    }

    /// Serve `page` with no events and `malformed` skipped entries.
    pub fn garble(&self, page: u32, malformed: u64) {
        *self.garbled_page.lock().unwrap() = Some((page, malformed));
    }
}

#[async_trait]
impl ScrobbleSource for FakeSource {
    async fn recent_page(&self, since: i64, page: u32) -> Result<RecentPage, LastfmError> {
        self.pages_served.lock().unwrap().push((since, page));
        if *self.fail_on_page.lock().unwrap() == Some(page) {
            return Err(LastfmError::HttpStatus {
                method: "user.getRecentTracks",
                status: 503,
            });
        }
        let mut newer: Vec<ScrobbleEvent> = self
            .history
            .iter()
            .filter(|e| e.timestamp > since)
            .cloned()
            .collect();
        newer.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let total_pages = newer.len().div_ceil(self.page_size).max(1) as u32;
        let events = newer
            .chunks(self.page_size)
            .nth(page as usize - 1)
            .map(<[_]>::to_vec)
            .unwrap_or_default();
        if let Some((garbled, malformed)) = *self.garbled_page.lock().unwrap() {
            if garbled == page {
                return Ok(RecentPage {
                    events: Vec::new(),
                    total_pages,
                    malformed,
                });
            }
        }
        Ok(RecentPage {
            events,
            total_pages,
            malformed: 0,
        })
    }

    async fn loved_tracks(&self) -> Result<Vec<(String, String)>, LastfmError> {
        Ok(self.loved.clone())
    }

    async fn love(&self, artist: &str, title: &str) -> Result<(), LastfmError> {
        self.loved_calls
            .lock()
            .unwrap()
            .push((artist.to_string(), title.to_string()));
        Ok(())
    }

    fn can_love(&self) -> bool {
        self.can_love
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeWrite {
    Count { id: String, count: u64 },
    Star(String),
}

pub struct FakeTarget {
    tracks: Mutex<BTreeMap<String, TargetTrackState>>,
    supports_decrease: bool,
    short_by: Mutex<u64>,
    pub writes: Mutex<Vec<FakeWrite>>,
    pub finished: Mutex<u32>,
}

pub fn track(id: &str, artist: &str, title: &str, play_count: u64) -> TargetTrackState {
    TargetTrackState {
        id: id.to_string(),
        artist: artist.to_string(),
        title: title.to_string(),
        album: String::new(),
        play_count,
        starred: false,
        play_date: None,
    }
}

impl FakeTarget {
    pub fn new(tracks: Vec<TargetTrackState>, supports_decrease: bool) -> Self {
        Self {
            tracks: Mutex::new(tracks.into_iter().map(|t| (t.id.clone(), t)).collect()),
            supports_decrease,
            short_by: Mutex::new(0),
            writes: Mutex::new(Vec::new()),
            finished: Mutex::new(0),
        }
    }

    pub fn state(&self, id: &str) -> Option<TargetTrackState> {
        self.tracks.lock().unwrap().get(id).cloned()
    }

    pub fn remove(&self, id: &str) {
        self.tracks.lock().unwrap().remove(id);
    }

    pub fn writes(&self) -> Vec<FakeWrite> {
        self.writes.lock().unwrap().clone()
    }

    /// The next increase lands `plays` short of the requested count, like
    /// scrobbles the server refused.
    pub fn lose_plays(&self, plays: u64) {
        *self.short_by.lock().unwrap() = plays;
    }
}

#[async_trait]
impl TargetAdapter for FakeTarget {
    fn mode(&self) -> AccessMode {
        if self.supports_decrease {
            AccessMode::Database
        } else {
            AccessMode::Api
        }
    }

    fn supports_decrease(&self) -> bool {
        self.supports_decrease
    }

    async fn read_state(&self, track_id: &str) -> Result<Option<TargetTrackState>, TargetError> {
        Ok(self.state(track_id))
    }

    async fn search(
        &self,
        artist: &str,
        title: &str,
    ) -> Result<Vec<TargetTrackState>, TargetError> {
        let wanted: HashSet<String> = tokens(artist).into_iter().chain(tokens(title)).collect();
        Ok(self
            .tracks
            .lock()
            .unwrap()
            .values()
            .filter(|t| {
                tokens(&t.artist)
                    .into_iter()
                    .chain(tokens(&t.title))
                    .any(|w| wanted.contains(&w))
            })
            .cloned()
            .collect())
    }

    async fn apply_count(
        &self,
        track: &TargetTrackState,
        new_count: u64,
        timestamps: &[i64],
    ) -> Result<u64, TargetError> {
        let mut tracks = self.tracks.lock().unwrap();
        let current = tracks
            .get_mut(&track.id)
            .ok_or_else(|| TargetError::InvalidResponse {
                endpoint: "fake",
                detail: format!("no track {}", track.id),
            })?;
        if new_count < current.play_count && !self.supports_decrease {
            return Err(TargetError::DecreaseUnsupported {
                track_id: track.id.clone(),
                current: current.play_count,
                requested: new_count,
            });
        }
        let reached = if new_count > current.play_count {
            let lost = std::mem::take(&mut *self.short_by.lock().unwrap());
            new_count.saturating_sub(lost).max(current.play_count)
        } else {
            new_count
        };
        current.play_count = reached;
        if let Some(&last) = timestamps.last() {
            current.play_date = Some(current.play_date.map_or(last, |d| d.max(last)));
        }
        self.writes.lock().unwrap().push(FakeWrite::Count {
            id: track.id.clone(),
            count: reached,
        });
        Ok(reached)
    }

    async fn apply_star(&self, track_id: &str) -> Result<(), TargetError> {
        if let Some(t) = self.tracks.lock().unwrap().get_mut(track_id) {
            t.starred = true;
        }
        self.writes
            .lock()
            .unwrap()
            .push(FakeWrite::Star(track_id.to_string()));
        Ok(())
    }

    async fn finish(&self) -> Result<(), TargetError> {
        *self.finished.lock().unwrap() += 1;
        Ok(())
    }
}
