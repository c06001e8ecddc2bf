//! Last.fm JSON payloads.
//!
//! The service encodes numbers as strings and collapses single-element lists
//! into bare objects, so most fields are lenient.

use serde::Deserialize;
use serde_json::Value;

use crate::cache::ScrobbleEvent;

/// Error envelope returned with HTTP 200 or 4xx.
#[derive(Debug, Deserialize)]
pub struct ApiErrorResponse {
    pub error: u32,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct RecentTracksResponse {
    pub recenttracks: TrackList,
}

#[derive(Debug, Deserialize)]
pub struct LovedTracksResponse {
    pub lovedtracks: TrackList,
}

#[derive(Debug, Deserialize)]
pub struct TrackList {
    #[serde(default)]
    pub track: OneOrMany,
    #[serde(rename = "@attr", default)]
    pub attr: PageAttr,
}

/// Tracks are kept as raw JSON so one bad entry does not sink the page.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    Many(Vec<Value>),
    One(Value),
}

impl Default for OneOrMany {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl OneOrMany {
    pub fn into_vec(self) -> Vec<Value> {
        match self {
            Self::Many(v) => v,
            Self::One(Value::Null) => Vec::new(),
            Self::One(v) => vec![v],
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageAttr {
    #[serde(default)]
    pub page: Option<Value>,
    #[serde(default)]
    pub total_pages: Option<Value>,
}

impl PageAttr {
    pub fn total_pages(&self) -> u32 {
        self.total_pages
            .as_ref()
            .and_then(number_from_value)
            .map(|n| n as u32)
            .unwrap_or(1)
    }
}

/// A track entry in either list.
#[derive(Debug, Deserialize)]
pub struct RawTrack {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mbid: Option<String>,
    #[serde(default)]
    pub artist: Option<NameField>,
    #[serde(default)]
    pub album: Option<NameField>,
    #[serde(default)]
    pub date: Option<DateField>,
    #[serde(rename = "@attr", default)]
    pub attr: Option<TrackAttr>,
}

/// `{"#text": ..}` in the basic payload, `{"name": ..}` with `extended=1`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum NameField {
    Object {
        #[serde(default)]
        name: Option<String>,
        #[serde(rename = "#text", default)]
        text: Option<String>,
    },
    Plain(String),
}

impl NameField {
    pub fn value(&self) -> &str {
        match self {
            Self::Object { name, text } => name
                .as_deref()
                .filter(|s| !s.is_empty())
                .or(text.as_deref())
                .unwrap_or(""),
            Self::Plain(s) => s,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DateField {
    pub uts: Value,
}

#[derive(Debug, Deserialize)]
pub struct TrackAttr {
    #[serde(default)]
    pub nowplaying: Option<String>,
}

fn number_from_value(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Why a track entry was not turned into an event.
#[derive(Debug, PartialEq, Eq)]
pub enum Rejected {
    /// Currently-playing entry; not a completed scrobble.
    NowPlaying,
    Malformed(String),
}

impl RawTrack {
    pub fn artist_name(&self) -> &str {
        self.artist.as_ref().map(NameField::value).unwrap_or("").trim()
    }

    pub fn into_event(self) -> Result<ScrobbleEvent, Rejected> {
        let now_playing = self
            .attr
            .as_ref()
            .and_then(|a| a.nowplaying.as_deref())
            .is_some_and(|v| v == "true");

        let timestamp = match self.date.as_ref().and_then(|d| number_from_value(&d.uts)) {
            Some(ts) => ts,
            None if now_playing || self.date.is_none() => return Err(Rejected::NowPlaying),
            None => return Err(Rejected::Malformed("unparseable date".into())),
        };

        let artist = self.artist_name().to_string();
        let title = self.name.trim().to_string();
        if artist.is_empty() || title.is_empty() {
            return Err(Rejected::Malformed(format!(
                "missing artist or title at {}",
                timestamp
            )));
        }

        let album = self
            .album
            .as_ref()
            .map(|a| a.value().trim().to_string())
            .unwrap_or_default();

        Ok(ScrobbleEvent {
            artist,
            title,
            album,
            timestamp,
            source_id: self.mbid.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_tracks_extended_page() {
        let json = r##"{
            "recenttracks": {
                "track": [
                    {
                        "name": "Song 2",
                        "mbid": "abc",
                        "artist": {"name": "Blur", "mbid": ""},
                        "album": {"#text": "Blur"},
                        "@attr": {"nowplaying": "true"}
                    },
                    {
                        "name": "Song 2",
                        "mbid": "abc",
                        "artist": {"name": "Blur", "mbid": ""},
                        "album": {"#text": "Blur"},
                        "date": {"uts": "1700000000", "#text": "14 Nov 2023"}
                    }
                ],
                "@attr": {"page": "1", "totalPages": "7", "total": "1300"}
            }
        }"##;
        let resp: RecentTracksResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.recenttracks.attr.total_pages(), 7);

        let tracks = resp.recenttracks.track.into_vec();
        assert_eq!(tracks.len(), 2);

        let first: RawTrack = serde_json::from_value(tracks[0].clone()).unwrap();
        assert_eq!(first.into_event(), Err(Rejected::NowPlaying));

        let second: RawTrack = serde_json::from_value(tracks[1].clone()).unwrap();
        let event = second.into_event().unwrap();
        assert_eq!(event.artist, "Blur");
        assert_eq!(event.title, "Song 2");
        assert_eq!(event.album, "Blur");
        assert_eq!(event.timestamp, 1_700_000_000);
        assert_eq!(event.source_id, "abc");
    }

    #[test]
    fn test_single_track_collapsed_to_object() {
        let json = r##"{
            "lovedtracks": {
                "track": {"name": "Tender", "artist": {"name": "Blur"}, "date": {"uts": "1"}},
                "@attr": {"totalPages": "1"}
            }
        }"##;
        let resp: LovedTracksResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.lovedtracks.track.into_vec().len(), 1);
    }

    #[test]
    fn test_empty_list() {
        let json = r#"{"recenttracks": {"track": [], "@attr": {"totalPages": "0"}}}"#;
        let resp: RecentTracksResponse = serde_json::from_str(json).unwrap();
        assert!(resp.recenttracks.track.into_vec().is_empty());
        assert_eq!(resp.recenttracks.attr.total_pages(), 0);
    }

    #[test]
    fn test_basic_artist_text_field() {
        let raw: RawTrack = serde_json::from_str(
            r##"{"name": "X", "artist": {"#text": "Y"}, "date": {"uts": 5}}"##,
        )
        .unwrap();
        assert_eq!(raw.artist_name(), "Y");
        assert_eq!(raw.into_event().unwrap().timestamp, 5);
    }

    #[test]
    fn test_missing_artist_is_malformed() {
        let raw: RawTrack =
            serde_json::from_str(r#"{"name": "X", "date": {"uts": "5"}}"#).unwrap();
        assert!(matches!(raw.into_event(), Err(Rejected::Malformed(_))));
    }

    #[test]
    fn test_api_error_envelope() {
        let e: ApiErrorResponse =
            serde_json::from_str(r#"{"error": 6, "message": "User not found"}"#).unwrap();
        assert_eq!(e.error, 6);
        assert_eq!(e.message, "User not found");
    }
}
