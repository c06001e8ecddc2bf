//! Artist/title canonicalization.
//!
//! Display strings are kept as reported; only the [`CanonicalKey`] is folded.

use std::sync::LazyLock;

use regex::Regex;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::cache::CanonicalKey;

/// Collaboration separators: `feat.`, `ft.`, `featuring`, `&`, `/`, `-`,
/// `with`, the Dutch/German `met`/`mit`, plus comma and semicolon lists.
static SEPARATORS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s*[,;]\s+|\s+(?:feat\.?|ft\.?|featuring|&|/|-|mit|met|with)\s+")
        .expect("valid separator pattern")
});

/// Output of [`Normalizer::normalize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    /// Artist after first-artist extraction, original casing.
    pub display_artist: String,
    pub display_title: String,
    pub key: CanonicalKey,
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    first_artist_only: bool,
    whitelist: Vec<String>,
}

impl Normalizer {
    pub fn new(first_artist_only: bool, whitelist: Vec<String>) -> Self {
        let whitelist = whitelist
            .into_iter()
            .map(|w| w.trim().to_string())
            .filter(|w| !w.is_empty())
            .collect();
        Self {
            first_artist_only,
            whitelist,
        }
    }

    pub fn normalize(&self, artist: &str, title: &str) -> Normalized {
        let display_artist = self.first_artist(artist);
        let display_title = title.trim().to_string();
        let key = CanonicalKey::new(fold(&display_artist), fold(&display_title));
        Normalized {
            display_artist,
            display_title,
            key,
        }
    }

    /// Reduce a collaboration credit to its lead artist.
    ///
    /// A whitelist entry (case-sensitive) is never split: an exact match is
    /// returned verbatim, and a credit that starts with an entry followed by a
    /// separator reduces to that entry.
    pub fn first_artist(&self, artist: &str) -> String {
        let trimmed = artist.trim();

        if self.whitelist.iter().any(|w| w == trimmed) {
            return trimmed.to_string();
        }
        if !self.first_artist_only {
            return trimmed.to_string();
        }

        let protected = self
            .whitelist
            .iter()
            .filter(|w| {
                trimmed.strip_prefix(w.as_str()).is_some_and(|rest| {
                    SEPARATORS
                        .find(rest)
                        .is_some_and(|m| m.start() == 0)
                })
            })
            .max_by_key(|w| w.len());
        if let Some(entry) = protected {
            return entry.clone();
        }

        let lead = SEPARATORS
            .split(trimmed)
            .next()
            .map(str::trim)
            .unwrap_or("");
        if lead.is_empty() {
            trimmed.to_string()
        } else {
            lead.to_string()
        }
    }
}

/// Matching form of a string: compatibility-decomposed with accents removed,
/// lower-cased, `&` spelled `and`, apostrophes dropped, other punctuation
/// turned into spaces, whitespace collapsed.
pub fn fold(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.nfkd().filter(|c| !is_combining_mark(*c)) {
        match c {
            '&' => out.push_str(" and "),
            '\'' | '\u{2019}' | '\u{2018}' | '`' => {}
            c if c.is_alphanumeric() => out.extend(c.to_lowercase()),
            _ => out.push(' '),
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Folded words of `s`, used for the candidate token index.
pub fn tokens(s: &str) -> Vec<String> {
    fold(s).split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(first_only: bool, whitelist: &[&str]) -> Normalizer {
        Normalizer::new(first_only, whitelist.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_whitelisted_prefix_survives_feature_stripping() {
        let n = norm(true, &["Suzan & Freek"]);
        let out = n.normalize("Suzan & Freek feat. X", "Song");
        assert_eq!(out.display_artist, "Suzan & Freek");
        assert_eq!(out.key.artist, "suzan and freek");
    }

    #[test]
    fn test_exact_whitelist_kept_verbatim() {
        let n = norm(true, &["Suzan & Freek"]);
        assert_eq!(n.first_artist("  Suzan & Freek "), "Suzan & Freek");
    }

    #[test]
    fn test_whitelist_is_case_sensitive() {
        let n = norm(true, &["Suzan & Freek"]);
        assert_eq!(n.first_artist("suzan & freek"), "suzan");
    }

    #[test]
    fn test_ampersand_split_without_whitelist() {
        let n = norm(true, &[]);
        assert_eq!(n.normalize("Artist A & Artist B", "x").display_artist, "Artist A");
    }

    #[test]
    fn test_separator_variants() {
        let n = norm(true, &[]);
        assert_eq!(n.first_artist("Calvin Harris feat. Rihanna"), "Calvin Harris");
        assert_eq!(n.first_artist("Calvin Harris Ft Rihanna"), "Calvin Harris");
        assert_eq!(n.first_artist("A featuring B"), "A");
        assert_eq!(n.first_artist("A, B, C"), "A");
        assert_eq!(n.first_artist("A; B"), "A");
        assert_eq!(n.first_artist("A / B"), "A");
        assert_eq!(n.first_artist("A - B"), "A");
        assert_eq!(n.first_artist("A with B"), "A");
        assert_eq!(n.first_artist("Herman met Henk"), "Herman");
    }

    #[test]
    fn test_separator_needs_surrounding_space() {
        let n = norm(true, &[]);
        assert_eq!(n.first_artist("AC/DC"), "AC/DC");
        assert_eq!(n.first_artist("Jay-Z"), "Jay-Z");
        assert_eq!(n.first_artist("Withered Hand"), "Withered Hand");
    }

    #[test]
    fn test_first_artist_disabled_keeps_credit() {
        let n = norm(false, &[]);
        assert_eq!(n.first_artist("Artist A & Artist B"), "Artist A & Artist B");
    }

    #[test]
    fn test_fold() {
        assert_eq!(fold("  Beyoncé  "), "beyonce");
        assert_eq!(fold("Simon & Garfunkel"), "simon and garfunkel");
        assert_eq!(fold("Don't Stop Me Now"), "dont stop me now");
        assert_eq!(fold("Don’t Stop Me Now"), "dont stop me now");
        assert_eq!(fold("Song 2 (Remastered)"), "song 2 remastered");
        assert_eq!(fold("ＡＢＣ"), "abc");
        assert_eq!(fold(""), "");
    }

    #[test]
    fn test_key_ignores_case_and_punctuation() {
        let n = norm(false, &[]);
        let a = n.normalize("The Great Hall & The Prophecy", "Hello!");
        let b = n.normalize("the great hall and the prophecy", "hello");
        assert_eq!(a.key, b.key);
        assert_ne!(a.display_title, b.display_title);
    }

    #[test]
    fn test_tokens() {
        assert_eq!(tokens("Blur - Song 2"), vec!["blur", "song", "2"]);
    }
}
