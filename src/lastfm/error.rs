use std::time::Duration;

use thiserror::Error;

use crate::retry::Retryable;

/// Failures talking to the Last.fm web service.
#[derive(Debug, Error)]
pub enum LastfmError {
    #[error("Last.fm request {method} failed: {source}")]
    Http {
        method: &'static str,
        source: reqwest::Error,
    },

    #[error("Last.fm returned HTTP {status} for {method}")]
    HttpStatus { method: &'static str, status: u16 },

    #[error("Last.fm API error {code}: {message}")]
    Api { code: u32, message: String },

    #[error("Unexpected Last.fm response for {method}: {detail}")]
    InvalidResponse { method: &'static str, detail: String },

    #[error("{0} is required for this Last.fm call")]
    MissingCredential(&'static str),
}

impl Retryable for LastfmError {
    /// 429, 5xx and transport failures are transient, as are the API's own
    /// "service offline" (11), "temporarily unavailable" (16) and
    /// "rate limit exceeded" (29) codes.
    fn is_retryable(&self) -> bool {
        match self {
            Self::Http { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request() || source.is_body()
            }
            Self::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            Self::Api { code, .. } => matches!(code, 11 | 16 | 29),
            Self::InvalidResponse { .. } => true,
            Self::MissingCredential(_) => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::HttpStatus { status: 429, .. } | Self::Api { code: 29, .. } => {
                Some(Duration::from_secs(5))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> LastfmError {
        LastfmError::HttpStatus {
            method: "user.getRecentTracks",
            status: code,
        }
    }

    #[test]
    fn test_rate_limit_retryable_with_hint() {
        let e = status(429);
        assert!(e.is_retryable());
        assert_eq!(e.retry_after(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_server_errors_retryable() {
        assert!(status(500).is_retryable());
        assert!(status(503).is_retryable());
    }

    #[test]
    fn test_client_errors_not_retryable() {
        assert!(!status(400).is_retryable());
        assert!(!status(403).is_retryable());
        assert!(!status(404).is_retryable());
    }

    #[test]
    fn test_api_codes() {
        let api = |code| LastfmError::Api {
            code,
            message: String::new(),
        };
        assert!(api(11).is_retryable());
        assert!(api(16).is_retryable());
        assert!(api(29).is_retryable());
        // invalid API key, invalid session
        assert!(!api(10).is_retryable());
        assert!(!api(9).is_retryable());
        assert!(!api(6).is_retryable());
    }

    #[test]
    fn test_missing_credential_not_retryable() {
        assert!(!LastfmError::MissingCredential("LASTFM_SESSION_KEY").is_retryable());
    }
}
