#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// How the target library is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum AccessMode {
    /// Subsonic API; safe while Navidrome runs, play counts can only grow.
    Api,
    /// Direct SQLite access; Navidrome must be stopped.
    #[value(alias = "db")]
    Database,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::Api => "api",
            AccessMode::Database => "database",
        }
    }
}

/// What to do when Navidrome already has at least as many plays as Last.fm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ConflictPolicy {
    /// Prompt for every conflict.
    Ask,
    /// Keep the Navidrome count.
    #[value(alias = "target-wins")]
    Navidrome,
    /// Overwrite with the Last.fm count, even when lower.
    #[value(alias = "source-wins")]
    Lastfm,
    /// Keep whichever count is higher.
    Higher,
    /// Add the Last.fm count on top of the Navidrome count.
    Increment,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::Ask => "ask",
            ConflictPolicy::Navidrome => "navidrome",
            ConflictPolicy::Lastfm => "lastfm",
            ConflictPolicy::Higher => "higher",
            ConflictPolicy::Increment => "increment",
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            ConflictPolicy::Ask => "interactive (prompt for each conflict)",
            ConflictPolicy::Navidrome => "keep Navidrome when it is higher",
            ConflictPolicy::Lastfm => "always use Last.fm",
            ConflictPolicy::Higher => "always use the higher count",
            ConflictPolicy::Increment => "add Last.fm count to Navidrome count",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::ValueEnum;

    #[test]
    fn test_conflict_policy_aliases() {
        assert_eq!(
            ConflictPolicy::from_str("target-wins", true).unwrap(),
            ConflictPolicy::Navidrome
        );
        assert_eq!(
            ConflictPolicy::from_str("source-wins", true).unwrap(),
            ConflictPolicy::Lastfm
        );
        assert_eq!(
            ConflictPolicy::from_str("increment", true).unwrap(),
            ConflictPolicy::Increment
        );
    }

    #[test]
    fn test_access_mode_db_alias() {
        assert_eq!(
            AccessMode::from_str("db", true).unwrap(),
            AccessMode::Database
        );
    }
}
