//! Incremental refresh of the scrobble cache from Last.fm.

use tokio_util::sync::CancellationToken;

use crate::cache::EventCache;
use crate::lastfm::ScrobbleSource;

use super::error::SyncError;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestStats {
    pub fetched: u64,
    pub inserted: u64,
    pub malformed: u64,
    pub pages: u32,
    pub loved: usize,
    pub checkpoint: i64,
}

/// Pull every play newer than the checkpoint, then refresh loved tracks.
///
/// Each page is committed before the next request, so a failure part way
/// keeps what was stored; re-fetching it later is a no-op. The checkpoint
/// only moves once the final page is in.
pub async fn fetch_incremental(
    source: &dyn ScrobbleSource,
    cache: &dyn EventCache,
    cancel: &CancellationToken,
) -> Result<IngestStats, SyncError> {
    let since = cache.checkpoint().await?;
    if since == 0 {
        match cache.latest_event_timestamp().await? {
            Some(newest_cached) => tracing::info!(
                newest_cached,
                "Checkpoint was reset, re-reading the full Last.fm history"
            ),
            None => tracing::info!("No checkpoint yet, fetching the full Last.fm history"),
        }
    } else {
        tracing::info!(since, "Fetching scrobbles since the last checkpoint");
    }

    let mut stats = IngestStats {
        checkpoint: since,
        ..IngestStats::default()
    };
    let mut newest = since;
    let mut gap = false;
    let mut page = 1;
    loop {
        if cancel.is_cancelled() {
            tracing::warn!(page, "Ingest interrupted, checkpoint left unchanged");
            return Err(SyncError::Interrupted);
        }

        let batch = source.recent_page(since, page).await?;
        stats.pages = page;
        stats.fetched += batch.events.len() as u64;
        stats.malformed += batch.malformed;
        if let Some(max) = batch.events.iter().map(|e| e.timestamp).max() {
            newest = newest.max(max);
        }
        stats.inserted += cache.insert_events(&batch.events).await?;
        tracing::debug!(
            page,
            total_pages = batch.total_pages,
            events = batch.events.len(),
            "Stored scrobble page"
        );

        if page >= batch.total_pages {
            break;
        }
        // An empty page before the last one means Last.fm skipped entries;
        // keep paging but leave the checkpoint where it is.
        if batch.events.is_empty() && batch.malformed == 0 {
            tracing::warn!(
                page,
                total_pages = batch.total_pages,
                "Last.fm returned an empty page mid-history"
            );
            gap = true;
        }
        page += 1;
    }

    if gap {
        tracing::warn!("Checkpoint not advanced, the next sync re-reads this range");
    } else if newest > since {
        cache.advance_checkpoint(newest).await?;
        stats.checkpoint = newest;
    }
    if stats.malformed > 0 {
        tracing::warn!(count = stats.malformed, "Skipped malformed Last.fm entries");
    }
    tracing::info!(
        fetched = stats.fetched,
        new = stats.inserted,
        pages = stats.pages,
        "Scrobble cache updated"
    );

    let loved = source.loved_tracks().await?;
    cache.replace_loved(&loved).await?;
    stats.loved = loved.len();
    tracing::info!(loved = stats.loved, "Loved tracks refreshed");

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ScrobbleEvent, SqliteEventCache};
    use crate::engine::testing::FakeSource;

    fn history(n: i64) -> Vec<ScrobbleEvent> {
        (1..=n)
            .map(|ts| ScrobbleEvent::new("Artist", format!("Track {}", ts % 4), 1000 + ts))
            .collect()
    }

    #[tokio::test]
    async fn test_first_run_fetches_everything() {
        let cache = SqliteEventCache::open_in_memory().unwrap();
        let source = FakeSource::new(history(10), 3).with_loved(&[("Artist", "Track 1")]);
        let stats = fetch_incremental(&source, &cache, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.pages, 4);
        assert_eq!(stats.inserted, 10);
        assert_eq!(stats.checkpoint, 1010);
        assert_eq!(cache.checkpoint().await.unwrap(), 1010);
        assert_eq!(cache.get_all_events().await.unwrap().len(), 10);
        assert_eq!(stats.loved, 1);
        assert_eq!(source.pages_served.lock().unwrap()[0], (0, 1));
    }

    #[tokio::test]
    async fn test_second_run_starts_at_checkpoint() {
        let cache = SqliteEventCache::open_in_memory().unwrap();
        let source = FakeSource::new(history(5), 10);
        fetch_incremental(&source, &cache, &CancellationToken::new())
            .await
            .unwrap();
        let stats = fetch_incremental(&source, &cache, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.fetched, 0);
        assert_eq!(stats.checkpoint, 1005);
        assert_eq!(source.pages_served.lock().unwrap().last(), Some(&(1005, 1)));
    }

    #[tokio::test]
    async fn test_failure_keeps_checkpoint_and_partial_events() {
        let cache = SqliteEventCache::open_in_memory().unwrap();
        let source = FakeSource::new(history(9), 3);
        source.fail_on(Some(2));

        let err = fetch_incremental(&source, &cache, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::TransientFetch(_)));
        assert_eq!(cache.checkpoint().await.unwrap(), 0);
        // page 1 (the newest three) stays cached
        assert_eq!(cache.get_all_events().await.unwrap().len(), 3);

        source.fail_on(None);
        let stats = fetch_incremental(&source, &cache, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.inserted, 6);
        assert_eq!(cache.get_all_events().await.unwrap().len(), 9);
        assert_eq!(cache.checkpoint().await.unwrap(), 1009);
    }

    #[tokio::test]
    async fn test_malformed_page_does_not_stop_paging() {
        let cache = SqliteEventCache::open_in_memory().unwrap();
        let source = FakeSource::new(history(9), 3);
        source.garble(2, 3);

        let stats = fetch_incremental(&source, &cache, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.pages, 3);
        assert_eq!(stats.malformed, 3);
        assert_eq!(stats.inserted, 6);
        // the oldest page was still read
        let events = cache.get_all_events().await.unwrap();
        assert_eq!(events.first().map(|e| e.timestamp), Some(1001));
        assert_eq!(cache.checkpoint().await.unwrap(), 1009);
    }

    #[tokio::test]
    async fn test_empty_page_mid_history_keeps_checkpoint() {
        let cache = SqliteEventCache::open_in_memory().unwrap();
        let source = FakeSource::new(history(9), 3);
        source.garble(2, 0);

        let stats = fetch_incremental(&source, &cache, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.pages, 3);
        assert_eq!(stats.inserted, 6);
        assert_eq!(stats.checkpoint, 0);
        assert_eq!(cache.checkpoint().await.unwrap(), 0);

        let source = FakeSource::new(history(9), 3);
        let stats = fetch_incremental(&source, &cache, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.inserted, 3);
        assert_eq!(cache.checkpoint().await.unwrap(), 1009);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_page() {
        let cache = SqliteEventCache::open_in_memory().unwrap();
        let source = FakeSource::new(history(3), 3);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = fetch_incremental(&source, &cache, &cancel).await.unwrap_err();
        assert!(matches!(err, SyncError::Interrupted));
        assert!(source.pages_served.lock().unwrap().is_empty());
        assert_eq!(cache.checkpoint().await.unwrap(), 0);
    }
}
