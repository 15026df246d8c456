//! Prefetch scheduler: keeps the head of the active reel's stream warm.
//!
//! One walk runs at a time. Scheduling a new playlist supersedes the
//! previous job. A short start delay debounces rapid scrolling so a reel
//! the user flicks past never reaches the network.

use crate::config::PrefetchConfig;
use crate::error::CacheProxyError;
use crate::fetcher::Fetch;
use crate::playlist::{self, PlaylistDocument, PlaylistKind};
use crate::store::SegmentStore;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Load one manifest, store-first, so the gateway sees it cached
/// afterwards.
pub(crate) async fn load_playlist(
    fetcher: &Arc<dyn Fetch>,
    store: &SegmentStore,
    url: &Url,
) -> Result<PlaylistDocument, CacheProxyError> {
    let bytes = if let Some(entry) = store.read(url).await {
        entry.bytes
    } else {
        let fetched = fetcher.fetch(url).await?;
        store.write(fetched.bytes.clone(), url, fetched.content_type.as_deref());
        fetched.bytes
    };
    Ok(playlist::parse(url, &bytes))
}

fn pick_variant(master_url: &Url, doc: &PlaylistDocument) -> Result<Url, CacheProxyError> {
    let variant = doc
        .lowest_bandwidth_variant()
        .ok_or_else(|| CacheProxyError::playlist("master playlist has no variants"))?;
    debug!(
        master = %master_url,
        variant = %variant.url,
        bandwidth = ?variant.bandwidth,
        "descending into lowest-bandwidth variant"
    );
    Ok(variant.url.clone())
}

/// Resolve `url` to a media playlist, following master playlists down to
/// their lowest-bandwidth variant.
pub(crate) async fn resolve_media(
    fetcher: &Arc<dyn Fetch>,
    store: &SegmentStore,
    url: Url,
    max_depth: u32,
) -> Result<(Url, PlaylistDocument), CacheProxyError> {
    let mut current = url;
    for _ in 0..=max_depth {
        let doc = load_playlist(fetcher, store, &current).await?;
        match doc.kind {
            PlaylistKind::Media => return Ok((current, doc)),
            PlaylistKind::Master => current = pick_variant(&current, &doc)?,
        }
    }
    Err(CacheProxyError::playlist(
        "master playlist nesting exceeds depth limit",
    ))
}

/// Outcome of a completed walk.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WalkStats {
    /// Playlist seconds now resident in the cache.
    pub warmed_seconds: f64,
    /// Segments fetched from the origin during this walk.
    pub fetched: usize,
    /// Segments that were already cached.
    pub already_cached: usize,
}

struct Inner {
    store: SegmentStore,
    fetcher: Arc<dyn Fetch>,
    config: PrefetchConfig,
    // Serializes walks across jobs. Weight is always 1.
    walk_gate: Arc<Semaphore>,
    suspended: watch::Sender<bool>,
    current: Mutex<Option<CancellationToken>>,
}

/// Handle to the single-walk prefetch scheduler. Cloning shares the
/// scheduler state.
#[derive(Clone)]
pub struct PrefetchScheduler {
    inner: Arc<Inner>,
}

impl PrefetchScheduler {
    pub fn new(config: PrefetchConfig, store: SegmentStore, fetcher: Arc<dyn Fetch>) -> Self {
        let (suspended, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                store,
                fetcher,
                config,
                walk_gate: Arc::new(Semaphore::new(1)),
                suspended,
                current: Mutex::new(None),
            }),
        }
    }

    /// Schedule a walk that warms roughly `target_seconds` of playlist
    /// time starting at `playlist_url`. Any previously scheduled walk is
    /// cancelled; there is never more than one in flight.
    pub fn prefetch(&self, playlist_url: Url, target_seconds: f64) {
        let target_seconds = target_seconds.max(1.0);
        let token = CancellationToken::new();
        {
            let mut current = self.inner.current.lock();
            if let Some(previous) = current.replace(token.clone()) {
                previous.cancel();
            }
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run_job(playlist_url, target_seconds, token).await;
        });
    }

    /// Pause the current walk after the in-flight segment completes. The
    /// job stays scheduled and picks up where it left off on [`resume`].
    ///
    /// [`resume`]: PrefetchScheduler::resume
    pub fn suspend(&self) {
        if !self.inner.suspended.send_replace(true) {
            debug!("prefetch suspended");
        }
    }

    /// Resume a suspended walk.
    pub fn resume(&self) {
        if self.inner.suspended.send_replace(false) {
            debug!("prefetch resumed");
        }
    }

    /// Cancel the scheduled walk, if any.
    pub fn cancel_all(&self) {
        if let Some(token) = self.inner.current.lock().take() {
            token.cancel();
        }
    }
}

impl Inner {
    async fn run_job(self: Arc<Self>, playlist_url: Url, target_seconds: f64, token: CancellationToken) {
        // Debounce: a job superseded during the delay never touches the
        // network.
        tokio::select! {
            _ = token.cancelled() => {
                debug!(playlist = %playlist_url, "prefetch superseded before start");
                return;
            }
            _ = sleep(self.config.start_delay) => {}
        }

        let permit = tokio::select! {
            _ = token.cancelled() => {
                debug!(playlist = %playlist_url, "prefetch superseded while queued");
                return;
            }
            permit = self.walk_gate.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };
        let _permit = permit;

        let result = tokio::select! {
            _ = token.cancelled() => Err(CacheProxyError::Cancelled),
            result = self.walk(&playlist_url, target_seconds, &token) => result,
        };

        match result {
            Ok(stats) => info!(
                playlist = %playlist_url,
                warmed_seconds = stats.warmed_seconds,
                fetched = stats.fetched,
                already_cached = stats.already_cached,
                "prefetch walk complete"
            ),
            Err(CacheProxyError::Cancelled) => {
                debug!(playlist = %playlist_url, "prefetch walk cancelled");
            }
            Err(error) => warn!(playlist = %playlist_url, %error, "prefetch walk failed"),
        }
    }

    /// Resolve to the media playlist while honoring suspension: no
    /// manifest transfer starts while suspended, including the walk's
    /// very first one.
    async fn resolve_media_suspendable(
        &self,
        playlist_url: &Url,
        token: &CancellationToken,
    ) -> Result<(Url, PlaylistDocument), CacheProxyError> {
        let mut current = playlist_url.clone();
        for _ in 0..=self.config.max_master_depth {
            self.wait_until_resumed(token).await?;
            let doc = tokio::select! {
                _ = token.cancelled() => return Err(CacheProxyError::Cancelled),
                result = load_playlist(&self.fetcher, &self.store, &current) => result?,
            };
            match doc.kind {
                PlaylistKind::Media => return Ok((current, doc)),
                PlaylistKind::Master => current = pick_variant(&current, &doc)?,
            }
        }
        Err(CacheProxyError::playlist(
            "master playlist nesting exceeds depth limit",
        ))
    }

    async fn walk(
        &self,
        playlist_url: &Url,
        target_seconds: f64,
        token: &CancellationToken,
    ) -> Result<WalkStats, CacheProxyError> {
        let (media_url, doc) = self.resolve_media_suspendable(playlist_url, token).await?;

        let mut stats = WalkStats::default();
        for segment in &doc.segments {
            if stats.warmed_seconds >= target_seconds {
                break;
            }
            self.wait_until_resumed(token).await?;

            if self.store.has(&segment.url).await {
                stats.warmed_seconds += segment.duration;
                stats.already_cached += 1;
                continue;
            }

            let fetched = tokio::select! {
                _ = token.cancelled() => return Err(CacheProxyError::Cancelled),
                result = self.fetcher.fetch(&segment.url) => result,
            };
            match fetched {
                Ok(body) => {
                    self.store
                        .write(body.bytes, &segment.url, body.content_type.as_deref());
                    stats.warmed_seconds += segment.duration;
                    stats.fetched += 1;
                }
                Err(CacheProxyError::Cancelled) => return Err(CacheProxyError::Cancelled),
                // A failed segment does not count toward the target; the
                // walk keeps going so one bad URL cannot stall warming.
                Err(error) => {
                    warn!(segment = %segment.url, %error, "segment prefetch failed, skipping");
                }
            }
        }

        debug!(media = %media_url, ?stats, "walk finished");
        Ok(stats)
    }

    async fn wait_until_resumed(&self, token: &CancellationToken) -> Result<(), CacheProxyError> {
        let mut rx = self.suspended.subscribe();
        loop {
            if !*rx.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = token.cancelled() => return Err(CacheProxyError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::testutil::MockFetch;
    use std::time::Duration;

    fn media_playlist(count: usize, duration: f64) -> String {
        let mut text = String::from("#EXTM3U\n#EXT-X-VERSION:7\n#EXT-X-TARGETDURATION:4\n");
        for i in 0..count {
            text.push_str(&format!("#EXTINF:{duration},\nseg{i}.ts\n"));
        }
        text.push_str("#EXT-X-ENDLIST\n");
        text
    }

    fn store() -> (SegmentStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            root: dir.path().to_path_buf(),
        };
        (SegmentStore::new(&config).unwrap(), dir)
    }

    fn scheduler(store: SegmentStore, fetch: Arc<MockFetch>) -> PrefetchScheduler {
        let config = PrefetchConfig {
            start_delay: Duration::from_millis(0),
            ..PrefetchConfig::default()
        };
        PrefetchScheduler::new(config, store, fetch)
    }

    #[tokio::test]
    async fn walk_stops_once_target_reached() {
        let (store, _dir) = store();
        let fetch = MockFetch::new();
        fetch.insert_text(
            "https://e.com/v/media.m3u8",
            &media_playlist(4, 4.0),
            Some("application/vnd.apple.mpegurl"),
        );
        for i in 0..4 {
            fetch.insert_bytes(
                &format!("https://e.com/v/seg{i}.ts"),
                vec![i as u8; 16],
                Some("video/MP2T"),
            );
        }
        let fetch: Arc<MockFetch> = Arc::new(fetch);
        let sched = scheduler(store.clone(), fetch.clone());

        // 3 segments of 4s reach the 10s target; seg3 must stay cold.
        sched.inner.clone()
            .run_job(
                Url::parse("https://e.com/v/media.m3u8").unwrap(),
                10.0,
                CancellationToken::new(),
            )
            .await;
        store.flush().await;

        for i in 0..3 {
            let url = Url::parse(&format!("https://e.com/v/seg{i}.ts")).unwrap();
            assert!(store.has(&url).await, "seg{i} should be cached");
        }
        let seg3 = Url::parse("https://e.com/v/seg3.ts").unwrap();
        assert!(!store.has(&seg3).await);
        assert_eq!(fetch.calls_for("https://e.com/v/seg3.ts"), 0);
    }

    #[tokio::test]
    async fn master_playlist_resolves_to_lowest_bandwidth_variant() {
        let (store, _dir) = store();
        let fetch = MockFetch::new();
        fetch.insert_text(
            "https://e.com/v/master.m3u8",
            "#EXTM3U\n\
             #EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=1280x720\nhigh/media.m3u8\n\
             #EXT-X-STREAM-INF:BANDWIDTH=200000,RESOLUTION=640x360\nlow/media.m3u8\n\
             #EXT-X-STREAM-INF:BANDWIDTH=400000,RESOLUTION=960x540\nmid/media.m3u8\n",
            Some("application/vnd.apple.mpegurl"),
        );
        fetch.insert_text(
            "https://e.com/v/low/media.m3u8",
            &media_playlist(1, 4.0),
            Some("application/vnd.apple.mpegurl"),
        );
        fetch.insert_bytes("https://e.com/v/low/seg0.ts", vec![0; 8], Some("video/MP2T"));
        let fetch: Arc<MockFetch> = Arc::new(fetch);
        let sched = scheduler(store.clone(), fetch.clone());

        sched.inner.clone()
            .run_job(
                Url::parse("https://e.com/v/master.m3u8").unwrap(),
                4.0,
                CancellationToken::new(),
            )
            .await;
        store.flush().await;

        let low = Url::parse("https://e.com/v/low/seg0.ts").unwrap();
        assert!(store.has(&low).await);
        assert_eq!(fetch.calls_for("https://e.com/v/high/media.m3u8"), 0);
        assert_eq!(fetch.calls_for("https://e.com/v/mid/media.m3u8"), 0);
    }

    #[tokio::test]
    async fn cached_segments_count_toward_target_without_refetch() {
        let (store, _dir) = store();
        let fetch = MockFetch::new();
        fetch.insert_text(
            "https://e.com/v/media.m3u8",
            &media_playlist(2, 4.0),
            Some("application/vnd.apple.mpegurl"),
        );
        fetch.insert_bytes("https://e.com/v/seg1.ts", vec![1; 8], Some("video/MP2T"));
        let fetch: Arc<MockFetch> = Arc::new(fetch);

        // seg0 is already resident.
        let seg0 = Url::parse("https://e.com/v/seg0.ts").unwrap();
        store.write(bytes::Bytes::from_static(b"cached"), &seg0, Some("video/MP2T"));
        store.flush().await;

        let sched = scheduler(store.clone(), fetch.clone());
        sched.inner.clone()
            .run_job(
                Url::parse("https://e.com/v/media.m3u8").unwrap(),
                8.0,
                CancellationToken::new(),
            )
            .await;
        store.flush().await;

        assert_eq!(fetch.calls_for("https://e.com/v/seg0.ts"), 0);
        assert_eq!(fetch.calls_for("https://e.com/v/seg1.ts"), 1);
    }

    #[tokio::test]
    async fn new_job_supersedes_previous() {
        let (store, _dir) = store();
        let fetch = MockFetch::new();
        fetch.set_delay(Duration::from_millis(50));
        fetch.insert_text(
            "https://e.com/a/media.m3u8",
            &media_playlist(8, 4.0),
            Some("application/vnd.apple.mpegurl"),
        );
        fetch.insert_text(
            "https://e.com/b/media.m3u8",
            &media_playlist(1, 4.0),
            Some("application/vnd.apple.mpegurl"),
        );
        for i in 0..8 {
            fetch.insert_bytes(
                &format!("https://e.com/a/seg{i}.ts"),
                vec![0; 8],
                Some("video/MP2T"),
            );
        }
        fetch.insert_bytes("https://e.com/b/seg0.ts", vec![0; 8], Some("video/MP2T"));
        let fetch: Arc<MockFetch> = Arc::new(fetch);
        let sched = scheduler(store.clone(), fetch.clone());

        sched.prefetch(Url::parse("https://e.com/a/media.m3u8").unwrap(), 32.0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        sched.prefetch(Url::parse("https://e.com/b/media.m3u8").unwrap(), 4.0);

        // Give the superseding walk time to finish.
        tokio::time::sleep(Duration::from_millis(400)).await;
        store.flush().await;

        let b0 = Url::parse("https://e.com/b/seg0.ts").unwrap();
        assert!(store.has(&b0).await, "superseding walk should complete");
        // The superseded walk was cancelled long before exhausting its
        // eight segments.
        assert!(fetch.calls_for("https://e.com/a/seg7.ts") == 0);
    }

    #[tokio::test]
    async fn suspend_pauses_and_resume_continues() {
        let (store, _dir) = store();
        let fetch = MockFetch::new();
        fetch.insert_text(
            "https://e.com/v/media.m3u8",
            &media_playlist(2, 4.0),
            Some("application/vnd.apple.mpegurl"),
        );
        for i in 0..2 {
            fetch.insert_bytes(
                &format!("https://e.com/v/seg{i}.ts"),
                vec![0; 8],
                Some("video/MP2T"),
            );
        }
        let fetch: Arc<MockFetch> = Arc::new(fetch);
        let sched = scheduler(store.clone(), fetch.clone());

        sched.suspend();
        sched.prefetch(Url::parse("https://e.com/v/media.m3u8").unwrap(), 8.0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        // A suspended scheduler starts no transfers at all, manifest
        // resolution included.
        assert_eq!(fetch.total_calls(), 0);

        sched.resume();
        tokio::time::sleep(Duration::from_millis(200)).await;
        store.flush().await;
        assert_eq!(fetch.calls_for("https://e.com/v/media.m3u8"), 1);
        let seg1 = Url::parse("https://e.com/v/seg1.ts").unwrap();
        assert!(store.has(&seg1).await);
    }
}
