//! Whole-asset download sessions keyed by video id.
//!
//! Unlike the prefetch walk, which only warms the head of the active
//! reel, a download session pulls segments until the requested number of
//! playlist seconds is resident. Sessions run concurrently up to a
//! budget; starting one past the budget cancels the least recently
//! touched session. Videos whose origin fails permanently are marked
//! not-cacheable and silently ignored on later requests.

use crate::config::DownloadConfig;
use crate::error::CacheProxyError;
use crate::fetcher::Fetch;
use crate::prefetch::resolve_media;
use crate::store::SegmentStore;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

const MASTER_DEPTH: u32 = 4;

struct ActiveDownload {
    token: CancellationToken,
    generation: u64,
}

#[derive(Default)]
struct State {
    tasks: HashMap<u64, ActiveDownload>,
    // Front is least recently touched.
    lru: VecDeque<u64>,
    prefetched: HashMap<u64, f64>,
    not_cacheable: HashSet<u64>,
}

impl State {
    fn touch(&mut self, video_id: u64) {
        self.lru.retain(|id| *id != video_id);
        self.lru.push_back(video_id);
    }
}

struct Inner {
    store: SegmentStore,
    fetcher: Arc<dyn Fetch>,
    config: DownloadConfig,
    gate: Arc<Semaphore>,
    next_generation: AtomicU64,
    state: Mutex<State>,
}

/// Handle to the download session manager. Cloning shares state.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl DownloadManager {
    pub fn new(config: DownloadConfig, store: SegmentStore, fetcher: Arc<dyn Fetch>) -> Self {
        let permits = config.max_concurrent_downloads.max(1);
        Self {
            inner: Arc::new(Inner {
                store,
                fetcher,
                config,
                gate: Arc::new(Semaphore::new(permits)),
                next_generation: AtomicU64::new(0),
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Start a session that makes `target_seconds` of `playlist_url`
    /// resident for `video_id`. A request for a video that is already
    /// downloading, already sufficiently resident, or known not-cacheable
    /// is a no-op.
    pub fn request_download(&self, video_id: u64, playlist_url: Url, target_seconds: f64) {
        let target = target_seconds.max(1.0);
        let (token, generation) = {
            let mut state = self.inner.state.lock();
            if state.not_cacheable.contains(&video_id) {
                debug!(video_id, "download skipped, video marked not-cacheable");
                return;
            }
            if state.prefetched.get(&video_id).is_some_and(|&d| d >= target) {
                debug!(video_id, "download skipped, already resident");
                return;
            }
            if state.tasks.contains_key(&video_id) {
                state.touch(video_id);
                return;
            }

            while state.tasks.len() >= self.inner.config.max_concurrent_downloads {
                let Some(oldest) = state.lru.pop_front() else {
                    break;
                };
                if let Some(evicted) = state.tasks.remove(&oldest) {
                    evicted.token.cancel();
                    info!(video_id = oldest, "download evicted for newer request");
                }
            }

            let token = CancellationToken::new();
            let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
            state.tasks.insert(
                video_id,
                ActiveDownload {
                    token: token.clone(),
                    generation,
                },
            );
            state.touch(video_id);
            (token, generation)
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner
                .run_session(video_id, generation, playlist_url, target, token)
                .await;
        });
    }

    /// Cancel the session for `video_id`. Returns whether one was active.
    pub fn cancel(&self, video_id: u64) -> bool {
        let mut state = self.inner.state.lock();
        state.lru.retain(|id| *id != video_id);
        match state.tasks.remove(&video_id) {
            Some(active) => {
                active.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every active session.
    pub fn cancel_all(&self) {
        let mut state = self.inner.state.lock();
        state.lru.clear();
        for (_, active) in state.tasks.drain() {
            active.token.cancel();
        }
    }

    pub fn is_not_cacheable(&self, video_id: u64) -> bool {
        self.inner.state.lock().not_cacheable.contains(&video_id)
    }

    /// Playlist seconds recorded as resident by a completed session.
    pub fn resident_seconds(&self, video_id: u64) -> Option<f64> {
        self.inner.state.lock().prefetched.get(&video_id).copied()
    }

    pub fn active_count(&self) -> usize {
        self.inner.state.lock().tasks.len()
    }

    /// Mapping of video id to recorded resident seconds.
    pub fn resident_summary(&self) -> HashMap<u64, f64> {
        self.inner.state.lock().prefetched.clone()
    }

    /// Video ids with any recorded residency.
    pub fn cached_video_ids(&self) -> Vec<u64> {
        self.inner
            .state
            .lock()
            .prefetched
            .iter()
            .filter(|(_, seconds)| **seconds > 0.0)
            .map(|(id, _)| *id)
            .collect()
    }
}

impl Inner {
    async fn run_session(
        self: Arc<Self>,
        video_id: u64,
        generation: u64,
        playlist_url: Url,
        target_seconds: f64,
        token: CancellationToken,
    ) {
        let permit = tokio::select! {
            _ = token.cancelled() => {
                self.finish(video_id, generation, Err(CacheProxyError::Cancelled));
                return;
            }
            permit = self.gate.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };
        let _permit = permit;

        let result = tokio::select! {
            _ = token.cancelled() => Err(CacheProxyError::Cancelled),
            result = self.drive(&playlist_url, target_seconds, &token) => result,
        };
        self.finish(video_id, generation, result);
    }

    /// Pull segments until `target_seconds` of playlist time is resident,
    /// capped by what the playlist actually holds.
    async fn drive(
        &self,
        playlist_url: &Url,
        target_seconds: f64,
        token: &CancellationToken,
    ) -> Result<f64, CacheProxyError> {
        let (media_url, doc) = resolve_media(
            &self.fetcher,
            &self.store,
            playlist_url.clone(),
            MASTER_DEPTH,
        )
        .await?;

        let effective = target_seconds.min(doc.total_duration());
        let mut loaded = 0.0;
        for segment in &doc.segments {
            if loaded >= effective {
                break;
            }
            if self.store.has(&segment.url).await {
                loaded += segment.duration;
                continue;
            }
            let body = tokio::select! {
                _ = token.cancelled() => return Err(CacheProxyError::Cancelled),
                result = self.fetcher.fetch(&segment.url) => result?,
            };
            self.store
                .write(body.bytes, &segment.url, body.content_type.as_deref());
            loaded += segment.duration;
        }

        debug!(media = %media_url, loaded, effective, "download walk finished");
        Ok(loaded.min(effective))
    }

    fn finish(&self, video_id: u64, generation: u64, result: Result<f64, CacheProxyError>) {
        let mut state = self.state.lock();
        // Only reap our own entry; an evicted slot may already hold a
        // newer session for the same video.
        if state
            .tasks
            .get(&video_id)
            .is_some_and(|active| active.generation == generation)
        {
            state.tasks.remove(&video_id);
            state.lru.retain(|id| *id != video_id);
        }

        match result {
            Ok(seconds) => {
                state.prefetched.insert(video_id, seconds);
                info!(video_id, seconds, "download complete");
            }
            Err(CacheProxyError::Cancelled) => {
                debug!(video_id, "download cancelled");
            }
            Err(error) if error.is_permanent() => {
                state.not_cacheable.insert(video_id);
                warn!(video_id, %error, "download failed permanently, marking not-cacheable");
            }
            Err(error) => {
                warn!(video_id, %error, "download failed, will allow retry");
            }
        }
    }
}
