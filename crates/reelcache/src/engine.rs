//! Engine facade: one object owning the store, the loopback gateway, the
//! prefetch scheduler and the download manager.

use crate::config::EngineConfig;
use crate::downloads::DownloadManager;
use crate::error::CacheProxyError;
use crate::fetcher::{Fetch, OriginFetcher};
use crate::gateway::{CacheGateway, GatewayHandle};
use crate::prefetch::PrefetchScheduler;
use crate::store::SegmentStore;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;
use url::Url;

/// Player state reported by the embedding application. The scheduler
/// yields bandwidth to the player whenever it is not progressing
/// smoothly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Playing,
    Paused,
    /// Stalled waiting for buffered media.
    Waiting,
}

/// The assembled caching subsystem.
pub struct CacheEngine {
    store: SegmentStore,
    gateway: GatewayHandle,
    scheduler: PrefetchScheduler,
    downloads: DownloadManager,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
}

impl CacheEngine {
    /// Build every component and start serving on the loopback gateway.
    pub async fn start(config: EngineConfig) -> Result<Self, CacheProxyError> {
        let store = SegmentStore::new(&config.store)?;
        let fetcher: Arc<dyn Fetch> = Arc::new(OriginFetcher::new(config.fetcher)?);

        let gateway = CacheGateway::bind(&config.gateway, store.clone(), fetcher.clone()).await?;
        let handle = gateway.handle();
        let shutdown = CancellationToken::new();
        let server_token = shutdown.clone();
        let server = tokio::spawn(async move {
            if let Err(err) = gateway.serve(server_token).await {
                error!(error = %err, "gateway server terminated");
            }
        });

        let scheduler = PrefetchScheduler::new(config.prefetch, store.clone(), fetcher.clone());
        let downloads = DownloadManager::new(config.downloads, store.clone(), fetcher);

        Ok(Self {
            store,
            gateway: handle,
            scheduler,
            downloads,
            shutdown,
            server,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.gateway.local_addr()
    }

    /// Gateway URL the player should open for `origin`.
    pub fn playable_url(&self, origin: &Url) -> Url {
        self.gateway.proxy_url(origin)
    }

    /// [`playable_url`] for a string origin, rejecting unparseable input.
    ///
    /// [`playable_url`]: CacheEngine::playable_url
    pub fn resolve_playable_url(&self, origin: &str) -> Result<Url, CacheProxyError> {
        let origin = Url::parse(origin)
            .map_err(|e| CacheProxyError::invalid_url(origin, e.to_string()))?;
        Ok(self.playable_url(&origin))
    }

    /// The reel at `playlist_url` became the active one; warm roughly
    /// `preheat_seconds` of its stream. Supersedes any earlier warm-up.
    pub fn notify_active(&self, playlist_url: Url, preheat_seconds: f64) {
        self.scheduler.prefetch(playlist_url, preheat_seconds);
    }

    /// Report player state. Warming pauses while the player is paused or
    /// stalled and resumes once it plays smoothly again.
    pub fn notify_playback_state(&self, state: PlaybackState) {
        match state {
            PlaybackState::Playing => self.scheduler.resume(),
            PlaybackState::Paused | PlaybackState::Waiting => self.scheduler.suspend(),
        }
    }

    pub fn cancel_prefetch(&self) {
        self.scheduler.cancel_all();
    }

    /// See [`DownloadManager::request_download`].
    pub fn request_download(&self, video_id: u64, playlist_url: Url, target_seconds: f64) {
        self.downloads
            .request_download(video_id, playlist_url, target_seconds);
    }

    pub fn cancel_download(&self, video_id: u64) -> bool {
        self.downloads.cancel(video_id)
    }

    pub fn is_not_cacheable(&self, video_id: u64) -> bool {
        self.downloads.is_not_cacheable(video_id)
    }

    pub fn resident_seconds(&self, video_id: u64) -> Option<f64> {
        self.downloads.resident_seconds(video_id)
    }

    /// Video ids with downloaded content on disk.
    pub fn cached_video_ids(&self) -> Vec<u64> {
        self.downloads.cached_video_ids()
    }

    /// Mapping of video id to downloaded seconds, for diagnostics.
    pub fn cached_summary(&self) -> HashMap<u64, f64> {
        self.downloads.resident_summary()
    }

    /// Cache keys currently resident on disk.
    pub async fn cached_keys(&self) -> Vec<String> {
        self.store.cached_summary().await
    }

    pub fn clear_cache(&self) {
        self.store.clear();
    }

    /// Stop background work and the gateway, waiting for the server task
    /// to wind down.
    pub async fn shutdown(self) {
        self.downloads.cancel_all();
        self.scheduler.cancel_all();
        self.shutdown.cancel();
        if let Err(err) = self.server.await {
            error!(error = %err, "gateway task join failed");
        }
    }
}
