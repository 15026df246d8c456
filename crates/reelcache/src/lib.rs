//! HLS caching and prefetch subsystem for short-form video feeds.
//!
//! A feed of vertical reels lives or dies on start-up latency: the next
//! video must begin the instant it is scrolled into view. This crate
//! keeps a loopback HTTP gateway in front of the origin and warms it in
//! the background:
//!
//! - [`store::SegmentStore`] persists fetched manifests and segments
//!   under content-addressed keys.
//! - [`gateway::CacheGateway`] serves the player. Manifests are rewritten
//!   on the way out so every URI routes back through the gateway;
//!   segments are served from the store or fetched on demand.
//! - [`prefetch::PrefetchScheduler`] warms the head of the active reel's
//!   stream, one walk at a time, yielding to the player on demand.
//! - [`downloads::DownloadManager`] runs whole-asset download sessions
//!   keyed by video id, with an LRU budget on concurrency.
//! - [`engine::CacheEngine`] assembles the above behind one facade.
//!
//! ```no_run
//! use reelcache::{CacheEngine, EngineConfig};
//!
//! # async fn demo() -> Result<(), reelcache::CacheProxyError> {
//! let engine = CacheEngine::start(EngineConfig::default()).await?;
//! let origin = url::Url::parse("https://cdn.example.com/videos/42/hls/playlist.m3u8").unwrap();
//! // Hand this to the player...
//! let playable = engine.playable_url(&origin);
//! // ...and warm the stream behind it.
//! engine.notify_active(origin, 12.0);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod downloads;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod gateway;
pub mod playlist;
pub mod prefetch;
pub mod retry;
pub mod rewrite;
pub mod store;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{
    DownloadConfig, EngineConfig, FetcherConfig, GatewayConfig, PrefetchConfig, StoreConfig,
};
pub use downloads::DownloadManager;
pub use engine::{CacheEngine, PlaybackState};
pub use error::CacheProxyError;
pub use fetcher::{Fetch, FetchedBody, OriginFetcher};
pub use gateway::{CacheGateway, GatewayHandle};
pub use playlist::{PlaylistDocument, PlaylistKind, Segment, Variant};
pub use prefetch::{PrefetchScheduler, WalkStats};
pub use store::{CacheKey, SegmentStore, StoredEntry};
