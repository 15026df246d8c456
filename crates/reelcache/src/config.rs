use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str = "ReelCache/0.1 (+https://github.com/reelcache/reelcache)";

/// Accept header advertising HLS manifest content, sent on every origin request.
pub const HLS_ACCEPT: &str = "application/vnd.apple.mpegurl, application/x-mpegURL, */*";

/// Configuration for the origin fetcher.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub user_agent: String,

    /// Maximum time between receiving data chunks before a request is
    /// considered stalled.
    pub request_timeout: Duration,

    /// Hard cap on the total duration of a single transfer.
    pub resource_timeout: Duration,

    /// Time to establish the initial connection.
    pub connect_timeout: Duration,

    /// Retries for timeout-class failures (not counting the first attempt).
    pub max_retries: u32,

    /// Base for exponential backoff between retries.
    pub retry_delay_base: Duration,

    /// Cap on the computed backoff delay.
    pub retry_delay_max: Duration,

    /// Add random jitter to backoff delays.
    pub retry_jitter: bool,

    /// In-flight request cap per origin host. Kept at 1 so background
    /// transfers never compete with the foreground player for sockets.
    pub max_connections_per_host: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            request_timeout: Duration::from_secs(20),
            resource_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            max_retries: 2,
            retry_delay_base: Duration::from_secs(2),
            retry_delay_max: Duration::from_secs(32),
            retry_jitter: false,
            max_connections_per_host: 1,
        }
    }
}

/// Configuration for the on-disk segment store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding one file per cache key. Created on first use.
    pub root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("reelcache-segments"),
        }
    }
}

/// Configuration for the local cache-serving gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Loopback port to bind. 0 picks an ephemeral port (used in tests).
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self { port: 12345 }
    }
}

/// Configuration for the prefetch scheduler.
#[derive(Debug, Clone)]
pub struct PrefetchConfig {
    /// Delay before the first walk of a newly activated playlist, so the
    /// player grabs its first segment unopposed.
    pub start_delay: Duration,

    /// Safety cap on master -> media indirection depth.
    pub max_master_depth: u32,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            start_delay: Duration::from_millis(700),
            max_master_depth: 4,
        }
    }
}

/// Configuration for the whole-asset download manager.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Budget of simultaneously active downloads. Starting a download
    /// beyond the budget cancels the least-recently-touched one.
    pub max_concurrent_downloads: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 10,
        }
    }
}

/// Aggregated configuration for a [`crate::CacheEngine`].
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub fetcher: FetcherConfig,
    pub store: StoreConfig,
    pub gateway: GatewayConfig,
    pub prefetch: PrefetchConfig,
    pub downloads: DownloadConfig,
}
