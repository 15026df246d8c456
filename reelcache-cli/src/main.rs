//! Standalone runner for the reelcache gateway.
//!
//! Starts the loopback gateway and, optionally, warms one or more
//! playlists before waiting for Ctrl-C. Useful for poking the cache with
//! curl or pointing a desktop player at it.

use anyhow::Context;
use clap::Parser;
use reelcache::{
    CacheEngine, DownloadConfig, EngineConfig, FetcherConfig, GatewayConfig, PrefetchConfig,
    StoreConfig,
};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Debug, Parser)]
#[command(name = "reelcache", version, about = "Loopback HLS caching gateway")]
struct Args {
    /// Gateway port (0 picks an ephemeral port)
    #[arg(short, long, default_value_t = 12345)]
    port: u16,

    /// Cache directory (defaults to a per-user temp directory)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Playlists to warm on startup
    #[arg(short = 'w', long = "warm", value_name = "URL")]
    warm: Vec<Url>,

    /// Seconds of each warmed playlist to pull in
    #[arg(long, default_value_t = 12.0)]
    preheat: f64,

    /// Timeout-class retry budget for origin requests
    #[arg(long, default_value_t = 2)]
    retries: u32,

    /// Drop any previously cached content before serving
    #[arg(long)]
    fresh: bool,

    /// Print a JSON summary of cached entries on exit
    #[arg(long)]
    summary: bool,

    /// Verbose logging (overridden by RUST_LOG)
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "reelcache=debug,reelcache_cli=debug,tower_http=debug"
    } else {
        "reelcache=info,reelcache_cli=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = EngineConfig {
        gateway: GatewayConfig { port: args.port },
        fetcher: FetcherConfig {
            max_retries: args.retries,
            ..FetcherConfig::default()
        },
        prefetch: PrefetchConfig::default(),
        downloads: DownloadConfig::default(),
        store: StoreConfig::default(),
    };
    if let Some(root) = args.cache_dir {
        config.store = StoreConfig { root };
    }

    let engine = CacheEngine::start(config)
        .await
        .context("starting cache engine")?;
    if args.fresh {
        engine.clear_cache();
    }
    info!(addr = %engine.local_addr(), "gateway ready");

    // Download sessions rather than notify_active: the prefetch walk is
    // single-slot and a new call supersedes the previous one, which
    // would leave only the last --warm URL warmed.
    for (id, origin) in args.warm.iter().enumerate() {
        let playable = engine.playable_url(origin);
        info!(origin = %origin, playable = %playable, "warming playlist");
        engine.request_download(id as u64, origin.clone(), args.preheat);
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down");
    if args.summary {
        let keys = engine.cached_keys().await;
        println!("{}", serde_json::to_string_pretty(&keys)?);
    }
    engine.shutdown().await;
    Ok(())
}
