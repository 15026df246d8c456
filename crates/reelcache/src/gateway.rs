//! Cache-serving gateway: a loopback HTTP endpoint the player is pointed
//! at instead of the origin.
//!
//! Requests carry the real origin URL in a `__origin` query parameter.
//! Manifests are served from the store (rewritten on the way out so every
//! URI routes back through the gateway); segments and keys are served
//! verbatim; anything else is proxied transparently without caching.

use crate::error::CacheProxyError;
use crate::fetcher::Fetch;
use crate::rewrite::rewrite_manifest;
use crate::store::SegmentStore;
use axum::Json;
use axum::Router;
use axum::extract::{RawQuery, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Serialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use url::Url;

use crate::config::GatewayConfig;

/// Query parameter carrying the percent-encoded absolute origin URL.
pub const ORIGIN_PARAM: &str = "__origin";

const MANIFEST_MIME: &str = "application/vnd.apple.mpegurl";

/// Extensions served through the segment cache path.
const SEGMENT_EXTENSIONS: &[&str] = &["ts", "m4s", "m4a", "m4v", "mp4", "aac", "key"];

/// Fixed mime types for known extensions, used when the origin did not
/// declare one (or, for mp4, regardless of what it declared — origin
/// mime types for that extension are unreliable).
fn mime_for_extension(ext: &str) -> &'static str {
    match ext {
        "m3u8" => MANIFEST_MIME,
        "ts" => "video/MP2T",
        "m4s" => "video/iso.segment",
        "m4a" => "audio/mp4",
        "mp4" | "m4v" => "video/mp4",
        "aac" => "audio/aac",
        _ => "application/octet-stream",
    }
}

/// Build the gateway URL the player opens instead of `origin`. The origin
/// path is preserved so relative references inside manifests keep
/// working; the origin's own query items are carried along (sorted for
/// key stability) plus the `__origin` parameter.
pub(crate) fn proxy_url(addr: SocketAddr, origin: &Url) -> Url {
    let mut url = Url::parse(&format!("http://{addr}/")).expect("loopback URL");
    url.set_path(origin.path());
    {
        let mut pairs: Vec<(String, String)> = origin
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));

        let mut query = url.query_pairs_mut();
        for (k, v) in &pairs {
            query.append_pair(k, v);
        }
        query.append_pair(ORIGIN_PARAM, origin.as_str());
    }
    url
}

fn extract_origin(query: Option<&str>) -> Option<Url> {
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == ORIGIN_PARAM)
        .and_then(|(_, v)| Url::parse(&v).ok())
}

fn path_extension(url: &Url) -> Option<String> {
    let last = url.path_segments()?.next_back()?;
    let (stem, ext) = last.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

#[derive(Debug, Serialize)]
struct GatewayErrorBody {
    code: &'static str,
    message: String,
}

/// Request-handling error mapped to an HTTP response.
#[derive(Debug)]
pub struct GatewayError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl GatewayError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "BAD_ORIGIN",
            message: message.into(),
        }
    }

    fn upstream(origin: &Url, err: &CacheProxyError) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            code: "UPSTREAM_FETCH_FAILED",
            message: format!("upstream fetch for {origin} failed: {err}"),
        }
    }

    fn malformed_upstream(origin: &Url, err: &CacheProxyError) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            code: "UPSTREAM_MALFORMED",
            message: format!("upstream manifest for {origin} is malformed: {err}"),
        }
    }

    fn corrupt_cache(origin: &Url, err: &CacheProxyError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "CACHE_CORRUPT",
            message: format!("cached manifest for {origin} cannot be rewritten: {err}"),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = GatewayErrorBody {
            code: self.code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

#[derive(Clone)]
struct GatewayState {
    store: SegmentStore,
    fetcher: Arc<dyn Fetch>,
    addr: SocketAddr,
}

/// Address handle for building proxy URLs after the server task has been
/// spawned.
#[derive(Debug, Clone, Copy)]
pub struct GatewayHandle {
    addr: SocketAddr,
}

impl GatewayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Proxy URL for the player to open instead of `origin`.
    pub fn proxy_url(&self, origin: &Url) -> Url {
        proxy_url(self.addr, origin)
    }
}

/// The bound-but-not-yet-serving gateway.
pub struct CacheGateway {
    listener: TcpListener,
    state: GatewayState,
}

impl CacheGateway {
    /// Bind the loopback listener. Port 0 picks an ephemeral port.
    pub async fn bind(
        config: &GatewayConfig,
        store: SegmentStore,
        fetcher: Arc<dyn Fetch>,
    ) -> Result<Self, CacheProxyError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, config.port)).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "cache gateway listening");
        Ok(Self {
            listener,
            state: GatewayState {
                store,
                fetcher,
                addr,
            },
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.state.addr
    }

    pub fn handle(&self) -> GatewayHandle {
        GatewayHandle {
            addr: self.state.addr,
        }
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), CacheProxyError> {
        let app = Router::new()
            .fallback(handle_request)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state);

        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}

async fn handle_request(
    State(state): State<GatewayState>,
    RawQuery(query): RawQuery,
) -> Result<Response, GatewayError> {
    let origin = extract_origin(query.as_deref())
        .ok_or_else(|| GatewayError::bad_request("missing or unparseable __origin parameter"))?;

    match path_extension(&origin).as_deref() {
        Some("m3u8") => serve_manifest(&state, &origin).await,
        Some(ext) if SEGMENT_EXTENSIONS.contains(&ext) => serve_segment(&state, &origin, ext).await,
        _ => passthrough(&state, &origin).await,
    }
}

fn body_response(bytes: Bytes, content_type: String) -> Response {
    ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
}

async fn serve_manifest(state: &GatewayState, origin: &Url) -> Result<Response, GatewayError> {
    let addr = state.addr;

    if let Some(entry) = state.store.read(origin).await {
        // A cached manifest that no longer rewrites is corrupt on our
        // side, not the origin's.
        let body = rewrite_manifest(&entry.bytes, origin, |u| proxy_url(addr, u))
            .map_err(|e| GatewayError::corrupt_cache(origin, &e))?;
        debug!(origin = %origin, "manifest served from cache");
        return Ok(body_response(
            Bytes::from(body),
            entry.mime_type.unwrap_or_else(|| MANIFEST_MIME.to_owned()),
        ));
    }

    let fetched = state
        .fetcher
        .fetch(origin)
        .await
        .map_err(|e| GatewayError::upstream(origin, &e))?;

    let mime = fetched
        .content_type
        .clone()
        .unwrap_or_else(|| MANIFEST_MIME.to_owned());
    state
        .store
        .write(fetched.bytes.clone(), origin, Some(&mime));

    let body = rewrite_manifest(&fetched.bytes, origin, |u| proxy_url(addr, u))
        .map_err(|e| GatewayError::malformed_upstream(origin, &e))?;
    debug!(origin = %origin, "manifest fetched, cached and rewritten");
    Ok(body_response(Bytes::from(body), mime))
}

async fn serve_segment(
    state: &GatewayState,
    origin: &Url,
    ext: &str,
) -> Result<Response, GatewayError> {
    if let Some(entry) = state.store.read(origin).await {
        debug!(origin = %origin, "segment served from cache");
        let mime = entry
            .mime_type
            .unwrap_or_else(|| mime_for_extension(ext).to_owned());
        return Ok(body_response(entry.bytes, mime));
    }

    let fetched = state
        .fetcher
        .fetch(origin)
        .await
        .map_err(|e| GatewayError::upstream(origin, &e))?;

    let mime = if matches!(ext, "mp4" | "m4v") {
        mime_for_extension(ext).to_owned()
    } else {
        fetched
            .content_type
            .clone()
            .unwrap_or_else(|| mime_for_extension(ext).to_owned())
    };

    state.store.write(fetched.bytes.clone(), origin, Some(&mime));
    debug!(origin = %origin, size = fetched.bytes.len(), "segment fetched and cached");
    Ok(body_response(fetched.bytes, mime))
}

async fn passthrough(state: &GatewayState, origin: &Url) -> Result<Response, GatewayError> {
    let fetched = state
        .fetcher
        .fetch(origin)
        .await
        .map_err(|e| GatewayError::upstream(origin, &e))?;
    let mime = fetched
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".to_owned());
    Ok(body_response(fetched.bytes, mime))
}
