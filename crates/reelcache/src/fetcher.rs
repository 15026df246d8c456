//! Origin fetcher: bounded-concurrency HTTP GET with timeout and retry.

use crate::config::{FetcherConfig, HLS_ACCEPT};
use crate::error::CacheProxyError;
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::Client;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, trace};
use url::Url;

/// Body and declared content type of a completed fetch.
#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

/// Fetching seam for the gateway, prefetch scheduler and download
/// manager. Tests substitute a canned implementation.
#[async_trait]
pub trait Fetch: Send + Sync {
    /// GET `url` with the default retry budget.
    async fn fetch(&self, url: &Url) -> Result<FetchedBody, CacheProxyError>;

    /// GET `url`, retrying timeout-class failures up to `retries` times
    /// with exponential backoff.
    async fn fetch_with_retries(
        &self,
        url: &Url,
        retries: u32,
    ) -> Result<FetchedBody, CacheProxyError>;
}

/// HTTP origin client. Holds one `reqwest::Client` plus a per-host gate
/// limiting in-flight requests (weight 1 by default) so background
/// transfers never starve the foreground player of sockets.
pub struct OriginFetcher {
    client: Client,
    config: FetcherConfig,
    host_gates: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl OriginFetcher {
    pub fn new(config: FetcherConfig) -> Result<Self, CacheProxyError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(HLS_ACCEPT));

        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.request_timeout)
            .timeout(config.resource_timeout)
            .pool_max_idle_per_host(config.max_connections_per_host)
            .build()
            .map_err(|e| CacheProxyError::internal(format!("failed to build client: {e}")))?;

        Ok(Self {
            client,
            config,
            host_gates: Mutex::new(HashMap::new()),
        })
    }

    fn gate_for_host(&self, url: &Url) -> Arc<Semaphore> {
        let host = url.host_str().unwrap_or("").to_owned();
        let mut gates = self.host_gates.lock();
        Arc::clone(
            gates
                .entry(host)
                .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_connections_per_host))),
        )
    }

    async fn fetch_once(&self, url: &Url) -> Result<FetchedBody, CacheProxyError> {
        let gate = self.gate_for_host(url);
        let _permit = gate
            .acquire()
            .await
            .map_err(|_| CacheProxyError::internal("host gate closed"))?;

        trace!(url = %url, "origin GET");
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(CacheProxyError::http_status(status, url.as_str(), "fetch"));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let bytes = response.bytes().await.map_err(classify_reqwest_error)?;
        debug!(url = %url, size = bytes.len(), "origin fetch complete");

        Ok(FetchedBody {
            bytes,
            content_type,
        })
    }

    fn retry_policy(&self, retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries: retries,
            base_delay: self.config.retry_delay_base,
            max_delay: self.config.retry_delay_max,
            jitter: self.config.retry_jitter,
        }
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> CacheProxyError {
    if e.is_timeout() {
        CacheProxyError::Timeout {
            reason: e.to_string(),
        }
    } else {
        CacheProxyError::from(e)
    }
}

#[async_trait]
impl Fetch for OriginFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedBody, CacheProxyError> {
        self.fetch_with_retries(url, self.config.max_retries).await
    }

    async fn fetch_with_retries(
        &self,
        url: &Url,
        retries: u32,
    ) -> Result<FetchedBody, CacheProxyError> {
        let policy = self.retry_policy(retries);
        retry_with_backoff(&policy, |_attempt| async {
            match self.fetch_once(url).await {
                Ok(body) => RetryAction::Success(body),
                Err(e) if e.is_timeout_class() => RetryAction::Retry(e),
                Err(e) => RetryAction::Fail(e),
            }
        })
        .await
    }
}
