//! Canned [`Fetch`] implementation for unit tests.

use crate::error::CacheProxyError;
use crate::fetcher::{Fetch, FetchedBody};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

enum Canned {
    Body(FetchedBody),
    Status(StatusCode),
}

/// In-memory fetcher. URLs without a canned response fail with an
/// upstream error; every attempt is recorded for call-count assertions.
pub(crate) struct MockFetch {
    responses: Mutex<HashMap<String, Canned>>,
    calls: Mutex<Vec<String>>,
    delay: Mutex<Option<Duration>>,
}

impl MockFetch {
    pub(crate) fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
        }
    }

    pub(crate) fn insert_text(&self, url: &str, text: &str, content_type: Option<&str>) {
        self.insert_bytes(url, text.as_bytes().to_vec(), content_type);
    }

    pub(crate) fn insert_bytes(&self, url: &str, bytes: Vec<u8>, content_type: Option<&str>) {
        self.responses.lock().insert(
            url.to_owned(),
            Canned::Body(FetchedBody {
                bytes: Bytes::from(bytes),
                content_type: content_type.map(str::to_owned),
            }),
        );
    }

    pub(crate) fn insert_status(&self, url: &str, status: u16) {
        let status = StatusCode::from_u16(status).unwrap();
        self.responses
            .lock()
            .insert(url.to_owned(), Canned::Status(status));
    }

    /// Delay every fetch, so tests can observe cancellation mid-flight.
    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub(crate) fn calls_for(&self, url: &str) -> usize {
        self.calls.lock().iter().filter(|c| c == &url).count()
    }

    pub(crate) fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Fetch for MockFetch {
    async fn fetch(&self, url: &Url) -> Result<FetchedBody, CacheProxyError> {
        self.fetch_with_retries(url, 0).await
    }

    async fn fetch_with_retries(
        &self,
        url: &Url,
        _retries: u32,
    ) -> Result<FetchedBody, CacheProxyError> {
        self.calls.lock().push(url.as_str().to_owned());
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let responses = self.responses.lock();
        match responses.get(url.as_str()) {
            Some(Canned::Body(body)) => Ok(body.clone()),
            Some(Canned::Status(status)) => Err(CacheProxyError::http_status(
                *status,
                url.as_str(),
                "mock fetch",
            )),
            None => Err(CacheProxyError::upstream(url.as_str(), "no canned response")),
        }
    }
}
