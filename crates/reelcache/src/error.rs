use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum CacheProxyError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("operation timed out: {reason}")]
    Timeout { reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("cache error: {reason}")]
    Cache { reason: String },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("manifest rewrite error: {reason}")]
    Rewrite { reason: String },

    #[error("upstream fetch failed for {url}: {reason}")]
    UpstreamFetch { url: String, reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl CacheProxyError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    pub fn rewrite(reason: impl Into<String>) -> Self {
        Self::Rewrite {
            reason: reason.into(),
        }
    }

    pub fn upstream(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UpstreamFetch {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Timeout-class failures are the only ones the fetcher retries.
    /// 4xx/5xx responses and connection refusals surface immediately.
    pub fn is_timeout_class(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Network { source } => source.is_timeout(),
            _ => false,
        }
    }

    /// Permanent failures mark a video as not-cacheable in the download
    /// manager; transient ones leave it eligible for a later attempt.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Cancelled => false,
            Self::HttpStatus { .. }
            | Self::InvalidUrl { .. }
            | Self::Playlist { .. }
            | Self::Rewrite { .. } => true,
            _ => !self.is_timeout_class() && !matches!(self, Self::Network { .. }),
        }
    }
}
