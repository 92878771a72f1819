//! HTTP transport port used by the downloader.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use url::Url;

/// A GET request issued by the downloader.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// Target URL.
    pub url: Url,
    /// Request headers.
    pub headers: HeaderMap,
    /// Overall timeout for the exchange.
    pub timeout: Duration,
}

impl DownloadRequest {
    /// Creates a request with no extra headers.
    #[must_use]
    pub fn new(url: Url, timeout: Duration) -> Self {
        Self {
            url,
            headers: HeaderMap::new(),
            timeout,
        }
    }
}

/// Transport-level failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    /// Human-readable description.
    pub message: String,
}

impl TransportError {
    /// Creates a transport error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Response headers plus a streaming body.
#[async_trait]
pub trait TransportResponse: Send {
    /// HTTP status code.
    fn status(&self) -> u16;

    /// Response headers.
    fn headers(&self) -> &HeaderMap;

    /// Content length announced by the server.
    fn expected_content_length(&self) -> Option<u64>;

    /// Next body chunk, `None` at the end.
    async fn chunk(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// Sends requests without following redirects.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Sends the request and returns once headers are received.
    async fn send(
        &self,
        request: &DownloadRequest,
    ) -> Result<Box<dyn TransportResponse>, TransportError>;
}
