//! reqwest-backed transport.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;

use crate::domain::ports::{DownloadRequest, HttpTransport, TransportError, TransportResponse};

/// Transport over a shared `reqwest::Client` with redirects disabled.
///
/// Redirects are resolved by the downloader so handlers can inspect them.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Builds the client.
    ///
    /// # Errors
    /// Returns error if the TLS backend cannot be initialized.
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::new(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Wraps an existing client. It should not follow redirects.
    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

struct ReqwestResponse {
    status: u16,
    headers: HeaderMap,
    content_length: Option<u64>,
    response: reqwest::Response,
}

#[async_trait]
impl TransportResponse for ReqwestResponse {
    fn status(&self) -> u16 {
        self.status
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn expected_content_length(&self) -> Option<u64> {
        self.content_length
    }

    async fn chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        self.response
            .chunk()
            .await
            .map_err(|e| TransportError::new(format!("Failed to read body: {e}")))
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(
        &self,
        request: &DownloadRequest,
    ) -> Result<Box<dyn TransportResponse>, TransportError> {
        let response = self
            .client
            .get(request.url.clone())
            .headers(request.headers.clone())
            .timeout(request.timeout)
            .send()
            .await
            .map_err(|e| TransportError::new(format!("Request failed: {e}")))?;

        Ok(Box::new(ReqwestResponse {
            status: response.status().as_u16(),
            headers: response.headers().clone(),
            content_length: response.content_length(),
            response,
        }))
    }
}
