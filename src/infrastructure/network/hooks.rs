//! Extension points the downloader calls during a transfer.

use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue};
use url::Url;

use crate::domain::entities::Image;
use crate::domain::errors::ImageError;
use crate::domain::ports::DownloadRequest;

/// Final response of a transfer.
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    /// URL that produced the response, after redirects.
    pub url: Url,
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: HeaderMap,
    /// Length announced by the server.
    pub expected_content_length: Option<u64>,
}

/// Rewrites a request before it is sent. Returning `None` aborts the
/// request with an empty-request error.
#[async_trait]
pub trait RequestModifier: Send + Sync {
    /// Returns the request to send.
    async fn modified(&self, request: DownloadRequest) -> Option<DownloadRequest>;
}

/// [`RequestModifier`] built from a plain closure.
pub struct AnyModifier<F>(pub F);

#[async_trait]
impl<F> RequestModifier for AnyModifier<F>
where
    F: Fn(DownloadRequest) -> Option<DownloadRequest> + Send + Sync,
{
    async fn modified(&self, request: DownloadRequest) -> Option<DownloadRequest> {
        (self.0)(request)
    }
}

/// Decides whether to follow a redirect. Returning `None` delivers the
/// redirect response as is.
#[async_trait]
pub trait RedirectHandler: Send + Sync {
    /// Returns the request to follow with.
    async fn handle(&self, response: &ResponseInfo, new_request: DownloadRequest)
    -> Option<DownloadRequest>;
}

/// [`RedirectHandler`] built from a plain closure.
pub struct AnyRedirectHandler<F>(pub F);

#[async_trait]
impl<F> RedirectHandler for AnyRedirectHandler<F>
where
    F: Fn(&ResponseInfo, DownloadRequest) -> Option<DownloadRequest> + Send + Sync,
{
    async fn handle(
        &self,
        response: &ResponseInfo,
        new_request: DownloadRequest,
    ) -> Option<DownloadRequest> {
        (self.0)(response, new_request)
    }
}

/// A 401 answered with a `WWW-Authenticate` header.
#[derive(Debug, Clone)]
pub struct AuthChallenge {
    /// URL that issued the challenge.
    pub url: Url,
    /// Raw `WWW-Authenticate` value.
    pub www_authenticate: String,
}

/// How to answer an [`AuthChallenge`].
#[derive(Debug, Clone)]
pub enum ChallengeDisposition {
    /// Resend once with this `Authorization` header.
    UseCredential(HeaderValue),
    /// Treat the 401 like any other response.
    PerformDefaultHandling,
    /// Fail the transfer as cancelled.
    CancelAuthenticationChallenge,
}

/// Answers authentication challenges for the downloader.
#[async_trait]
pub trait AuthenticationChallengeResponder: Send + Sync {
    /// Chooses a disposition for `challenge`.
    async fn challenge(&self, challenge: &AuthChallenge) -> ChallengeDisposition;
}

/// Observer of downloader activity. Every method has a default.
pub trait ImageDownloaderDelegate: Send + Sync {
    /// A request is about to be registered.
    fn will_download_image(&self, _url: &Url, _request: &DownloadRequest) {}

    /// The transfer for `url` ended.
    fn did_finish_downloading(&self, _url: &Url, _result: Result<&ResponseInfo, &ImageError>) {}

    /// Rewrites downloaded bytes before processing. `None` fails every
    /// waiting request.
    fn did_download_data(&self, data: Bytes, _response: &ResponseInfo) -> Option<Bytes> {
        Some(data)
    }

    /// A processed image is about to be delivered.
    fn did_download_image(&self, _image: &Image, _url: &Url, _response: &ResponseInfo) {}

    /// Status codes accepted as success.
    fn is_valid_status_code(&self, code: u16) -> bool {
        DEFAULT_VALID_STATUS.contains(&code)
    }
}

/// Status codes accepted when no delegate overrides the check.
pub const DEFAULT_VALID_STATUS: Range<u16> = 200..400;

/// Delegate with every default.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDownloaderDelegate;

impl ImageDownloaderDelegate for DefaultDownloaderDelegate {}

/// Progress reporting attached to one request.
#[derive(Clone)]
pub struct ProgressSideEffect {
    on_progress: Arc<dyn Fn(u64, Option<u64>) + Send + Sync>,
    should_apply: Arc<dyn Fn() -> bool + Send + Sync>,
}

impl ProgressSideEffect {
    /// Calls `on_progress(received, expected_total)` for each chunk.
    pub fn new(on_progress: impl Fn(u64, Option<u64>) + Send + Sync + 'static) -> Self {
        Self {
            on_progress: Arc::new(on_progress),
            should_apply: Arc::new(|| true),
        }
    }

    /// Only reports while `should_apply` returns true. Predicates added
    /// earlier still have to hold.
    #[must_use]
    pub fn with_should_apply(mut self, should_apply: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        let previous = self.should_apply;
        self.should_apply = Arc::new(move || previous() && should_apply());
        self
    }

    /// Reports progress if still applicable.
    pub fn apply(&self, received: u64, expected: Option<u64>) {
        if (self.should_apply)() {
            (self.on_progress)(received, expected);
        }
    }
}

impl std::fmt::Debug for ProgressSideEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSideEffect").finish_non_exhaustive()
    }
}
