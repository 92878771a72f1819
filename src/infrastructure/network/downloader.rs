//! Image downloader: coalesced transfers, redirects, authentication and
//! per-processor decoding.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::join_all;
use reqwest::header::{AUTHORIZATION, LOCATION, WWW_AUTHENTICATE};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use url::Url;

use super::hooks::{
    AuthChallenge, AuthenticationChallengeResponder, ChallengeDisposition,
    DefaultDownloaderDelegate, ImageDownloaderDelegate, ProgressSideEffect, RedirectHandler,
    RequestModifier, ResponseInfo,
};
use super::http::ReqwestTransport;
use super::session::{DownloadTask, SessionDataTask, SessionDelegate, TaskCallback};
use crate::domain::entities::ImageLoadingResult;
use crate::domain::errors::{ImageError, ImageResult, RequestErrorReason, ResponseErrorReason};
use crate::domain::ports::{
    DefaultImageProcessor, DownloadRequest, HttpTransport, ImageProcessor, ProcessItem,
    ProcessingOptions, TransportError,
};

/// Timeout applied to every request.
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(15);

const MAX_REDIRECTS: usize = 10;

/// Per-request download options.
#[derive(Clone)]
pub struct DownloadOptions {
    /// Processor run on the downloaded bytes.
    pub processor: Arc<dyn ImageProcessor>,
    /// Decoding hints for the processor.
    pub processing: ProcessingOptions,
    /// Rewrites the request before it is registered.
    pub request_modifier: Option<Arc<dyn RequestModifier>>,
    /// Consulted on 3xx responses.
    pub redirect_handler: Option<Arc<dyn RedirectHandler>>,
    /// Progress reporting.
    pub progress: Vec<ProgressSideEffect>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            processor: Arc::new(DefaultImageProcessor),
            processing: ProcessingOptions::default(),
            request_modifier: None,
            redirect_handler: None,
            progress: Vec::new(),
        }
    }
}

impl fmt::Debug for DownloadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadOptions")
            .field("processor", &self.processor.identifier())
            .field("processing", &self.processing)
            .field("request_modifier", &self.request_modifier.is_some())
            .field("redirect_handler", &self.redirect_handler.is_some())
            .field("progress", &self.progress.len())
            .finish()
    }
}

/// A registered download waiting for its result.
#[derive(Debug)]
pub struct DownloadHandle {
    task: DownloadTask,
    receiver: oneshot::Receiver<ImageResult<ImageLoadingResult>>,
}

impl DownloadHandle {
    /// Cancel handle for this request.
    #[must_use]
    pub const fn task(&self) -> &DownloadTask {
        &self.task
    }

    /// Cancels this request only.
    pub fn cancel(&self) {
        self.task.cancel();
    }

    /// Waits for the processed image.
    ///
    /// # Errors
    /// Returns the transfer, status or processing error for this request.
    pub async fn wait(self) -> ImageResult<ImageLoadingResult> {
        let url = self.task.session_task().url().clone();
        let token = self.task.cancel_token();
        self.receiver
            .await
            .unwrap_or_else(|_| Err(ImageError::cancelled(Some(url), token)))
    }
}

/// Downloads and processes images over an [`HttpTransport`].
pub struct ImageDownloader {
    name: String,
    transport: Arc<dyn HttpTransport>,
    session: Arc<SessionDelegate>,
    timeout: Duration,
    delegate: Arc<dyn ImageDownloaderDelegate>,
    authentication: Option<Arc<dyn AuthenticationChallengeResponder>>,
}

impl ImageDownloader {
    /// Creates a downloader over `transport`.
    pub fn new(name: impl Into<String>, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            name: name.into(),
            transport,
            session: Arc::new(SessionDelegate::new()),
            timeout: DEFAULT_DOWNLOAD_TIMEOUT,
            delegate: Arc::new(DefaultDownloaderDelegate),
            authentication: None,
        }
    }

    /// Creates a downloader over a reqwest client.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn with_default_transport(name: impl Into<String>) -> Result<Self, TransportError> {
        Ok(Self::new(name, Arc::new(ReqwestTransport::new()?)))
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the delegate.
    #[must_use]
    pub fn with_delegate(mut self, delegate: Arc<dyn ImageDownloaderDelegate>) -> Self {
        self.delegate = delegate;
        self
    }

    /// Sets the authentication challenge responder.
    #[must_use]
    pub fn with_authentication_responder(
        mut self,
        responder: Arc<dyn AuthenticationChallengeResponder>,
    ) -> Self {
        self.authentication = Some(responder);
        self
    }

    /// Downloader name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Per-request timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// In-flight transfer registry.
    #[must_use]
    pub const fn session(&self) -> &Arc<SessionDelegate> {
        &self.session
    }

    /// Registers a download, joining an in-flight transfer for the same
    /// URL when there is one.
    ///
    /// # Errors
    /// Returns error if the request modifier drops the request or the
    /// URL is not http(s).
    pub async fn download_image(
        self: &Arc<Self>,
        url: Url,
        options: DownloadOptions,
    ) -> ImageResult<DownloadHandle> {
        let mut request = DownloadRequest::new(url, self.timeout);
        if let Some(modifier) = &options.request_modifier {
            request = modifier
                .modified(request)
                .await
                .ok_or(RequestErrorReason::EmptyRequest)?;
        }
        if !matches!(request.url.scheme(), "http" | "https") {
            return Err(RequestErrorReason::InvalidUrl {
                url: request.url.to_string(),
            }
            .into());
        }

        self.delegate.will_download_image(&request.url, &request);

        let (completion, receiver) = oneshot::channel();
        let callback = TaskCallback {
            completion,
            options: Arc::new(options),
        };
        let registration = self.session.add_or_append(request, callback);
        if registration.is_new {
            debug!(
                downloader = %self.name,
                url = %registration.task.url(),
                "Starting download"
            );
            let transfer = tokio::spawn(self.clone().run_transfer(registration.task.clone()));
            registration.task.set_transfer(transfer.abort_handle());
        }

        Ok(DownloadHandle {
            task: DownloadTask::new(registration.task, registration.token, self.session.clone()),
            receiver,
        })
    }

    /// Downloads and waits for the processed image.
    ///
    /// # Errors
    /// Returns the registration or transfer error.
    pub async fn download(
        self: &Arc<Self>,
        url: Url,
        options: DownloadOptions,
    ) -> ImageResult<ImageLoadingResult> {
        self.download_image(url, options).await?.wait().await
    }

    /// Cancels every in-flight download.
    pub fn cancel_all(&self) {
        self.session.cancel_all();
    }

    /// Cancels every request waiting on `url`.
    pub fn cancel(&self, url: &Url) {
        self.session.cancel_url(url);
    }

    async fn run_transfer(self: Arc<Self>, task: Arc<SessionDataTask>) {
        let result = self.fetch(&task).await;
        let callbacks = self.session.complete(&task);
        let url = task.url().clone();
        self.delegate.did_finish_downloading(&url, result.as_ref());

        if callbacks.is_empty() {
            return;
        }

        let info = match result {
            Ok(info) => info,
            Err(error) => {
                warn!(url = %url, error = %error, "Download failed");
                fail_all(callbacks, &error);
                return;
            }
        };

        let data = Bytes::from(task.take_data());
        let Some(data) = self.delegate.did_download_data(data, &info) else {
            fail_all(
                callbacks,
                &ResponseErrorReason::DataModifyingFailed { url }.into(),
            );
            return;
        };

        self.process_and_deliver(&url, &info, data, callbacks).await;
    }

    async fn fetch(&self, task: &SessionDataTask) -> ImageResult<ResponseInfo> {
        let mut request = task.request().clone();
        let mut redirects = 0;
        let mut challenged = false;

        loop {
            let mut response = self
                .transport
                .send(&request)
                .await
                .map_err(|e| ImageError::session(request.url.clone(), e.message))?;
            let info = ResponseInfo {
                url: request.url.clone(),
                status: response.status(),
                headers: response.headers().clone(),
                expected_content_length: response.expected_content_length(),
            };

            if (300..400).contains(&info.status)
                && redirects < MAX_REDIRECTS
                && let Some(target) = redirect_target(&info)
            {
                let mut follow = request.clone();
                follow.url = target;
                let handler = task
                    .last_callback_options()
                    .and_then(|options| options.redirect_handler.clone());
                let follow = match handler {
                    Some(handler) => handler.handle(&info, follow).await,
                    None => Some(follow),
                };
                if let Some(follow) = follow {
                    debug!(from = %request.url, to = %follow.url, "Following redirect");
                    request = follow;
                    redirects += 1;
                    continue;
                }
            }

            if info.status == 401
                && !challenged
                && let Some(responder) = &self.authentication
                && let Some(header) = info
                    .headers
                    .get(WWW_AUTHENTICATE)
                    .and_then(|value| value.to_str().ok())
            {
                let challenge = AuthChallenge {
                    url: info.url.clone(),
                    www_authenticate: header.to_string(),
                };
                match responder.challenge(&challenge).await {
                    ChallengeDisposition::UseCredential(credential) => {
                        trace!(url = %info.url, "Answering authentication challenge");
                        request.headers.insert(AUTHORIZATION, credential);
                        challenged = true;
                        continue;
                    }
                    ChallengeDisposition::PerformDefaultHandling => {}
                    ChallengeDisposition::CancelAuthenticationChallenge => {
                        return Err(ImageError::session(
                            info.url,
                            "authentication challenge cancelled",
                        ));
                    }
                }
            }

            if !self.delegate.is_valid_status_code(info.status) {
                return Err(ResponseErrorReason::InvalidHttpStatusCode {
                    url: info.url,
                    status: info.status,
                }
                .into());
            }

            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|e| ImageError::session(info.url.clone(), e.message))?
            {
                let received = task.did_receive_data(&chunk);
                for options in task.callback_options() {
                    for progress in &options.progress {
                        progress.apply(received, info.expected_content_length);
                    }
                }
            }
            return Ok(info);
        }
    }

    async fn process_and_deliver(
        &self,
        url: &Url,
        info: &ResponseInfo,
        data: Bytes,
        callbacks: Vec<TaskCallback>,
    ) {
        let groups = group_by_processor(callbacks);
        let jobs = groups.into_iter().map(|group| {
            let data = data.clone();
            async move {
                let processor = group.processor.clone();
                let processing = group.processing;
                let image = tokio::task::spawn_blocking(move || {
                    processor.process(&ProcessItem::Data(data), &processing)
                })
                .await
                .ok()
                .flatten();
                (group, image)
            }
        });

        for (group, image) in join_all(jobs).await {
            match image {
                Some(image) => {
                    self.delegate.did_download_image(&image, url, info);
                    for completion in group.completions {
                        let _ = completion.send(Ok(ImageLoadingResult {
                            image: image.clone(),
                            url: Some(url.clone()),
                            original_data: data.clone(),
                        }));
                    }
                }
                None => {
                    let error = ImageError::processing_failed(group.identifier, "data");
                    warn!(url = %url, error = %error, "Processing downloaded data failed");
                    for completion in group.completions {
                        let _ = completion.send(Err(error.clone()));
                    }
                }
            }
        }
    }
}

impl fmt::Debug for ImageDownloader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageDownloader")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

struct ProcessingGroup {
    identifier: String,
    processor: Arc<dyn ImageProcessor>,
    processing: ProcessingOptions,
    completions: Vec<oneshot::Sender<ImageResult<ImageLoadingResult>>>,
}

fn group_by_processor(callbacks: Vec<TaskCallback>) -> Vec<ProcessingGroup> {
    let mut groups: Vec<ProcessingGroup> = Vec::new();
    for callback in callbacks {
        let identifier = callback.options.processor.identifier();
        if let Some(group) = groups.iter_mut().find(|g| g.identifier == identifier) {
            group.completions.push(callback.completion);
        } else {
            groups.push(ProcessingGroup {
                identifier,
                processor: callback.options.processor.clone(),
                processing: callback.options.processing,
                completions: vec![callback.completion],
            });
        }
    }
    groups
}

fn fail_all(callbacks: Vec<TaskCallback>, error: &ImageError) {
    for callback in callbacks {
        let _ = callback.completion.send(Err(error.clone()));
    }
}

fn redirect_target(info: &ResponseInfo) -> Option<Url> {
    let location = info.headers.get(LOCATION)?.to_str().ok()?;
    info.url.join(location).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::ResizingImageProcessor;
    use crate::domain::ports::mocks::{MockReply, MockTransport, png_bytes};
    use crate::infrastructure::network::hooks::{AnyModifier, AnyRedirectHandler};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use reqwest::header::HeaderValue;

    const A: &str = "https://img.test/a.png";
    const B: &str = "https://img.test/b.png";

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn downloader(transport: MockTransport) -> (Arc<ImageDownloader>, Arc<MockTransport>) {
        let transport = Arc::new(transport);
        (
            Arc::new(ImageDownloader::new("test", transport.clone())),
            transport,
        )
    }

    #[tokio::test]
    async fn test_download_decodes_image() {
        let transport = MockTransport::new();
        transport.route(A, MockReply::ok(png_bytes(4, 3)));
        let (downloader, _) = downloader(transport);

        let result = downloader
            .download(url(A), DownloadOptions::default())
            .await
            .unwrap();
        assert_eq!((result.image.width(), result.image.height()), (4, 3));
        assert_eq!(result.url, Some(url(A)));
        assert_eq!(result.original_data, Bytes::from(png_bytes(4, 3)));
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_transfer() {
        let (transport, gate) = MockTransport::gated();
        transport.route(A, MockReply::ok(png_bytes(2, 2)));
        let (downloader, transport) = downloader(transport);

        let mut handles = Vec::new();
        for _ in 0..3 {
            handles.push(
                downloader
                    .download_image(url(A), DownloadOptions::default())
                    .await
                    .unwrap(),
            );
        }
        gate.add_permits(1);
        for handle in handles {
            assert_eq!(handle.wait().await.unwrap().image.width(), 2);
        }
        assert_eq!(transport.request_count(A), 1);
        assert_eq!(downloader.session().task_count(), 0);
    }

    #[tokio::test]
    async fn test_partial_cancel_leaves_others_running() {
        let (transport, gate) = MockTransport::gated();
        transport.route(A, MockReply::ok(png_bytes(2, 2)));
        let (downloader, transport) = downloader(transport);

        let first = downloader
            .download_image(url(A), DownloadOptions::default())
            .await
            .unwrap();
        let second = downloader
            .download_image(url(A), DownloadOptions::default())
            .await
            .unwrap();
        first.cancel();
        assert!(first.wait().await.unwrap_err().is_task_cancelled());

        gate.add_permits(1);
        assert!(second.wait().await.is_ok());
        assert_eq!(transport.request_count(A), 1);
    }

    #[tokio::test]
    async fn test_cancelling_every_callback_stops_transfer() {
        let (transport, _gate) = MockTransport::gated();
        transport.route(A, MockReply::ok(png_bytes(2, 2)));
        let (downloader, _) = downloader(transport);

        let handle = downloader
            .download_image(url(A), DownloadOptions::default())
            .await
            .unwrap();
        handle.cancel();
        let error = handle.wait().await.unwrap_err();
        assert!(error.is_task_cancelled());
        assert_eq!(downloader.session().task_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let (transport, _gate) = MockTransport::gated();
        let (downloader, _) = downloader(transport);
        let a = downloader
            .download_image(url(A), DownloadOptions::default())
            .await
            .unwrap();
        let b = downloader
            .download_image(url(B), DownloadOptions::default())
            .await
            .unwrap();
        downloader.cancel_all();
        assert!(a.wait().await.unwrap_err().is_task_cancelled());
        assert!(b.wait().await.unwrap_err().is_task_cancelled());
    }

    #[tokio::test]
    async fn test_invalid_status_code() {
        let transport = MockTransport::new();
        transport.route(A, MockReply::status(404));
        let (downloader, _) = downloader(transport);

        let error = downloader
            .download(url(A), DownloadOptions::default())
            .await
            .unwrap_err();
        assert!(error.is_invalid_response_status_code(Some(404)));
        assert_eq!(error.code(), 2002);
    }

    #[tokio::test]
    async fn test_transport_failure_is_session_error() {
        let transport = MockTransport::new();
        transport.route(A, MockReply::fail("connection reset"));
        let (downloader, _) = downloader(transport);

        let error = downloader
            .download(url(A), DownloadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            ImageError::Response(ResponseErrorReason::SessionError { .. })
        ));
    }

    #[tokio::test]
    async fn test_redirect_is_followed() {
        let transport = MockTransport::new();
        transport.route(A, MockReply::redirect("/b.png"));
        transport.route(B, MockReply::ok(png_bytes(5, 5)));
        let (downloader, transport) = downloader(transport);

        let result = downloader
            .download(url(A), DownloadOptions::default())
            .await
            .unwrap();
        assert_eq!(result.image.width(), 5);
        assert_eq!(transport.request_count(B), 1);
    }

    #[tokio::test]
    async fn test_redirect_handler_can_refuse() {
        let transport = MockTransport::new();
        transport.route(A, MockReply::redirect(B));
        transport.route(B, MockReply::ok(png_bytes(5, 5)));
        let (downloader, transport) = downloader(transport);

        let options = DownloadOptions {
            redirect_handler: Some(Arc::new(AnyRedirectHandler(
                |_: &ResponseInfo, _: DownloadRequest| -> Option<DownloadRequest> { None },
            ))),
            ..DownloadOptions::default()
        };
        let error = downloader.download(url(A), options).await.unwrap_err();
        assert!(matches!(error, ImageError::Processor(_)));
        assert_eq!(transport.request_count(B), 0);
    }

    #[tokio::test]
    async fn test_request_modifier_can_drop_request() {
        let (downloader, transport) = downloader(MockTransport::new());
        let options = DownloadOptions {
            request_modifier: Some(Arc::new(AnyModifier(
                |_: DownloadRequest| -> Option<DownloadRequest> { None },
            ))),
            ..DownloadOptions::default()
        };
        let error = downloader.download(url(A), options).await.unwrap_err();
        assert!(matches!(
            error,
            ImageError::Request(RequestErrorReason::EmptyRequest)
        ));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_non_http_url_is_rejected() {
        let (downloader, _) = downloader(MockTransport::new());
        let error = downloader
            .download(url("ftp://img.test/a.png"), DownloadOptions::default())
            .await
            .unwrap_err();
        assert_eq!(error.code(), 1002);
    }

    #[tokio::test]
    async fn test_progress_reports_received_bytes() {
        let body = png_bytes(8, 8);
        let (head, tail) = body.split_at(body.len() / 2);
        let transport = MockTransport::new();
        transport.route(
            A,
            MockReply::chunked(vec![
                Bytes::copy_from_slice(head),
                Bytes::copy_from_slice(tail),
            ]),
        );
        let (downloader, _) = downloader(transport);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let options = DownloadOptions {
            progress: vec![ProgressSideEffect::new(move |received, total| {
                sink.lock().push((received, total));
            })],
            ..DownloadOptions::default()
        };
        downloader.download(url(A), options).await.unwrap();

        let total = body.len() as u64;
        assert_eq!(
            *seen.lock(),
            vec![(head.len() as u64, Some(total)), (total, Some(total))]
        );
    }

    struct StaticCredential;

    #[async_trait]
    impl AuthenticationChallengeResponder for StaticCredential {
        async fn challenge(&self, challenge: &AuthChallenge) -> ChallengeDisposition {
            assert_eq!(challenge.www_authenticate, "Basic realm=\"img\"");
            ChallengeDisposition::UseCredential(HeaderValue::from_static("Basic dXNlcjpwdw=="))
        }
    }

    #[tokio::test]
    async fn test_authentication_challenge_resends_with_credential() {
        let transport = MockTransport::new();
        transport
            .route(
                A,
                MockReply::status(401).with_header("www-authenticate", "Basic realm=\"img\""),
            )
            .route(A, MockReply::ok(png_bytes(1, 1)));
        let transport = Arc::new(transport);
        let downloader = Arc::new(
            ImageDownloader::new("auth", transport.clone())
                .with_authentication_responder(Arc::new(StaticCredential)),
        );

        downloader
            .download(url(A), DownloadOptions::default())
            .await
            .unwrap();
        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].headers.get(AUTHORIZATION).is_none());
        assert_eq!(requests[1].headers[AUTHORIZATION], "Basic dXNlcjpwdw==");
    }

    #[tokio::test]
    async fn test_processors_share_transfer_but_not_output() {
        let (transport, gate) = MockTransport::gated();
        transport.route(A, MockReply::ok(png_bytes(8, 8)));
        let (downloader, transport) = downloader(transport);

        let plain = downloader
            .download_image(url(A), DownloadOptions::default())
            .await
            .unwrap();
        let resized = downloader
            .download_image(
                url(A),
                DownloadOptions {
                    processor: Arc::new(ResizingImageProcessor::new(2, 2)),
                    ..DownloadOptions::default()
                },
            )
            .await
            .unwrap();
        gate.add_permits(1);

        assert_eq!(plain.wait().await.unwrap().image.width(), 8);
        assert_eq!(resized.wait().await.unwrap().image.width(), 2);
        assert_eq!(transport.request_count(A), 1);
    }

    struct RejectingDelegate;

    impl ImageDownloaderDelegate for RejectingDelegate {
        fn did_download_data(&self, _data: Bytes, _response: &ResponseInfo) -> Option<Bytes> {
            None
        }
    }

    #[tokio::test]
    async fn test_delegate_can_reject_data() {
        let transport = MockTransport::new();
        transport.route(A, MockReply::ok(png_bytes(1, 1)));
        let downloader = Arc::new(
            ImageDownloader::new("reject", Arc::new(transport))
                .with_delegate(Arc::new(RejectingDelegate)),
        );
        let error = downloader
            .download(url(A), DownloadOptions::default())
            .await
            .unwrap_err();
        assert_eq!(error.code(), 2004);
    }

    #[tokio::test]
    async fn test_undecodable_data_is_processing_error() {
        let transport = MockTransport::new();
        transport.route(A, MockReply::ok(&b"not an image"[..]));
        let (downloader, _) = downloader(transport);
        let error = downloader
            .download(url(A), DownloadOptions::default())
            .await
            .unwrap_err();
        assert_eq!(error.code(), 4001);
    }
}
