//! Network retrieval: request coalescing, the downloader and its hooks.

mod downloader;
mod hooks;
mod http;
mod session;

pub use downloader::{DEFAULT_DOWNLOAD_TIMEOUT, DownloadHandle, DownloadOptions, ImageDownloader};
pub use hooks::{
    AnyModifier, AnyRedirectHandler, AuthChallenge, AuthenticationChallengeResponder,
    ChallengeDisposition, DEFAULT_VALID_STATUS, DefaultDownloaderDelegate,
    ImageDownloaderDelegate, ProgressSideEffect, RedirectHandler, RequestModifier, ResponseInfo,
};
pub use http::ReqwestTransport;
pub use session::{DownloadTask, Registration, SessionDataTask, SessionDelegate, TaskCallback};
