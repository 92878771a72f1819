//! Image retrieval error types.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use url::Url;

use crate::domain::entities::Source;

/// Result type for image operations.
pub type ImageResult<T> = std::result::Result<T, ImageError>;

/// Top-level error for every retrieval, download and cache operation.
#[derive(Debug, Clone, Error)]
pub enum ImageError {
    /// The request could not be built or was cancelled.
    #[error(transparent)]
    Request(#[from] RequestErrorReason),
    /// The server response was unusable.
    #[error(transparent)]
    Response(#[from] ResponseErrorReason),
    /// A cache tier failed.
    #[error(transparent)]
    Cache(#[from] CacheErrorReason),
    /// A processor produced no image.
    #[error(transparent)]
    Processor(#[from] ProcessorErrorReason),
    /// The retrieval as a whole failed.
    #[error(transparent)]
    ImageSetting(#[from] ImageSettingErrorReason),
}

/// Request error variants.
#[derive(Debug, Clone, Error)]
#[allow(missing_docs)]
pub enum RequestErrorReason {
    #[error("the request is empty")]
    EmptyRequest,

    #[error("the request URL is invalid: {url}")]
    InvalidUrl { url: String },

    #[error("the task was cancelled (token {token})")]
    TaskCancelled { url: Option<Url>, token: u64 },
}

/// Response error variants.
#[derive(Debug, Clone, Error)]
#[allow(missing_docs)]
pub enum ResponseErrorReason {
    #[error("the response is not an HTTP response: {url}")]
    InvalidUrlResponse { url: Url },

    #[error("invalid HTTP status code {status} for {url}")]
    InvalidHttpStatusCode { url: Url, status: u16 },

    #[error("session error for {url}: {message}")]
    SessionError { url: Url, message: String },

    #[error("the downloaded data was rejected while modifying it: {url}")]
    DataModifyingFailed { url: Url },

    #[error("no response was received: {url}")]
    NoUrlResponse { url: Url },
}

/// Cache error variants.
#[derive(Debug, Clone, Error)]
#[allow(missing_docs)]
pub enum CacheErrorReason {
    #[error("cannot enumerate files under {}", path.display())]
    FileEnumeratorCreationFailed { path: PathBuf },

    #[error("unexpected entry while enumerating {}", path.display())]
    InvalidFileEnumeratorContent { path: PathBuf },

    #[error("cannot read metadata of {}", path.display())]
    InvalidUrlResource {
        path: PathBuf,
        #[source]
        error: Arc<io::Error>,
    },

    #[error("cannot load data from {}", path.display())]
    CannotLoadDataFromDisk {
        path: PathBuf,
        #[source]
        error: Arc<io::Error>,
    },

    #[error("cannot create directory {}", path.display())]
    CannotCreateDirectory {
        path: PathBuf,
        #[source]
        error: Arc<io::Error>,
    },

    #[error("image not existing in cache: {key}")]
    ImageNotExisting { key: String },

    #[error("cannot convert value to data for {key}: {message}")]
    CannotConvertToData { key: String, message: String },

    #[error("cannot serialize image for {key}")]
    CannotSerializeImage { key: String },

    #[error("cannot create cache file {} for {key}", path.display())]
    CannotCreateCacheFile {
        path: PathBuf,
        key: String,
        #[source]
        error: Arc<io::Error>,
    },

    #[error("cannot set attributes of cache file {}", path.display())]
    CannotSetCacheFileAttribute {
        path: PathBuf,
        #[source]
        error: Arc<io::Error>,
    },

    #[error("cannot remove file {}", path.display())]
    CannotRemoveFile {
        path: PathBuf,
        #[source]
        error: Arc<io::Error>,
    },

    #[error("the cache I/O queue is closed")]
    IoQueueClosed,
}

/// Processor error variants.
#[derive(Debug, Clone, Error)]
#[allow(missing_docs)]
pub enum ProcessorErrorReason {
    #[error("processor '{identifier}' failed on {item}")]
    ProcessingFailed { identifier: String, item: String },
}

/// Retrieval error variants.
#[derive(Debug, Clone, Error)]
#[allow(missing_docs)]
pub enum ImageSettingErrorReason {
    #[error("the source is empty")]
    EmptySource,

    #[error("a newer request superseded the task for {requested}")]
    NotCurrentSourceTask { requested: Source },

    #[error("data provider failed for {cache_key}: {message}")]
    DataProviderError { cache_key: String, message: String },

    #[error("all alternative sources failed ({} attempts)", errors.len())]
    AlternativeSourcesExhausted { errors: Vec<PropagationError> },
}

/// A per-source failure kept while trying alternative sources.
#[derive(Debug, Clone)]
pub struct PropagationError {
    /// The source that failed.
    pub source: Source,
    /// Why it failed.
    pub error: ImageError,
}

impl RequestErrorReason {
    /// Stable numeric code.
    #[must_use]
    pub const fn code(&self) -> u32 {
        match self {
            Self::EmptyRequest => 1001,
            Self::InvalidUrl { .. } => 1002,
            Self::TaskCancelled { .. } => 1003,
        }
    }
}

impl ResponseErrorReason {
    /// Stable numeric code.
    #[must_use]
    pub const fn code(&self) -> u32 {
        match self {
            Self::InvalidUrlResponse { .. } => 2001,
            Self::InvalidHttpStatusCode { .. } => 2002,
            Self::SessionError { .. } => 2003,
            Self::DataModifyingFailed { .. } => 2004,
            Self::NoUrlResponse { .. } => 2005,
        }
    }
}

impl CacheErrorReason {
    /// Stable numeric code.
    #[must_use]
    pub const fn code(&self) -> u32 {
        match self {
            Self::FileEnumeratorCreationFailed { .. } => 3001,
            Self::InvalidFileEnumeratorContent { .. } => 3002,
            Self::InvalidUrlResource { .. } => 3003,
            Self::CannotLoadDataFromDisk { .. } => 3004,
            Self::CannotCreateDirectory { .. } => 3005,
            Self::ImageNotExisting { .. } => 3006,
            Self::CannotConvertToData { .. } => 3007,
            Self::CannotSerializeImage { .. } => 3008,
            Self::CannotCreateCacheFile { .. } => 3009,
            Self::CannotSetCacheFileAttribute { .. } => 3010,
            Self::CannotRemoveFile { .. } => 3011,
            Self::IoQueueClosed => 3012,
        }
    }
}

impl ProcessorErrorReason {
    /// Stable numeric code.
    #[must_use]
    pub const fn code(&self) -> u32 {
        match self {
            Self::ProcessingFailed { .. } => 4001,
        }
    }
}

impl ImageSettingErrorReason {
    /// Stable numeric code.
    #[must_use]
    pub const fn code(&self) -> u32 {
        match self {
            Self::EmptySource => 5001,
            Self::NotCurrentSourceTask { .. } => 5002,
            Self::DataProviderError { .. } => 5003,
            Self::AlternativeSourcesExhausted { .. } => 5004,
        }
    }
}

impl ImageError {
    /// Creates a cancellation error.
    #[must_use]
    pub const fn cancelled(url: Option<Url>, token: u64) -> Self {
        Self::Request(RequestErrorReason::TaskCancelled { url, token })
    }

    /// Creates a cache-miss error for cache-only retrievals.
    #[must_use]
    pub fn not_existing(key: impl Into<String>) -> Self {
        Self::Cache(CacheErrorReason::ImageNotExisting { key: key.into() })
    }

    /// Creates a transport error.
    #[must_use]
    pub fn session(url: Url, message: impl Into<String>) -> Self {
        Self::Response(ResponseErrorReason::SessionError {
            url,
            message: message.into(),
        })
    }

    /// Creates a processing error.
    #[must_use]
    pub fn processing_failed(identifier: impl Into<String>, item: impl Into<String>) -> Self {
        Self::Processor(ProcessorErrorReason::ProcessingFailed {
            identifier: identifier.into(),
            item: item.into(),
        })
    }

    /// Stable numeric code of the underlying reason.
    #[must_use]
    pub const fn code(&self) -> u32 {
        match self {
            Self::Request(reason) => reason.code(),
            Self::Response(reason) => reason.code(),
            Self::Cache(reason) => reason.code(),
            Self::Processor(reason) => reason.code(),
            Self::ImageSetting(reason) => reason.code(),
        }
    }

    /// Returns whether the error is a task cancellation.
    #[must_use]
    pub const fn is_task_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Request(RequestErrorReason::TaskCancelled { .. })
        )
    }

    /// Returns whether the error is an invalid status code, optionally a
    /// specific one.
    #[must_use]
    pub fn is_invalid_response_status_code(&self, code: Option<u16>) -> bool {
        match self {
            Self::Response(ResponseErrorReason::InvalidHttpStatusCode { status, .. }) => {
                code.is_none_or(|expected| expected == *status)
            }
            _ => false,
        }
    }

    /// Returns whether a newer request superseded this one.
    #[must_use]
    pub const fn is_not_current_task(&self) -> bool {
        matches!(
            self,
            Self::ImageSetting(ImageSettingErrorReason::NotCurrentSourceTask { .. })
        )
    }

    /// Returns whether the error came from the response stage.
    #[must_use]
    pub const fn is_response_error(&self) -> bool {
        matches!(self, Self::Response(_))
    }

    /// Per-source errors when every alternative source failed.
    #[must_use]
    pub fn propagation_errors(&self) -> Option<&[PropagationError]> {
        match self {
            Self::ImageSetting(ImageSettingErrorReason::AlternativeSourcesExhausted { errors }) => {
                Some(errors)
            }
            _ => None,
        }
    }
}

impl CacheErrorReason {
    /// Wraps an I/O error for a directory creation failure.
    #[must_use]
    pub fn cannot_create_directory(path: PathBuf, error: io::Error) -> Self {
        Self::CannotCreateDirectory {
            path,
            error: Arc::new(error),
        }
    }

    /// Wraps an I/O error for a failed read.
    #[must_use]
    pub fn cannot_load(path: PathBuf, error: io::Error) -> Self {
        Self::CannotLoadDataFromDisk {
            path,
            error: Arc::new(error),
        }
    }

    /// Wraps an I/O error for a failed removal.
    #[must_use]
    pub fn cannot_remove(path: PathBuf, error: io::Error) -> Self {
        Self::CannotRemoveFile {
            path,
            error: Arc::new(error),
        }
    }
}
