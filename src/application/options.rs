//! Options for a single retrieval.

use std::fmt;
use std::sync::Arc;

use crate::domain::entities::{ExpirationExtending, Source, StorageExpiration};
use crate::domain::ports::{
    CacheSerializer, DefaultCacheSerializer, DefaultImageProcessor, ImageModifier, ImageProcessor,
    ProcessingOptions, RetryStrategy,
};
use crate::infrastructure::cache::{CacheOptions, ImageCache};
use crate::infrastructure::network::{
    DownloadOptions, ImageDownloader, ProgressSideEffect, RedirectHandler, RequestModifier,
};

/// Everything that shapes one call to
/// [`ImageManager::retrieve_image`](super::ImageManager::retrieve_image).
///
/// Unset caches and downloader fall back to the manager's own.
#[derive(Clone)]
pub struct RetrieveOptions {
    /// Cache holding processed images.
    pub target_cache: Option<Arc<ImageCache>>,
    /// Cache holding unprocessed originals. Defaults to the target cache.
    pub original_cache: Option<Arc<ImageCache>>,
    /// Downloader for network sources.
    pub downloader: Option<Arc<ImageDownloader>>,
    /// Skip every cache lookup.
    pub force_refresh: bool,
    /// Only consult the memory tier before loading.
    pub from_memory_cache_or_refresh: bool,
    /// Never write to disk.
    pub cache_memory_only: bool,
    /// Resolve only after cache writes finish.
    pub wait_for_cache: bool,
    /// Fail instead of loading on a cache miss.
    pub only_from_cache: bool,
    /// Processor applied to loaded data.
    pub processor: Arc<dyn ImageProcessor>,
    /// Decoding hints.
    pub processing: ProcessingOptions,
    /// Serializer for the disk tier.
    pub serializer: Arc<dyn CacheSerializer>,
    /// Applied to every delivered image.
    pub image_modifier: Option<Arc<dyn ImageModifier>>,
    /// Also keep the unprocessed bytes in the original cache.
    pub cache_original_image: bool,
    /// Read the disk tier on the calling task.
    pub load_disk_file_synchronously: bool,
    /// Memory expiration override.
    pub memory_expiration: Option<StorageExpiration>,
    /// Memory extension policy.
    pub memory_extending: ExpirationExtending,
    /// Disk expiration override.
    pub disk_expiration: Option<StorageExpiration>,
    /// Disk extension policy.
    pub disk_extending: ExpirationExtending,
    /// Tried in order when the main source fails.
    pub alternative_sources: Vec<Source>,
    /// Decides whether a failed source is tried again.
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,
    /// Rewrites download requests.
    pub request_modifier: Option<Arc<dyn RequestModifier>>,
    /// Consulted on redirects.
    pub redirect_handler: Option<Arc<dyn RedirectHandler>>,
    /// Download progress reporting.
    pub progress: Vec<ProgressSideEffect>,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            target_cache: None,
            original_cache: None,
            downloader: None,
            force_refresh: false,
            from_memory_cache_or_refresh: false,
            cache_memory_only: false,
            wait_for_cache: false,
            only_from_cache: false,
            processor: Arc::new(DefaultImageProcessor),
            processing: ProcessingOptions::default(),
            serializer: Arc::new(DefaultCacheSerializer::default()),
            image_modifier: None,
            cache_original_image: false,
            load_disk_file_synchronously: false,
            memory_expiration: None,
            memory_extending: ExpirationExtending::CacheTime,
            disk_expiration: None,
            disk_extending: ExpirationExtending::CacheTime,
            alternative_sources: Vec::new(),
            retry_strategy: None,
            request_modifier: None,
            redirect_handler: None,
            progress: Vec::new(),
        }
    }
}

impl RetrieveOptions {
    /// Sets the processor.
    #[must_use]
    pub fn with_processor(mut self, processor: Arc<dyn ImageProcessor>) -> Self {
        self.processor = processor;
        self
    }

    /// Sets the alternative sources.
    #[must_use]
    pub fn with_alternative_sources(mut self, sources: Vec<Source>) -> Self {
        self.alternative_sources = sources;
        self
    }

    /// Sets the retry strategy.
    #[must_use]
    pub fn with_retry_strategy(mut self, strategy: Arc<dyn RetryStrategy>) -> Self {
        self.retry_strategy = Some(strategy);
        self
    }

    /// Sets the image modifier.
    #[must_use]
    pub fn with_image_modifier(mut self, modifier: Arc<dyn ImageModifier>) -> Self {
        self.image_modifier = Some(modifier);
        self
    }

    /// Adds a progress side effect.
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressSideEffect) -> Self {
        self.progress.push(progress);
        self
    }

    /// Identifier of the configured processor.
    #[must_use]
    pub fn processor_identifier(&self) -> String {
        self.processor.identifier()
    }

    /// Cache options for the processed rendition.
    #[must_use]
    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            processor_identifier: self.processor_identifier(),
            serializer: self.serializer.clone(),
            processing: self.processing,
            memory_expiration: self.memory_expiration,
            memory_extending: self.memory_extending,
            disk_expiration: self.disk_expiration,
            disk_extending: self.disk_extending,
            load_disk_file_synchronously: self.load_disk_file_synchronously,
            from_memory_cache_or_refresh: self.from_memory_cache_or_refresh,
            image_modifier: self.image_modifier.clone(),
        }
    }

    /// Cache options for the unprocessed original.
    #[must_use]
    pub fn original_cache_options(&self) -> CacheOptions {
        CacheOptions {
            processor_identifier: String::new(),
            image_modifier: None,
            from_memory_cache_or_refresh: false,
            ..self.cache_options()
        }
    }

    /// Download options derived from this set.
    #[must_use]
    pub fn download_options(&self) -> DownloadOptions {
        DownloadOptions {
            processor: self.processor.clone(),
            processing: self.processing,
            request_modifier: self.request_modifier.clone(),
            redirect_handler: self.redirect_handler.clone(),
            progress: self.progress.clone(),
        }
    }

    /// Whether the original bytes go to the original cache too.
    #[must_use]
    pub fn needs_original_cache(&self) -> bool {
        self.cache_original_image && !self.processor.is_default()
    }
}

impl fmt::Debug for RetrieveOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrieveOptions")
            .field("processor", &self.processor_identifier())
            .field("force_refresh", &self.force_refresh)
            .field("from_memory_cache_or_refresh", &self.from_memory_cache_or_refresh)
            .field("cache_memory_only", &self.cache_memory_only)
            .field("wait_for_cache", &self.wait_for_cache)
            .field("only_from_cache", &self.only_from_cache)
            .field("cache_original_image", &self.cache_original_image)
            .field("alternative_sources", &self.alternative_sources)
            .field("retry_strategy", &self.retry_strategy.is_some())
            .finish_non_exhaustive()
    }
}
