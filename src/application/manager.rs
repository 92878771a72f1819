//! Retrieval orchestration: cache lookup, loading, retries, alternative
//! sources and cache writeback.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::coordinator::{CacheCallbackCoordinator, CoordinatorAction};
use super::options::RetrieveOptions;
use crate::domain::entities::{CacheType, Image, ImageLoadingResult, RetrieveImageResult, Source};
use crate::domain::errors::{ImageError, ImageResult, ImageSettingErrorReason, PropagationError};
use crate::domain::ports::{ImageProcessor, ProcessItem, RetryContext, RetryDecision};
use crate::infrastructure::cache::ImageCache;
use crate::infrastructure::network::{DownloadTask, ImageDownloader};

/// Per-request state carried across alternative sources.
#[derive(Debug)]
pub struct RetrievingContext {
    /// The source the caller asked for.
    pub original_source: Source,
    alternative_sources: VecDeque<Source>,
    propagation_errors: Vec<PropagationError>,
}

impl RetrievingContext {
    /// Creates a context for `original_source` with fallbacks.
    #[must_use]
    pub fn new(original_source: Source, alternative_sources: Vec<Source>) -> Self {
        Self {
            original_source,
            alternative_sources: alternative_sources.into(),
            propagation_errors: Vec::new(),
        }
    }

    /// Next fallback, if any.
    pub fn pop_alternative_source(&mut self) -> Option<Source> {
        self.alternative_sources.pop_front()
    }

    /// Records the failure of `source`.
    pub fn append_error(&mut self, source: Source, error: ImageError) {
        self.propagation_errors.push(PropagationError { source, error });
    }

    /// Failures recorded so far, in attempt order.
    #[must_use]
    pub fn propagation_errors(&self) -> &[PropagationError] {
        &self.propagation_errors
    }
}

/// Cancellation state shared between a [`RetrieveTask`] and its worker.
#[derive(Debug)]
pub(crate) struct RetrieveControl {
    identifier: u64,
    cancelled: AtomicBool,
    download: Mutex<Option<DownloadTask>>,
}

impl RetrieveControl {
    fn new(identifier: u64) -> Self {
        Self {
            identifier,
            cancelled: AtomicBool::new(false),
            download: Mutex::new(None),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn set_download(&self, task: DownloadTask) {
        let mut download = self.download.lock();
        if self.is_cancelled() {
            task.cancel();
        } else {
            *download = Some(task);
        }
    }

    fn clear_download(&self) {
        self.download.lock().take();
    }

    pub(crate) fn cancel(&self) {
        let task = {
            let mut download = self.download.lock();
            self.cancelled.store(true, Ordering::SeqCst);
            download.take()
        };
        if let Some(task) = task {
            task.cancel();
        }
    }

    fn cancelled_error(&self, source: &Source) -> ImageError {
        ImageError::cancelled(source.url(), self.identifier)
    }
}

/// A running retrieval.
#[derive(Debug)]
pub struct RetrieveTask {
    control: Arc<RetrieveControl>,
    receiver: oneshot::Receiver<ImageResult<RetrieveImageResult>>,
    source: Source,
}

impl RetrieveTask {
    /// Identifier issued by the manager.
    #[must_use]
    pub fn identifier(&self) -> u64 {
        self.control.identifier
    }

    /// Cancels the current download and stops the retrieval.
    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub(crate) fn control(&self) -> Arc<RetrieveControl> {
        self.control.clone()
    }

    /// Waits for the outcome.
    ///
    /// # Errors
    /// Returns the retrieval error.
    pub async fn wait(self) -> ImageResult<RetrieveImageResult> {
        let Self {
            control,
            receiver,
            source,
        } = self;
        receiver
            .await
            .unwrap_or_else(|_| Err(control.cancelled_error(&source)))
    }
}

/// Retrieves images through a cache and a downloader.
pub struct ImageManager {
    cache: Arc<ImageCache>,
    downloader: Arc<ImageDownloader>,
    next_identifier: AtomicU64,
}

impl ImageManager {
    /// Creates a manager.
    #[must_use]
    pub fn new(cache: Arc<ImageCache>, downloader: Arc<ImageDownloader>) -> Self {
        Self {
            cache,
            downloader,
            next_identifier: AtomicU64::new(1),
        }
    }

    /// Default cache.
    #[must_use]
    pub const fn cache(&self) -> &Arc<ImageCache> {
        &self.cache
    }

    /// Default downloader.
    #[must_use]
    pub const fn downloader(&self) -> &Arc<ImageDownloader> {
        &self.downloader
    }

    /// Issues a fresh task identifier.
    pub fn next_identifier(&self) -> u64 {
        self.next_identifier.fetch_add(1, Ordering::Relaxed)
    }

    /// Starts a retrieval and returns its handle.
    pub fn retrieve_image(self: &Arc<Self>, source: Source, options: RetrieveOptions) -> RetrieveTask {
        let identifier = self.next_identifier();
        self.retrieve_image_with_identifier(identifier, source, options)
    }

    pub(crate) fn retrieve_image_with_identifier(
        self: &Arc<Self>,
        identifier: u64,
        source: Source,
        options: RetrieveOptions,
    ) -> RetrieveTask {
        let control = Arc::new(RetrieveControl::new(identifier));
        let (tx, rx) = oneshot::channel();
        let manager = self.clone();
        let worker_control = control.clone();
        let worker_source = source.clone();
        tokio::spawn(async move {
            let result = manager
                .retrieve_with_alternatives(worker_source, &options, &worker_control)
                .await;
            let _ = tx.send(result);
        });
        RetrieveTask {
            control,
            receiver: rx,
            source,
        }
    }

    /// Retrieves an image and waits for it.
    ///
    /// # Errors
    /// Returns the retrieval error.
    pub async fn retrieve(
        self: &Arc<Self>,
        source: Source,
        options: RetrieveOptions,
    ) -> ImageResult<RetrieveImageResult> {
        self.retrieve_image(source, options).wait().await
    }

    async fn retrieve_with_alternatives(
        &self,
        source: Source,
        options: &RetrieveOptions,
        control: &RetrieveControl,
    ) -> ImageResult<RetrieveImageResult> {
        let mut context = RetrievingContext::new(source.clone(), options.alternative_sources.clone());
        let mut current = source;
        loop {
            let error = match self.retrieve_with_retry(&current, &context, options, control).await {
                Ok(result) => return Ok(result),
                Err(error) => error,
            };
            if error.is_task_cancelled() || error.is_not_current_task() {
                return Err(error);
            }
            match context.pop_alternative_source() {
                Some(next) => {
                    debug!(failed = %current, next = %next, error = %error, "Trying alternative source");
                    context.append_error(current, error);
                    current = next;
                }
                None if context.propagation_errors().is_empty() => return Err(error),
                None => {
                    context.append_error(current, error);
                    return Err(ImageSettingErrorReason::AlternativeSourcesExhausted {
                        errors: context.propagation_errors,
                    }
                    .into());
                }
            }
        }
    }

    async fn retrieve_with_retry(
        &self,
        source: &Source,
        context: &RetrievingContext,
        options: &RetrieveOptions,
        control: &RetrieveControl,
    ) -> ImageResult<RetrieveImageResult> {
        let mut retry: Option<RetryContext> = None;
        loop {
            let error = match self.retrieve_once(source, context, options, control).await {
                Ok(result) => return Ok(result),
                Err(error) => error,
            };
            if error.is_task_cancelled() {
                return Err(error);
            }
            let Some(strategy) = &options.retry_strategy else {
                return Err(error);
            };
            let retry_context = match retry.take() {
                Some(mut retry_context) => {
                    retry_context.increase_retry_count(error);
                    retry_context
                }
                None => RetryContext::new(source.clone(), error),
            };
            match strategy.retry(&retry_context).await {
                RetryDecision::Retry if control.is_cancelled() => {
                    return Err(control.cancelled_error(source));
                }
                RetryDecision::Retry => retry = Some(retry_context),
                RetryDecision::Stop => return Err(retry_context.error),
            }
        }
    }

    async fn retrieve_once(
        &self,
        source: &Source,
        context: &RetrievingContext,
        options: &RetrieveOptions,
        control: &RetrieveControl,
    ) -> ImageResult<RetrieveImageResult> {
        if control.is_cancelled() {
            return Err(control.cancelled_error(source));
        }
        let target = options.target_cache.clone().unwrap_or_else(|| self.cache.clone());
        let original = options.original_cache.clone().unwrap_or_else(|| target.clone());

        if !options.force_refresh {
            if let Some(result) = self
                .retrieve_from_cache(source, context, options, &target, &original)
                .await?
            {
                return Ok(result);
            }
            if options.only_from_cache {
                return Err(ImageError::not_existing(source.cache_key()));
            }
        }

        let loaded = self.load(source, options, control).await?;
        Ok(self
            .cache_image(source, context, options, &target, &original, loaded)
            .await)
    }

    async fn retrieve_from_cache(
        &self,
        source: &Source,
        context: &RetrievingContext,
        options: &RetrieveOptions,
        target: &Arc<ImageCache>,
        original: &Arc<ImageCache>,
    ) -> ImageResult<Option<RetrieveImageResult>> {
        let key = source.cache_key();
        let cache_options = options.cache_options();
        let cached_type = target.image_cached_type(&key, &cache_options.processor_identifier);
        let usable = cached_type.is_cached()
            && (!options.from_memory_cache_or_refresh || cached_type == CacheType::Memory);
        if usable {
            let cached = target.retrieve_image(&key, &cache_options).await?;
            let cache_type = cached.cache_type();
            if let Some(image) = cached.into_image() {
                trace!(key = %key, cache = %cache_type, "Served from cache");
                return Ok(Some(RetrieveImageResult {
                    image,
                    cache_type,
                    source: source.clone(),
                    original_source: context.original_source.clone(),
                }));
            }
        }
        if options.from_memory_cache_or_refresh {
            return Ok(None);
        }
        if Arc::ptr_eq(target, original) && options.processor.is_default() {
            return Ok(None);
        }

        let original_options = options.original_cache_options();
        if !original.image_cached_type(&key, "").is_cached() {
            return Ok(None);
        }
        let Some(unprocessed) = original
            .retrieve_image(&key, &original_options)
            .await?
            .into_image()
        else {
            return Ok(None);
        };

        debug!(key = %key, processor = %cache_options.processor_identifier, "Reprocessing cached original");
        let processed = run_processor(
            options.processor.clone(),
            ProcessItem::Image(unprocessed),
            options,
        )
        .await?;

        let (coordinator, triggered) = CacheCallbackCoordinator::new(options.wait_for_cache, false);
        let coordinator = Arc::new(coordinator);
        let store = target.store(
            processed.clone(),
            None,
            &key,
            &cache_options,
            !options.cache_memory_only,
        );
        coordinator.apply(CoordinatorAction::CacheInitiated);
        let image_done = coordinator.clone();
        tokio::spawn(async move {
            store.await;
            image_done.apply(CoordinatorAction::CachingImage);
        });
        let _ = triggered.await;

        Ok(Some(RetrieveImageResult {
            image: modify(options, processed),
            cache_type: CacheType::None,
            source: source.clone(),
            original_source: context.original_source.clone(),
        }))
    }

    async fn load(
        &self,
        source: &Source,
        options: &RetrieveOptions,
        control: &RetrieveControl,
    ) -> ImageResult<ImageLoadingResult> {
        match source {
            Source::Network(resource) => {
                let downloader = options.downloader.as_ref().unwrap_or(&self.downloader);
                let handle = downloader
                    .download_image(resource.download_url(), options.download_options())
                    .await?;
                control.set_download(handle.task().clone());
                let result = handle.wait().await;
                control.clear_download();
                result
            }
            Source::Provider(provider) => {
                let data = provider.data().await.map_err(|e| {
                    ImageError::from(ImageSettingErrorReason::DataProviderError {
                        cache_key: provider.cache_key(),
                        message: e.to_string(),
                    })
                })?;
                if control.is_cancelled() {
                    return Err(control.cancelled_error(source));
                }
                let image = run_processor(
                    options.processor.clone(),
                    ProcessItem::Data(data.clone()),
                    options,
                )
                .await?;
                Ok(ImageLoadingResult {
                    image,
                    url: provider.content_url(),
                    original_data: data,
                })
            }
        }
    }

    async fn cache_image(
        &self,
        source: &Source,
        context: &RetrievingContext,
        options: &RetrieveOptions,
        target: &Arc<ImageCache>,
        original: &Arc<ImageCache>,
        loaded: ImageLoadingResult,
    ) -> RetrieveImageResult {
        let key = source.cache_key();
        let cache_options = options.cache_options();
        let needs_original = options.needs_original_cache();
        let (coordinator, triggered) =
            CacheCallbackCoordinator::new(options.wait_for_cache, needs_original);
        let coordinator = Arc::new(coordinator);

        let store = target.store(
            loaded.image.clone(),
            Some(loaded.original_data.clone()),
            &key,
            &cache_options,
            !options.cache_memory_only,
        );
        let original_store = needs_original.then(|| {
            original.store_to_disk(
                loaded.original_data.to_vec(),
                &key,
                "",
                options.disk_expiration,
            )
        });

        coordinator.apply(CoordinatorAction::CacheInitiated);
        let image_done = coordinator.clone();
        tokio::spawn(async move {
            store.await;
            image_done.apply(CoordinatorAction::CachingImage);
        });
        if let Some(original_store) = original_store {
            let original_done = coordinator.clone();
            tokio::spawn(async move {
                if let Err(e) = original_store.await {
                    warn!(error = %e, "Failed to store original image data");
                }
                original_done.apply(CoordinatorAction::CachingOriginalImage);
            });
        }
        let _ = triggered.await;

        RetrieveImageResult {
            image: modify(options, loaded.image),
            cache_type: CacheType::None,
            source: source.clone(),
            original_source: context.original_source.clone(),
        }
    }
}

impl fmt::Debug for ImageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageManager")
            .field("cache", &self.cache.name())
            .field("downloader", &self.downloader.name())
            .finish_non_exhaustive()
    }
}

async fn run_processor(
    processor: Arc<dyn ImageProcessor>,
    item: ProcessItem,
    options: &RetrieveOptions,
) -> ImageResult<Image> {
    let identifier = processor.identifier();
    let kind = item.kind();
    let processing = options.processing;
    tokio::task::spawn_blocking(move || processor.process(&item, &processing))
        .await
        .ok()
        .flatten()
        .ok_or_else(|| ImageError::processing_failed(identifier, kind))
}

fn modify(options: &RetrieveOptions, image: Image) -> Image {
    match &options.image_modifier {
        Some(modifier) => modifier.modify(image),
        None => image,
    }
}
