//! Two-tier image cache composing memory and disk storage.

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use super::disk_storage::{DiskConfig, DiskStorage};
use super::memory_storage::{MemoryConfig, MemoryStorage};
use super::serial_queue::{QueueClosed, SerialQueue};
use crate::domain::entities::{
    CacheType, ExpirationExtending, Image, ImageCacheResult, StorageExpiration, computed_key,
};
use crate::domain::errors::{CacheErrorReason, ImageError, ImageResult};
use crate::domain::ports::{
    CacheSerializer, DefaultCacheSerializer, ImageModifier, ProcessingOptions,
};

/// Default memory cost limit (256 MiB of decoded pixels).
pub const DEFAULT_MEMORY_COST_LIMIT: usize = 256 * 1024 * 1024;

const EVENT_CHANNEL_CAPACITY: usize = 16;

impl From<QueueClosed> for ImageError {
    fn from(_: QueueClosed) -> Self {
        Self::Cache(CacheErrorReason::IoQueueClosed)
    }
}

/// Notifications emitted by an [`ImageCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// Files were removed by an expiry or size sweep.
    DiskCacheCleaned {
        /// File names (hashes) of the removed files.
        hashes: Vec<String>,
    },
}

/// Host application lifecycle signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The system is low on memory.
    MemoryWarning,
    /// The application is about to exit.
    WillTerminate,
    /// The application moved to the background.
    DidEnterBackground,
}

/// Outcome of storing into both tiers.
#[derive(Debug, Clone)]
pub struct CacheStoreResult {
    /// Memory writes never fail.
    pub memory_cache_result: Result<(), Infallible>,
    /// Result of the disk write.
    pub disk_cache_result: Result<(), ImageError>,
}

/// Per-call cache options.
#[derive(Clone)]
pub struct CacheOptions {
    /// Identifier of the processor that produced the image.
    pub processor_identifier: String,
    /// Serializer for the disk tier.
    pub serializer: Arc<dyn CacheSerializer>,
    /// Decoding hints for disk reads.
    pub processing: ProcessingOptions,
    /// Memory expiration; storage default when `None`.
    pub memory_expiration: Option<StorageExpiration>,
    /// Memory extension policy on hits.
    pub memory_extending: ExpirationExtending,
    /// Disk expiration; storage default when `None`.
    pub disk_expiration: Option<StorageExpiration>,
    /// Disk extension policy on hits.
    pub disk_extending: ExpirationExtending,
    /// Read the disk tier on the calling task instead of the I/O queue.
    pub load_disk_file_synchronously: bool,
    /// Only look at the memory tier.
    pub from_memory_cache_or_refresh: bool,
    /// Applied to images served from either tier.
    pub image_modifier: Option<Arc<dyn ImageModifier>>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            processor_identifier: String::new(),
            serializer: Arc::new(DefaultCacheSerializer::default()),
            processing: ProcessingOptions::default(),
            memory_expiration: None,
            memory_extending: ExpirationExtending::CacheTime,
            disk_expiration: None,
            disk_extending: ExpirationExtending::CacheTime,
            load_disk_file_synchronously: false,
            from_memory_cache_or_refresh: false,
            image_modifier: None,
        }
    }
}

impl CacheOptions {
    /// Sets the processor identifier.
    #[must_use]
    pub fn with_processor_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.processor_identifier = identifier.into();
        self
    }

    fn modify(&self, image: Image) -> Image {
        match &self.image_modifier {
            Some(modifier) => modifier.modify(image),
            None => image,
        }
    }
}

impl fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("processor_identifier", &self.processor_identifier)
            .field("memory_expiration", &self.memory_expiration)
            .field("disk_expiration", &self.disk_expiration)
            .field("load_disk_file_synchronously", &self.load_disk_file_synchronously)
            .field("from_memory_cache_or_refresh", &self.from_memory_cache_or_refresh)
            .finish_non_exhaustive()
    }
}

/// Memory plus disk image cache with a unified key space.
///
/// Keys are combined with the processor identifier before reaching either
/// tier. Disk work runs in submission order on a dedicated I/O queue.
pub struct ImageCache {
    name: String,
    memory_storage: Arc<MemoryStorage<Image>>,
    disk_storage: Arc<DiskStorage<Vec<u8>>>,
    io_queue: SerialQueue,
    events: broadcast::Sender<CacheEvent>,
}

impl ImageCache {
    /// Creates a cache named `name` with default limits. The disk tier
    /// lives under `directory`, or the platform cache directory.
    ///
    /// # Errors
    /// Returns error if the disk root cannot be created.
    pub fn new(name: &str, directory: Option<PathBuf>) -> ImageResult<Self> {
        let memory = MemoryStorage::new(MemoryConfig::new(DEFAULT_MEMORY_COST_LIMIT));
        let mut disk_config = DiskConfig::new(name, 0);
        disk_config.directory = directory;
        let disk = DiskStorage::new(disk_config)?;
        Self::with_storages(name, memory, disk)
    }

    /// Creates a cache from prepared storages.
    ///
    /// # Errors
    /// Returns error if the I/O queue cannot start.
    pub fn with_storages(
        name: &str,
        memory: MemoryStorage<Image>,
        disk: DiskStorage<Vec<u8>>,
    ) -> ImageResult<Self> {
        let label = format!("imagekeep.ImageCache.ioQueue.{}", uuid::Uuid::new_v4());
        let io_queue = SerialQueue::new(label).map_err(|_| CacheErrorReason::IoQueueClosed)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        info!(name = %name, path = %disk.directory().display(), "Image cache ready");
        Ok(Self {
            name: name.to_string(),
            memory_storage: Arc::new(memory),
            disk_storage: Arc::new(disk),
            io_queue,
            events,
        })
    }

    /// Cache name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The memory tier.
    #[must_use]
    pub fn memory_storage(&self) -> &MemoryStorage<Image> {
        &self.memory_storage
    }

    /// The disk tier.
    #[must_use]
    pub fn disk_storage(&self) -> &DiskStorage<Vec<u8>> {
        &self.disk_storage
    }

    /// Subscribes to cache events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Stores an image. The memory write happens before this returns; the
    /// disk write is queued immediately and awaited through the returned
    /// future.
    pub fn store(
        &self,
        image: Image,
        original: Option<Bytes>,
        key: &str,
        options: &CacheOptions,
        to_disk: bool,
    ) -> impl Future<Output = CacheStoreResult> + Send + 'static {
        let computed = computed_key(key, &options.processor_identifier);
        self.memory_storage
            .store(image.clone(), &computed, options.memory_expiration);
        trace!(key = %computed, to_disk, "Stored image in memory");

        let disk_job = to_disk.then(|| {
            let disk = self.disk_storage.clone();
            let serializer = options.serializer.clone();
            let expiration = options.disk_expiration;
            self.io_queue.run(move || -> ImageResult<()> {
                let Some(data) = serializer.data(&image, original.as_deref()) else {
                    return Err(CacheErrorReason::CannotSerializeImage { key: computed }.into());
                };
                disk.store(&data, &computed, expiration)?;
                Ok(())
            })
        });

        async move {
            let disk_cache_result = match disk_job {
                Some(job) => job.await.unwrap_or_else(|closed| Err(closed.into())),
                None => Ok(()),
            };
            if let Err(e) = &disk_cache_result {
                warn!(error = %e, "Failed to store image on disk");
            }
            CacheStoreResult {
                memory_cache_result: Ok(()),
                disk_cache_result,
            }
        }
    }

    /// Stores already serialized data on disk only.
    pub fn store_to_disk(
        &self,
        data: Vec<u8>,
        key: &str,
        processor_identifier: &str,
        expiration: Option<StorageExpiration>,
    ) -> impl Future<Output = ImageResult<()>> + Send + 'static {
        let computed = computed_key(key, processor_identifier);
        let disk = self.disk_storage.clone();
        let job = self
            .io_queue
            .run(move || disk.store(&data, &computed, expiration));
        async move {
            match job.await {
                Ok(stored) => stored.map_err(ImageError::from),
                Err(closed) => Err(ImageError::from(closed)),
            }
        }
    }

    /// Looks the image up in memory, then on disk. Disk hits are promoted to
    /// memory.
    ///
    /// # Errors
    /// Returns error if the disk tier fails.
    pub async fn retrieve_image(
        &self,
        key: &str,
        options: &CacheOptions,
    ) -> ImageResult<ImageCacheResult> {
        let computed = computed_key(key, &options.processor_identifier);
        if let Some(image) = self
            .memory_storage
            .value(&computed, options.memory_extending)
        {
            trace!(key = %computed, "Memory cache hit");
            return Ok(ImageCacheResult::Memory(options.modify(image)));
        }
        if options.from_memory_cache_or_refresh {
            return Ok(ImageCacheResult::None);
        }

        let loaded = if options.load_disk_file_synchronously {
            load_from_disk(&self.disk_storage, &computed, options)?
        } else {
            let disk = self.disk_storage.clone();
            let job_options = options.clone();
            let job_key = computed.clone();
            self.io_queue
                .run(move || load_from_disk(&disk, &job_key, &job_options))
                .await??
        };

        match loaded {
            Some(image) => {
                trace!(key = %computed, "Disk cache hit");
                self.memory_storage
                    .store(image.clone(), &computed, options.memory_expiration);
                Ok(ImageCacheResult::Disk(options.modify(image)))
            }
            None => Ok(ImageCacheResult::None),
        }
    }

    /// Looks the image up in memory only.
    #[must_use]
    pub fn retrieve_image_in_memory_cache(&self, key: &str, options: &CacheOptions) -> Option<Image> {
        let computed = computed_key(key, &options.processor_identifier);
        self.memory_storage
            .value(&computed, options.memory_extending)
            .map(|image| options.modify(image))
    }

    /// Looks the image up on disk only, without promoting it.
    ///
    /// # Errors
    /// Returns error if the disk tier fails.
    pub async fn retrieve_image_in_disk_cache(
        &self,
        key: &str,
        options: &CacheOptions,
    ) -> ImageResult<Option<Image>> {
        let computed = computed_key(key, &options.processor_identifier);
        let disk = self.disk_storage.clone();
        let job_options = options.clone();
        let image = self
            .io_queue
            .run(move || load_from_disk(&disk, &computed, &job_options))
            .await??;
        Ok(image.map(|image| options.modify(image)))
    }

    /// Removes an image from the selected tiers. Missing entries are fine.
    ///
    /// # Errors
    /// Returns error if a disk file exists but cannot be removed.
    pub async fn remove_image(
        &self,
        key: &str,
        processor_identifier: &str,
        from_memory: bool,
        from_disk: bool,
    ) -> ImageResult<()> {
        let computed = computed_key(key, processor_identifier);
        if from_memory {
            self.memory_storage.remove(&computed);
        }
        if from_disk {
            let disk = self.disk_storage.clone();
            self.io_queue.run(move || disk.remove(&computed)).await??;
        }
        Ok(())
    }

    /// Clears both tiers.
    ///
    /// # Errors
    /// Returns error if the disk tier cannot be cleared.
    pub async fn clear_cache(&self) -> ImageResult<()> {
        self.clear_memory_cache();
        self.clear_disk_cache().await
    }

    /// Clears the memory tier.
    pub fn clear_memory_cache(&self) {
        self.memory_storage.remove_all();
        debug!(name = %self.name, "Cleared memory cache");
    }

    /// Clears the disk tier.
    ///
    /// # Errors
    /// Returns error if the disk tier cannot be cleared.
    pub async fn clear_disk_cache(&self) -> ImageResult<()> {
        let disk = self.disk_storage.clone();
        self.io_queue.run(move || disk.remove_all()).await??;
        debug!(name = %self.name, "Cleared disk cache");
        Ok(())
    }

    /// Drops expired entries from both tiers.
    ///
    /// # Errors
    /// Returns error if the disk tier cannot be swept.
    pub async fn clean_expired_cache(&self) -> ImageResult<Vec<PathBuf>> {
        self.clean_expired_memory_cache();
        self.clean_expired_disk_cache().await
    }

    /// Drops expired memory entries.
    pub fn clean_expired_memory_cache(&self) -> usize {
        self.memory_storage.remove_expired()
    }

    /// Drops expired disk files, then evicts files over the size limit.
    /// Broadcasts [`CacheEvent::DiskCacheCleaned`] when anything was removed.
    ///
    /// # Errors
    /// Returns error if the disk tier cannot be enumerated.
    pub async fn clean_expired_disk_cache(&self) -> ImageResult<Vec<PathBuf>> {
        let disk = self.disk_storage.clone();
        let removed = self
            .io_queue
            .run(move || -> ImageResult<Vec<PathBuf>> {
                let mut removed = disk.remove_expired_values()?;
                removed.extend(disk.remove_size_exceeded_values()?);
                Ok(removed)
            })
            .await??;

        if !removed.is_empty() {
            let hashes: Vec<String> = removed
                .iter()
                .filter_map(|path| path.file_name()?.to_str().map(String::from))
                .collect();
            info!(name = %self.name, count = hashes.len(), "Cleaned disk cache");
            let _ = self.events.send(CacheEvent::DiskCacheCleaned { hashes });
        }
        Ok(removed)
    }

    /// Which tier holds the image, if any.
    #[must_use]
    pub fn image_cached_type(&self, key: &str, processor_identifier: &str) -> CacheType {
        let computed = computed_key(key, processor_identifier);
        if self.memory_storage.is_cached(&computed) {
            CacheType::Memory
        } else if self.disk_storage.is_cached(&computed) {
            CacheType::Disk
        } else {
            CacheType::None
        }
    }

    /// Returns whether either tier holds the image.
    #[must_use]
    pub fn is_cached(&self, key: &str, processor_identifier: &str) -> bool {
        self.image_cached_type(key, processor_identifier).is_cached()
    }

    /// Disk file name for the image.
    #[must_use]
    pub fn hash(&self, key: &str, processor_identifier: &str) -> String {
        self.disk_storage
            .cache_file_name(&computed_key(key, processor_identifier))
    }

    /// Disk file path for the image.
    #[must_use]
    pub fn cache_path(&self, key: &str, processor_identifier: &str) -> PathBuf {
        self.disk_storage
            .cache_file_url(&computed_key(key, processor_identifier))
    }

    /// Total size of the disk tier in bytes.
    ///
    /// # Errors
    /// Returns error if the disk tier cannot be enumerated.
    pub async fn calculate_disk_storage_size(&self) -> ImageResult<u64> {
        let disk = self.disk_storage.clone();
        Ok(self.io_queue.run(move || disk.total_size()).await??)
    }

    /// Reacts to a host lifecycle signal.
    pub async fn handle_lifecycle(&self, event: LifecycleEvent) {
        debug!(name = %self.name, event = ?event, "Handling lifecycle event");
        match event {
            LifecycleEvent::MemoryWarning => self.clear_memory_cache(),
            LifecycleEvent::WillTerminate | LifecycleEvent::DidEnterBackground => {
                if let Err(e) = self.clean_expired_disk_cache().await {
                    warn!(error = %e, "Failed to clean disk cache");
                }
            }
        }
    }
}

impl fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageCache")
            .field("name", &self.name)
            .field("io_queue", &self.io_queue)
            .field("disk_storage", &self.disk_storage)
            .finish_non_exhaustive()
    }
}

fn load_from_disk(
    disk: &DiskStorage<Vec<u8>>,
    key: &str,
    options: &CacheOptions,
) -> ImageResult<Option<Image>> {
    let Some(data) = disk.value(key, options.disk_extending)? else {
        return Ok(None);
    };
    let image = options.serializer.image(&data, &options.processing);
    if image.is_none() {
        warn!(key = %key, len = data.len(), "Cached data could not be decoded");
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::mocks::png_bytes;
    use std::time::Duration;
    use tempfile::TempDir;

    fn cache(dir: &TempDir) -> ImageCache {
        ImageCache::new("test", Some(dir.path().to_path_buf())).unwrap()
    }

    fn image(width: u32) -> Image {
        Image::new(image::DynamicImage::new_rgba8(width, 2))
    }

    struct NeverSerializer;

    impl CacheSerializer for NeverSerializer {
        fn data(&self, _image: &Image, _original: Option<&[u8]>) -> Option<Vec<u8>> {
            None
        }

        fn image(&self, _data: &[u8], _options: &ProcessingOptions) -> Option<Image> {
            None
        }
    }

    #[tokio::test]
    async fn test_store_then_memory_hit() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let stored = image(3);
        let result = cache
            .store(stored.clone(), None, "k", &CacheOptions::default(), true)
            .await;
        assert!(result.disk_cache_result.is_ok());

        let found = cache.retrieve_image("k", &CacheOptions::default()).await.unwrap();
        assert_eq!(found.cache_type(), CacheType::Memory);
        assert!(found.image().is_some_and(|i| i.ptr_eq(&stored)));
    }

    #[tokio::test]
    async fn test_memory_write_is_synchronous() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let pending = cache.store(image(1), None, "k", &CacheOptions::default(), true);
        assert_eq!(cache.image_cached_type("k", ""), CacheType::Memory);
        pending.await.disk_cache_result.unwrap();
        cache.clear_memory_cache();
        assert_eq!(cache.image_cached_type("k", ""), CacheType::Disk);
    }

    #[tokio::test]
    async fn test_disk_hit_is_promoted() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        cache
            .store(image(4), None, "k", &CacheOptions::default(), true)
            .await
            .disk_cache_result
            .unwrap();
        cache.clear_memory_cache();

        let found = cache.retrieve_image("k", &CacheOptions::default()).await.unwrap();
        assert_eq!(found.cache_type(), CacheType::Disk);
        assert_eq!(found.image().map(Image::width), Some(4));
        assert_eq!(cache.image_cached_type("k", ""), CacheType::Memory);
    }

    #[tokio::test]
    async fn test_synchronous_disk_load() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        cache
            .store_to_disk(png_bytes(5, 5), "k", "", None)
            .await
            .unwrap();
        let options = CacheOptions {
            load_disk_file_synchronously: true,
            ..CacheOptions::default()
        };
        let found = cache.retrieve_image("k", &options).await.unwrap();
        assert_eq!(found.cache_type(), CacheType::Disk);
    }

    #[tokio::test]
    async fn test_memory_only_lookup_skips_disk() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        cache
            .store(image(1), None, "k", &CacheOptions::default(), true)
            .await
            .disk_cache_result
            .unwrap();
        cache.clear_memory_cache();
        let options = CacheOptions {
            from_memory_cache_or_refresh: true,
            ..CacheOptions::default()
        };
        let found = cache.retrieve_image("k", &options).await.unwrap();
        assert_eq!(found.cache_type(), CacheType::None);
    }

    #[tokio::test]
    async fn test_processor_identifiers_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let p1 = CacheOptions::default().with_processor_identifier("p1");
        let p2 = CacheOptions::default().with_processor_identifier("p2");
        cache.store(image(1), None, "k", &p1, true).await;
        cache.store(image(2), None, "k", &p2, true).await;
        cache.store(image(3), None, "k", &CacheOptions::default(), true).await;

        let width = |result: ImageCacheResult| result.image().map(Image::width);
        assert_eq!(width(cache.retrieve_image("k", &p1).await.unwrap()), Some(1));
        assert_eq!(width(cache.retrieve_image("k", &p2).await.unwrap()), Some(2));
        assert_eq!(
            width(cache.retrieve_image("k", &CacheOptions::default()).await.unwrap()),
            Some(3)
        );
        assert!(cache.memory_storage().is_cached("k"));
        assert!(cache.memory_storage().is_cached("k@p1"));
        assert_ne!(cache.hash("k", "p1"), cache.hash("k", "p2"));
    }

    #[tokio::test]
    async fn test_serializer_failure_keeps_memory_entry() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let options = CacheOptions {
            serializer: Arc::new(NeverSerializer),
            ..CacheOptions::default()
        };
        let result = cache.store(image(1), None, "k", &options, true).await;
        assert_eq!(result.disk_cache_result.map_err(|e| e.code()), Err(3008));
        assert_eq!(cache.image_cached_type("k", ""), CacheType::Memory);
    }

    #[tokio::test]
    async fn test_remove_image_twice_is_ok() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        cache.store(image(1), None, "k", &CacheOptions::default(), true).await;
        cache.remove_image("k", "", true, true).await.unwrap();
        cache.remove_image("k", "", true, true).await.unwrap();
        cache.remove_image("missing", "", true, true).await.unwrap();
        assert!(!cache.is_cached("k", ""));
    }

    #[tokio::test]
    async fn test_clean_expired_disk_cache_broadcasts_hashes() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let mut events = cache.subscribe();
        let past = std::time::SystemTime::now() - Duration::from_secs(3600);
        cache
            .disk_storage()
            .store_at(&vec![1, 2, 3], "old", Some(StorageExpiration::Seconds(1)), past)
            .unwrap();
        cache
            .store_to_disk(vec![4], "fresh", "", None)
            .await
            .unwrap();

        let removed = cache.clean_expired_disk_cache().await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(
            events.recv().await.unwrap(),
            CacheEvent::DiskCacheCleaned {
                hashes: vec![cache.hash("old", "")]
            }
        );
        assert_eq!(cache.calculate_disk_storage_size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_lifecycle_memory_warning_clears_memory() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        cache.store(image(1), None, "k", &CacheOptions::default(), false).await;
        cache.handle_lifecycle(LifecycleEvent::MemoryWarning).await;
        assert_eq!(cache.image_cached_type("k", ""), CacheType::None);
    }

    #[tokio::test]
    async fn test_modifier_applies_to_hits_but_not_storage() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let modifier: Arc<dyn ImageModifier> =
            Arc::new(|image: Image| Image::new(image.as_dynamic().grayscale()));
        let options = CacheOptions {
            image_modifier: Some(modifier),
            ..CacheOptions::default()
        };
        let stored = image(2);
        cache.store(stored.clone(), None, "k", &options, false).await;
        let found = cache.retrieve_image("k", &options).await.unwrap();
        assert!(found.image().is_some_and(|i| !i.ptr_eq(&stored)));
        let plain = cache.retrieve_image_in_memory_cache("k", &CacheOptions::default());
        assert!(plain.is_some_and(|i| i.ptr_eq(&stored)));
    }
}
