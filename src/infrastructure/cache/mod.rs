//! Two-tier image cache: memory storage, disk storage and the facade that
//! coordinates them.

mod disk_storage;
mod image_cache;
mod memory_storage;
mod serial_queue;

pub use disk_storage::{
    CACHE_DIRECTORY_PREFIX, DEFAULT_DISK_EXPIRATION, DataTransformable, DiskConfig, DiskStorage,
    ProbeFallback, default_cache_directory,
};
pub use image_cache::{
    CacheEvent, CacheOptions, CacheStoreResult, DEFAULT_MEMORY_COST_LIMIT, ImageCache,
    LifecycleEvent,
};
pub use memory_storage::{DEFAULT_CLEAN_INTERVAL, DEFAULT_MEMORY_EXPIRATION, MemoryConfig, MemoryStorage};
pub use serial_queue::{QueueClosed, SerialQueue};
