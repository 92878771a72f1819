//! Infrastructure layer: cache storages, network adapters and configuration.

/// Memory and disk caching.
pub mod cache;
/// Application configuration.
pub mod config;
/// Downloading over HTTP.
pub mod network;

pub use cache::{CacheOptions, DiskConfig, DiskStorage, ImageCache, MemoryConfig, MemoryStorage};
pub use config::{AppConfig, CliArgs, Command, ConfigStore, LogLevel};
pub use network::{DownloadOptions, ImageDownloader, ReqwestTransport};
