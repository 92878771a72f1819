//! Application configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use super::args::CliArgs;
use crate::application::RetrieveOptions;
use crate::domain::entities::StorageExpiration;
use crate::domain::errors::ImageResult;
use crate::domain::ports::{DelayRetryStrategy, RetryInterval};
use crate::infrastructure::cache::{
    DEFAULT_MEMORY_COST_LIMIT, DiskConfig, DiskStorage, ImageCache, MemoryConfig, MemoryStorage,
};

pub(crate) const APP_NAME: &str = "imagekeep";
pub(crate) const APP_QUALIFIER: &str = "com";
pub(crate) const APP_ORGANIZATION: &str = "imagekeep";

/// Log level configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level.
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    #[default]
    Info,
    /// Warning level.
    Warn,
    /// Error level.
    Error,
}

impl LogLevel {
    /// Converts to tracing level.
    #[must_use]
    pub const fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trace => write!(f, "trace"),
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Application configuration.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Configuration file path.
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Log file path.
    #[serde(skip)]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Cache tiers.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Network downloads.
    #[serde(default)]
    pub download: DownloadConfig,

    /// Retrieval defaults.
    #[serde(default)]
    pub retrieve: RetrieveConfig,
}

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache name, part of the on-disk directory name.
    #[serde(default = "default_cache_name")]
    pub name: String,

    /// Base directory for the disk tier. Platform cache dir when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Memory tier cost limit in bytes.
    #[serde(default = "default_memory_cost_limit")]
    pub memory_cost_limit: usize,

    /// Memory tier entry limit. Zero means unlimited.
    #[serde(default)]
    pub memory_count_limit: usize,

    /// Memory entry lifetime in seconds.
    #[serde(default = "default_memory_expiration_secs")]
    pub memory_expiration_secs: u64,

    /// Interval of the memory expiry sweep in seconds.
    #[serde(default = "default_clean_interval_secs")]
    pub clean_interval_secs: u64,

    /// Disk tier size limit in bytes. Zero means unlimited.
    #[serde(default)]
    pub disk_size_limit: u64,

    /// Disk entry lifetime in days.
    #[serde(default = "default_disk_expiration_days")]
    pub disk_expiration_days: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: default_cache_name(),
            directory: None,
            memory_cost_limit: default_memory_cost_limit(),
            memory_count_limit: 0,
            memory_expiration_secs: default_memory_expiration_secs(),
            clean_interval_secs: default_clean_interval_secs(),
            disk_size_limit: 0,
            disk_expiration_days: default_disk_expiration_days(),
        }
    }
}

impl CacheConfig {
    /// Memory storage configuration.
    #[must_use]
    pub const fn memory_config(&self) -> MemoryConfig {
        MemoryConfig {
            total_cost_limit: self.memory_cost_limit,
            count_limit: if self.memory_count_limit == 0 {
                usize::MAX
            } else {
                self.memory_count_limit
            },
            expiration: StorageExpiration::Seconds(self.memory_expiration_secs),
            clean_interval: Duration::from_secs(self.clean_interval_secs),
        }
    }

    /// Disk storage configuration.
    #[must_use]
    pub fn disk_config(&self) -> DiskConfig {
        let mut config = DiskConfig::new(self.name.clone(), self.disk_size_limit);
        config.expiration = StorageExpiration::Days(self.disk_expiration_days);
        config.directory.clone_from(&self.directory);
        config
    }

    /// Builds the image cache.
    ///
    /// # Errors
    /// Returns error if the disk root cannot be created.
    pub fn build(&self) -> ImageResult<ImageCache> {
        let memory = MemoryStorage::new(self.memory_config());
        let disk = DiskStorage::new(self.disk_config())?;
        ImageCache::with_storages(&self.name, memory, disk)
    }
}

/// Download configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl DownloadConfig {
    /// Per-request timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Retrieval defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveConfig {
    /// Resolve only after cache writes finish.
    #[serde(default = "default_true")]
    pub wait_for_cache: bool,

    /// Keep unprocessed bytes next to processed renditions.
    #[serde(default)]
    pub cache_original_image: bool,

    /// Retries per source. Zero disables retrying.
    #[serde(default)]
    pub max_retry_count: u32,

    /// Seconds between retries.
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
}

impl Default for RetrieveConfig {
    fn default() -> Self {
        Self {
            wait_for_cache: true,
            cache_original_image: false,
            max_retry_count: 0,
            retry_interval_secs: default_retry_interval_secs(),
        }
    }
}

impl RetrieveConfig {
    /// Retrieval options seeded from this section.
    #[must_use]
    pub fn options(&self) -> RetrieveOptions {
        let mut options = RetrieveOptions {
            wait_for_cache: self.wait_for_cache,
            cache_original_image: self.cache_original_image,
            ..RetrieveOptions::default()
        };
        if self.max_retry_count > 0 {
            options.retry_strategy = Some(Arc::new(DelayRetryStrategy::new(
                self.max_retry_count,
                RetryInterval::Fixed(Duration::from_secs(self.retry_interval_secs)),
            )));
        }
        options
    }
}

fn default_cache_name() -> String {
    "default".to_string()
}

const fn default_memory_cost_limit() -> usize {
    DEFAULT_MEMORY_COST_LIMIT
}

const fn default_memory_expiration_secs() -> u64 {
    300
}

const fn default_clean_interval_secs() -> u64 {
    120
}

const fn default_disk_expiration_days() -> u64 {
    7
}

const fn default_timeout_secs() -> u64 {
    15
}

const fn default_retry_interval_secs() -> u64 {
    3
}

const fn default_true() -> bool {
    true
}

impl AppConfig {
    /// Merges CLI arguments into the configuration.
    pub fn merge_with_args(&mut self, args: &CliArgs) {
        if let Some(config_path) = &args.config {
            self.config = Some(config_path.clone());
        }
        if let Some(log_path) = &args.log_path {
            self.log_path = Some(log_path.clone());
        }
        if let Some(log_level) = args.log_level {
            self.log_level = log_level;
        }
        if let Some(cache_dir) = &args.cache_dir {
            self.cache.directory = Some(cache_dir.clone());
        }
        if let Some(cache_name) = &args.cache_name {
            self.cache.name.clone_from(cache_name);
        }
        if let Some(timeout) = args.timeout {
            self.download.timeout_secs = timeout;
        }
        if let Some(retries) = args.retries {
            self.retrieve.max_retry_count = retries;
        }
    }

    /// Returns default config directory.
    #[must_use]
    pub fn default_config_dir() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Returns default config file path.
    #[must_use]
    pub fn default_config_path() -> Option<PathBuf> {
        Self::default_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Returns default log file path.
    #[must_use]
    pub fn default_log_path() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.data_dir().join("imagekeep.log"))
    }

    /// Returns effective config path.
    #[must_use]
    pub fn effective_config_path(&self) -> Option<PathBuf> {
        self.config.clone().or_else(Self::default_config_path)
    }

    /// Returns effective log path.
    #[must_use]
    pub fn effective_log_path(&self) -> Option<PathBuf> {
        self.log_path.clone().or_else(Self::default_log_path)
    }
}
