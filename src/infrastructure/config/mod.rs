//! Application configuration.

pub mod app_config;
pub mod args;
pub mod storage;

pub use app_config::{AppConfig, CacheConfig, DownloadConfig, LogLevel, RetrieveConfig};
pub use args::{CliArgs, Command, FetchArgs, InfoArgs};
pub use storage::{ConfigError, ConfigStore};
