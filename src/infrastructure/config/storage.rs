use super::app_config::AppConfig;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

const CONFIG_FILE_NAME: &str = "config.toml";

/// Config file failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No home directory to derive the config path from.
    #[error("no platform config directory for imagekeep")]
    ConfigDirNotFound,
    /// Reading or writing the file failed.
    #[error("config file io: {0}")]
    Io(#[from] std::io::Error),
    /// Encoding failed.
    #[error("cannot encode config: {0}")]
    TomlSer(#[from] toml::ser::Error),
    /// Decoding failed.
    #[error("cannot decode config: {0}")]
    TomlDe(#[from] toml::de::Error),
}

/// Location of `config.toml` and the code that reads and writes it.
#[derive(Debug)]
pub struct ConfigStore {
    config_dir: PathBuf,
}

impl ConfigStore {
    /// Store rooted at the platform config directory.
    ///
    /// # Errors
    /// Returns [`ConfigError::ConfigDirNotFound`] without a home directory.
    pub fn new() -> Result<Self, ConfigError> {
        AppConfig::default_config_dir()
            .map(Self::with_dir)
            .ok_or(ConfigError::ConfigDirNotFound)
    }

    /// Store rooted at `config_dir`.
    #[must_use]
    pub fn with_dir(config_dir: PathBuf) -> Self {
        Self { config_dir }
    }

    /// Directory holding `config.toml`.
    #[must_use]
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    fn config_path(&self, path_override: Option<&Path>) -> PathBuf {
        path_override.map_or_else(|| self.config_dir.join(CONFIG_FILE_NAME), Path::to_path_buf)
    }

    /// Reads the config file. A missing file is written out with defaults;
    /// an unparsable one is left alone and defaults are used.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or the default cannot be
    /// written.
    pub fn load_config(&self, path_override: Option<&Path>) -> Result<AppConfig, ConfigError> {
        let path = self.config_path(path_override);
        if !path.exists() {
            info!(path = %path.display(), "Writing default config");
            let config = AppConfig::default();
            write_atomically(&path, &config)?;
            return Ok(config);
        }

        let content = fs::read_to_string(&path)?;
        Ok(toml::from_str(&content).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "Unparsable config, using defaults");
            AppConfig::default()
        }))
    }

    /// Writes `config` to `config.toml` in the store directory.
    ///
    /// # Errors
    /// Returns error if encoding or writing fails.
    pub fn save_config(&self, config: &AppConfig) -> Result<(), ConfigError> {
        write_atomically(&self.config_path(None), config)
    }
}

fn write_atomically(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;
    let dir = path
        .parent()
        .ok_or_else(|| std::io::Error::other("config path has no parent"))?;
    fs::create_dir_all(dir)?;

    let mut staged = tempfile::NamedTempFile::new_in(dir)?;
    staged.write_all(content.as_bytes())?;
    staged.persist(path).map_err(|e| e.error)?;
    debug!(path = %path.display(), "Saved config");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_created_with_defaults() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::with_dir(dir.path().join("imagekeep"));

        let config = store.load_config(None).unwrap();
        assert_eq!(config.cache.name, "default");
        assert!(store.config_dir().join(CONFIG_FILE_NAME).exists());
    }

    #[test]
    fn test_unparsable_file_is_kept() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::with_dir(dir.path().to_path_buf());
        let config_file = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&config_file, "cache = [").unwrap();

        let config = store.load_config(None).unwrap();
        assert_eq!(config.download.timeout_secs, 15);
        assert_eq!(fs::read_to_string(&config_file).unwrap(), "cache = [");
    }

    #[test]
    fn test_override_path() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::with_dir(dir.path().join("unused"));
        let custom = dir.path().join("nested").join("custom.toml");

        store.load_config(Some(&custom)).unwrap();
        assert!(custom.exists());
        assert!(!store.config_dir().exists());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::with_dir(dir.path().to_path_buf());

        let mut config = AppConfig::default();
        config.cache.disk_size_limit = 4096;
        store.save_config(&config).unwrap();

        let loaded = store.load_config(None).unwrap();
        assert_eq!(loaded.cache.disk_size_limit, 4096);
    }
}
