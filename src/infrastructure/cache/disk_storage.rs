//! File-backed storage with expiration and size-limited eviction.
//!
//! Each value lives in its own file under the storage root. File metadata
//! doubles as the record: the access time holds the last access instant and
//! the modification time holds the estimated expiry.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use filetime::FileTime;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use super::serial_queue::SerialQueue;
use crate::domain::entities::{ExpirationExtending, StorageExpiration, is_past};
use crate::domain::errors::CacheErrorReason;

/// Result type for disk storage operations.
pub type DiskResult<T> = std::result::Result<T, CacheErrorReason>;

/// Default expiration of disk entries.
pub const DEFAULT_DISK_EXPIRATION: StorageExpiration = StorageExpiration::Days(7);

/// Prefix of every storage root directory name.
pub const CACHE_DIRECTORY_PREFIX: &str = "imagekeep.ImageCache.";

/// Values that can be written to and read from disk.
pub trait DataTransformable: Sized + Send + Sync + 'static {
    /// Serializes the value.
    ///
    /// # Errors
    /// Returns a description of why the value cannot be serialized.
    fn to_data(&self) -> Result<Vec<u8>, String>;

    /// Deserializes a value.
    ///
    /// # Errors
    /// Returns a description of why the data is not a valid value.
    fn from_data(data: Vec<u8>) -> Result<Self, String>;
}

impl DataTransformable for Vec<u8> {
    fn to_data(&self) -> Result<Vec<u8>, String> {
        Ok(self.clone())
    }

    fn from_data(data: Vec<u8>) -> Result<Self, String> {
        Ok(data)
    }
}

impl DataTransformable for Bytes {
    fn to_data(&self) -> Result<Vec<u8>, String> {
        Ok(self.to_vec())
    }

    fn from_data(data: Vec<u8>) -> Result<Self, String> {
        Ok(Self::from(data))
    }
}

/// What a lookup does while the existence probe is unavailable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProbeFallback {
    /// Check that the file exists before touching it.
    #[default]
    StatFile,
    /// Go straight to reading metadata and treat a missing file as a miss.
    SkipStat,
}

/// Maps the base directory and cache name to the storage root.
pub type CachePathFn = Arc<dyn Fn(&Path, &str) -> PathBuf + Send + Sync>;

/// Disk storage configuration.
#[derive(Clone)]
pub struct DiskConfig {
    /// Name of the storage, part of the root directory name.
    pub name: String,
    /// Maximum total size in bytes. Zero means unlimited.
    pub size_limit: u64,
    /// Expiration used when a store passes none.
    pub expiration: StorageExpiration,
    /// Extension appended to file names.
    pub path_extension: Option<String>,
    /// Hash keys into file names instead of using them verbatim.
    pub uses_hashed_file_name: bool,
    /// Base directory. Defaults to the platform cache directory.
    pub directory: Option<PathBuf>,
    /// Overrides how the root is derived from the base directory.
    pub cache_path: Option<CachePathFn>,
    /// Lookup behavior while the probe is unavailable.
    pub probe_fallback: ProbeFallback,
}

impl DiskConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new(name: impl Into<String>, size_limit: u64) -> Self {
        Self {
            name: name.into(),
            size_limit,
            expiration: DEFAULT_DISK_EXPIRATION,
            path_extension: None,
            uses_hashed_file_name: true,
            directory: None,
            cache_path: None,
            probe_fallback: ProbeFallback::default(),
        }
    }

    /// Sets the base directory.
    #[must_use]
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    fn root(&self) -> PathBuf {
        let base = self.directory.clone().unwrap_or_else(default_cache_directory);
        let cache_name = format!("{CACHE_DIRECTORY_PREFIX}{}", self.name);
        match &self.cache_path {
            Some(cache_path) => cache_path(&base, &cache_name),
            None => base.join(cache_name),
        }
    }
}

impl fmt::Debug for DiskConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskConfig")
            .field("name", &self.name)
            .field("size_limit", &self.size_limit)
            .field("expiration", &self.expiration)
            .field("path_extension", &self.path_extension)
            .field("uses_hashed_file_name", &self.uses_hashed_file_name)
            .field("directory", &self.directory)
            .field("probe_fallback", &self.probe_fallback)
            .finish_non_exhaustive()
    }
}

/// Returns the platform cache directory for this crate.
#[must_use]
pub fn default_cache_directory() -> PathBuf {
    directories::ProjectDirs::from("com", "imagekeep", "imagekeep").map_or_else(
        || std::env::temp_dir().join("imagekeep").join("cache"),
        |dirs| dirs.cache_dir().to_path_buf(),
    )
}

/// Hex SHA-256 prefix used as the hashed file name.
#[must_use]
pub fn hashed_name(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..16])
}

enum Probe {
    Loading(HashSet<String>),
    Ready(HashSet<String>),
    Disabled,
}

/// Persistent key-value storage with one file per key.
pub struct DiskStorage<T> {
    config: DiskConfig,
    directory: PathBuf,
    probe: Arc<RwLock<Probe>>,
    meta_queue: SerialQueue,
    _value: PhantomData<fn() -> T>,
}

impl<T: DataTransformable> DiskStorage<T> {
    /// Creates the root directory and starts listing existing files.
    ///
    /// # Errors
    /// Returns error if the root cannot be created or the metadata queue
    /// cannot start.
    pub fn new(config: DiskConfig) -> DiskResult<Self> {
        let directory = config.root();
        fs::create_dir_all(&directory)
            .map_err(|e| CacheErrorReason::cannot_create_directory(directory.clone(), e))?;
        let meta_queue = SerialQueue::new(format!(
            "imagekeep.DiskStorage.{}.metaQueue",
            config.name
        ))
        .map_err(|_| CacheErrorReason::IoQueueClosed)?;

        let probe = Arc::new(RwLock::new(Probe::Loading(HashSet::new())));
        let listing_probe = probe.clone();
        let listing_dir = directory.clone();
        meta_queue.dispatch(move || {
            let listed = list_file_names(&listing_dir);
            let mut probe = listing_probe.write();
            let added = match &mut *probe {
                Probe::Loading(added) | Probe::Ready(added) => std::mem::take(added),
                Probe::Disabled => HashSet::new(),
            };
            *probe = match listed {
                Ok(mut names) => {
                    names.extend(added);
                    trace!(count = names.len(), "Disk probe ready");
                    Probe::Ready(names)
                }
                Err(e) => {
                    warn!(path = %listing_dir.display(), error = %e, "Disk probe disabled");
                    Probe::Disabled
                }
            };
        });

        debug!(path = %directory.display(), "Opened disk storage");
        Ok(Self {
            config,
            directory,
            probe,
            meta_queue,
            _value: PhantomData,
        })
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &DiskConfig {
        &self.config
    }

    /// Root directory of the storage.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// File name used for `key`.
    #[must_use]
    pub fn cache_file_name(&self, key: &str) -> String {
        let name = if self.config.uses_hashed_file_name {
            hashed_name(key)
        } else {
            key.to_string()
        };
        match &self.config.path_extension {
            Some(ext) if !ext.is_empty() => format!("{name}.{ext}"),
            _ => name,
        }
    }

    /// Full path of the file for `key`.
    #[must_use]
    pub fn cache_file_url(&self, key: &str) -> PathBuf {
        self.directory.join(self.cache_file_name(key))
    }

    /// Stores `value` under `key`.
    ///
    /// # Errors
    /// Returns the failing stage: directory creation, serialization, write or
    /// attribute update.
    pub fn store(
        &self,
        value: &T,
        key: &str,
        expiration: Option<StorageExpiration>,
    ) -> DiskResult<()> {
        self.store_at(value, key, expiration, SystemTime::now())
    }

    /// Stores `value` with `now` as the reference instant.
    ///
    /// # Errors
    /// See [`DiskStorage::store`].
    pub fn store_at(
        &self,
        value: &T,
        key: &str,
        expiration: Option<StorageExpiration>,
        now: SystemTime,
    ) -> DiskResult<()> {
        let expiration = expiration.unwrap_or(self.config.expiration);
        if expiration.is_expired_at(now) {
            trace!(key = %key, "Skipping disk store with expired expiration");
            return Ok(());
        }

        let data = value
            .to_data()
            .map_err(|message| CacheErrorReason::CannotConvertToData {
                key: key.to_string(),
                message,
            })?;

        if !self.directory.is_dir() {
            fs::create_dir_all(&self.directory).map_err(|e| {
                CacheErrorReason::cannot_create_directory(self.directory.clone(), e)
            })?;
        }

        let path = self.cache_file_url(key);
        if let Err(e) = fs::write(&path, &data) {
            let _ = fs::remove_file(&path);
            return Err(CacheErrorReason::CannotCreateCacheFile {
                path,
                key: key.to_string(),
                error: Arc::new(e),
            });
        }

        let expiry = expiration.estimated_expiration_since(now);
        if let Err(e) = set_times(&path, now, expiry) {
            let _ = fs::remove_file(&path);
            return Err(CacheErrorReason::CannotSetCacheFileAttribute {
                path,
                error: Arc::new(e),
            });
        }

        self.probe_insert(self.cache_file_name(key));
        trace!(key = %key, path = %path.display(), size = data.len(), "Stored value on disk");
        Ok(())
    }

    /// Loads the live value for `key`, extending its expiration.
    ///
    /// # Errors
    /// Returns error if metadata or data cannot be read.
    pub fn value(&self, key: &str, extending: ExpirationExtending) -> DiskResult<Option<T>> {
        self.value_at(key, SystemTime::now(), extending)
    }

    /// Loads the live value for `key` relative to `now`.
    ///
    /// # Errors
    /// See [`DiskStorage::value`].
    pub fn value_at(
        &self,
        key: &str,
        now: SystemTime,
        extending: ExpirationExtending,
    ) -> DiskResult<Option<T>> {
        let Some(meta) = self.live_meta(key, now)? else {
            return Ok(None);
        };
        let path = self.cache_file_url(key);
        let data = fs::read(&path).map_err(|e| CacheErrorReason::cannot_load(path.clone(), e))?;
        let value = T::from_data(data).map_err(|message| CacheErrorReason::CannotConvertToData {
            key: key.to_string(),
            message,
        })?;

        if extending == ExpirationExtending::None {
            if let Err(e) = meta.restore_last_access(&path) {
                warn!(path = %path.display(), error = %e, "Failed to restore last access time");
            }
        } else {
            self.meta_queue.dispatch(move || {
                if let Err(e) = meta.extend_expiration(&path, extending, SystemTime::now()) {
                    warn!(path = %path.display(), error = %e, "Failed to extend disk expiration");
                }
            });
        }
        Ok(Some(value))
    }

    /// Returns whether a live value exists for `key`.
    #[must_use]
    pub fn is_cached(&self, key: &str) -> bool {
        self.is_cached_at(key, SystemTime::now())
    }

    /// Returns whether a live value exists for `key` relative to `now`.
    #[must_use]
    pub fn is_cached_at(&self, key: &str, now: SystemTime) -> bool {
        matches!(self.live_meta(key, now), Ok(Some(_)))
    }

    /// Removes the value for `key`. A missing file is not an error.
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be removed.
    pub fn remove(&self, key: &str) -> DiskResult<()> {
        let path = self.cache_file_url(key);
        remove_file(&path)?;
        self.probe_remove(&self.cache_file_name(key));
        Ok(())
    }

    /// Removes every value and recreates the root directory.
    ///
    /// # Errors
    /// Returns error if the directory cannot be removed or recreated.
    pub fn remove_all(&self) -> DiskResult<()> {
        match fs::remove_dir_all(&self.directory) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(CacheErrorReason::cannot_remove(self.directory.clone(), e)),
        }
        fs::create_dir_all(&self.directory)
            .map_err(|e| CacheErrorReason::cannot_create_directory(self.directory.clone(), e))?;
        let mut probe = self.probe.write();
        if !matches!(*probe, Probe::Disabled) {
            *probe = Probe::Ready(HashSet::new());
        }
        debug!(path = %self.directory.display(), "Removed all disk values");
        Ok(())
    }

    /// Deletes every file expired relative to now.
    ///
    /// # Errors
    /// Returns error if the root cannot be enumerated.
    pub fn remove_expired_values(&self) -> DiskResult<Vec<PathBuf>> {
        self.remove_expired_values_at(SystemTime::now())
    }

    /// Deletes every file expired relative to `now`. Files whose metadata
    /// cannot be read are treated as expired.
    ///
    /// # Errors
    /// Returns error if the root cannot be enumerated.
    pub fn remove_expired_values_at(&self, now: SystemTime) -> DiskResult<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for path in self.all_file_urls()? {
            if !is_file_expired(&path, now) {
                continue;
            }
            match remove_file(&path) {
                Ok(()) => {
                    self.probe_remove_path(&path);
                    removed.push(path);
                }
                Err(e) => warn!(error = %e, "Failed to remove expired file"),
            }
        }
        if !removed.is_empty() {
            debug!(count = removed.len(), "Removed expired disk values");
        }
        Ok(removed)
    }

    /// Evicts least recently accessed files until the total size is at most
    /// half the size limit. No-op when unlimited or under the limit.
    ///
    /// # Errors
    /// Returns error if the root cannot be enumerated.
    pub fn remove_size_exceeded_values(&self) -> DiskResult<Vec<PathBuf>> {
        let limit = self.config.size_limit;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut size = self.total_size()?;
        if size < limit {
            return Ok(Vec::new());
        }

        let mut pending: Vec<(PathBuf, SystemTime, u64)> = self
            .all_file_urls()?
            .into_iter()
            .filter_map(|path| {
                let meta = fs::metadata(&path).ok()?;
                let accessed = meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH);
                Some((path, accessed, meta.len()))
            })
            .collect();
        pending.sort_by(|a, b| b.1.cmp(&a.1));

        let target = limit / 2;
        let mut removed = Vec::new();
        while size > target {
            let Some((path, _, len)) = pending.pop() else {
                break;
            };
            match remove_file(&path) {
                Ok(()) => {
                    size = size.saturating_sub(len);
                    self.probe_remove_path(&path);
                    removed.push(path);
                }
                Err(e) => warn!(error = %e, "Failed to remove file over size limit"),
            }
        }
        debug!(count = removed.len(), size, limit, "Removed disk values over size limit");
        Ok(removed)
    }

    /// Sum of all file sizes. Unreadable files count as zero.
    ///
    /// # Errors
    /// Returns error if the root cannot be enumerated.
    pub fn total_size(&self) -> DiskResult<u64> {
        Ok(self
            .all_file_urls()?
            .iter()
            .map(|path| file_size(path.as_path()))
            .sum())
    }

    fn all_file_urls(&self) -> DiskResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        let walker = WalkDir::new(&self.directory)
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| !is_hidden(entry.file_name()));
        for entry in walker {
            match entry {
                Ok(entry) if entry.file_type().is_file() => files.push(entry.into_path()),
                Ok(_) => {}
                Err(e) if e.depth() == 0 => {
                    trace!(error = %e, "Cannot enumerate disk storage");
                    return Err(CacheErrorReason::FileEnumeratorCreationFailed {
                        path: self.directory.clone(),
                    });
                }
                Err(e) => warn!(error = %e, "Skipping unreadable disk storage entry"),
            }
        }
        Ok(files)
    }

    /// Metadata of the file for `key` if it exists and has not expired.
    fn live_meta(&self, key: &str, now: SystemTime) -> DiskResult<Option<FileMeta>> {
        let name = self.cache_file_name(key);
        let path = self.directory.join(&name);
        match self.maybe_cached(&name) {
            Some(false) => return Ok(None),
            Some(true) => {}
            None => {
                if self.config.probe_fallback == ProbeFallback::StatFile && !path.exists() {
                    return Ok(None);
                }
            }
        }

        let meta = match FileMeta::read(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CacheErrorReason::InvalidUrlResource {
                    path,
                    error: Arc::new(e),
                });
            }
        };
        if is_past(meta.estimated_expiration, now) {
            return Ok(None);
        }
        Ok(Some(meta))
    }

    fn maybe_cached(&self, name: &str) -> Option<bool> {
        match &*self.probe.read() {
            Probe::Ready(names) => Some(names.contains(name)),
            Probe::Loading(_) | Probe::Disabled => None,
        }
    }

    fn probe_insert(&self, name: String) {
        match &mut *self.probe.write() {
            Probe::Ready(names) | Probe::Loading(names) => {
                names.insert(name);
            }
            Probe::Disabled => {}
        }
    }

    fn probe_remove(&self, name: &str) {
        match &mut *self.probe.write() {
            Probe::Ready(names) | Probe::Loading(names) => {
                names.remove(name);
            }
            Probe::Disabled => {}
        }
    }

    fn probe_remove_path(&self, path: &Path) {
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            self.probe_remove(name);
        }
    }
}

impl<T> fmt::Debug for DiskStorage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskStorage")
            .field("directory", &self.directory)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
struct FileMeta {
    last_access: SystemTime,
    estimated_expiration: SystemTime,
}

impl FileMeta {
    fn read(path: &Path) -> io::Result<Self> {
        let meta = fs::metadata(path)?;
        Ok(Self {
            last_access: meta.accessed()?,
            estimated_expiration: meta.modified()?,
        })
    }

    /// Puts back the access time a read may have bumped. Skipped when an
    /// extension rewrote the record in the meantime.
    fn restore_last_access(&self, path: &Path) -> io::Result<()> {
        let current = fs::metadata(path)?;
        if current.modified()? != self.estimated_expiration
            || current.accessed()? == self.last_access
        {
            return Ok(());
        }
        filetime::set_file_atime(path, FileTime::from_system_time(self.last_access))
    }

    fn extend_expiration(
        &self,
        path: &Path,
        extending: ExpirationExtending,
        now: SystemTime,
    ) -> io::Result<()> {
        let expiry = match extending {
            ExpirationExtending::None => return Ok(()),
            ExpirationExtending::CacheTime => {
                let window = self
                    .estimated_expiration
                    .duration_since(self.last_access)
                    .unwrap_or_default();
                StorageExpiration::Seconds(window.as_secs()).estimated_expiration_since(now)
            }
            ExpirationExtending::ExpirationTime(expiration) => {
                expiration.estimated_expiration_since(now)
            }
        };
        set_times(path, now, expiry)
    }
}

fn set_times(path: &Path, last_access: SystemTime, expiry: SystemTime) -> io::Result<()> {
    filetime::set_file_times(
        path,
        FileTime::from_system_time(last_access),
        FileTime::from_system_time(expiry),
    )
}

/// Unreadable metadata counts as expired.
fn is_file_expired(path: &Path, now: SystemTime) -> bool {
    match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(expiry) => is_past(expiry, now),
        Err(e) => {
            trace!(path = %path.display(), error = %e, "Unreadable metadata, treating as expired");
            true
        }
    }
}

fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map_or(0, |m| m.len())
}

fn remove_file(path: &Path) -> DiskResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CacheErrorReason::cannot_remove(path.to_path_buf(), e)),
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|n| n.starts_with('.'))
}

fn list_file_names(directory: &Path) -> io::Result<HashSet<String>> {
    let mut names = HashSet::new();
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            names.insert(name.to_string());
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn storage(dir: &TempDir, size_limit: u64) -> DiskStorage<Vec<u8>> {
        DiskStorage::new(DiskConfig::new("test", size_limit).with_directory(dir.path())).unwrap()
    }

    fn wait_for_probe(storage: &DiskStorage<Vec<u8>>) {
        storage.meta_queue.drain().unwrap();
    }

    #[test]
    fn test_root_directory_layout() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, 0);
        assert_eq!(
            storage.directory(),
            dir.path().join("imagekeep.ImageCache.test")
        );
        assert!(storage.directory().is_dir());
    }

    #[test]
    fn test_custom_cache_path() {
        let dir = TempDir::new().unwrap();
        let mut config = DiskConfig::new("custom", 0).with_directory(dir.path());
        config.cache_path = Some(Arc::new(|base, name| base.join("nested").join(name)));
        let storage: DiskStorage<Vec<u8>> = DiskStorage::new(config).unwrap();
        assert_eq!(
            storage.directory(),
            dir.path().join("nested").join("imagekeep.ImageCache.custom")
        );
    }

    #[test]
    fn test_file_naming() {
        let dir = TempDir::new().unwrap();
        let hashed = storage(&dir, 0);
        assert_eq!(hashed.cache_file_name("abc"), hashed_name("abc"));
        assert_eq!(hashed.cache_file_name("abc").len(), 32);

        let mut config = DiskConfig::new("raw", 0).with_directory(dir.path());
        config.uses_hashed_file_name = false;
        config.path_extension = Some("png".to_string());
        let raw: DiskStorage<Vec<u8>> = DiskStorage::new(config).unwrap();
        assert_eq!(raw.cache_file_name("abc"), "abc.png");
    }

    #[test]
    fn test_store_and_expire_with_reference_time() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, 0);
        let now = SystemTime::now();
        storage
            .store_at(&b"data".to_vec(), "k", Some(StorageExpiration::Seconds(60)), now)
            .unwrap();

        let value = storage
            .value_at("k", now + Duration::from_secs(1), ExpirationExtending::None)
            .unwrap();
        assert_eq!(value, Some(b"data".to_vec()));

        let later = now + Duration::from_secs(61);
        assert_eq!(
            storage
                .value_at("k", later, ExpirationExtending::None)
                .unwrap(),
            None
        );
        assert!(!storage.is_cached_at("k", later));
        assert!(storage.cache_file_url("k").exists());
    }

    #[test]
    fn test_file_times_record_access_and_expiry() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, 0);
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(2_000_000_000);
        storage
            .store_at(&vec![1], "k", Some(StorageExpiration::Seconds(100)), now)
            .unwrap();
        let meta = fs::metadata(storage.cache_file_url("k")).unwrap();
        assert_eq!(meta.accessed().unwrap(), now);
        assert_eq!(meta.modified().unwrap(), now + Duration::from_secs(100));
    }

    #[test]
    fn test_already_expired_store_is_noop() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, 0);
        storage
            .store(&vec![1, 2], "k", Some(StorageExpiration::Expired))
            .unwrap();
        assert!(!storage.cache_file_url("k").exists());
        assert_eq!(storage.value("k", ExpirationExtending::None).unwrap(), None);
    }

    #[test]
    fn test_probe_and_fallback_agree() {
        let dir = TempDir::new().unwrap();
        for fallback in [ProbeFallback::StatFile, ProbeFallback::SkipStat] {
            let mut config = DiskConfig::new(format!("{fallback:?}"), 0).with_directory(dir.path());
            config.probe_fallback = fallback;
            let storage: DiskStorage<Vec<u8>> = DiskStorage::new(config).unwrap();
            storage.store(&vec![9], "present", None).unwrap();
            wait_for_probe(&storage);
            assert!(storage.is_cached("present"));
            assert!(!storage.is_cached("absent"));
            *storage.probe.write() = Probe::Disabled;
            assert!(storage.is_cached("present"));
            assert!(!storage.is_cached("absent"));
        }
    }

    #[test]
    fn test_probe_sees_files_from_previous_run() {
        let dir = TempDir::new().unwrap();
        storage(&dir, 0).store(&vec![1], "k", None).unwrap();
        let reopened = storage(&dir, 0);
        wait_for_probe(&reopened);
        assert_eq!(reopened.maybe_cached(&reopened.cache_file_name("k")), Some(true));
        assert!(reopened.is_cached("k"));
    }

    #[test]
    fn test_cache_time_extension() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, 0);
        let start = SystemTime::now() - Duration::from_secs(50);
        storage
            .store_at(&vec![1], "k", Some(StorageExpiration::Seconds(60)), start)
            .unwrap();
        let _ = storage.value("k", ExpirationExtending::CacheTime).unwrap();
        wait_for_probe(&storage);
        let expiry = fs::metadata(storage.cache_file_url("k"))
            .unwrap()
            .modified()
            .unwrap();
        assert!(expiry > SystemTime::now() + Duration::from_secs(50));
    }

    #[test]
    fn test_plain_read_keeps_cache_time_window() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, 0);
        let start = SystemTime::now() - Duration::from_secs(50);
        storage
            .store_at(&vec![1], "k", Some(StorageExpiration::Seconds(60)), start)
            .unwrap();
        let path = storage.cache_file_url("k");

        assert!(storage.value("k", ExpirationExtending::None).unwrap().is_some());
        assert_eq!(fs::metadata(&path).unwrap().accessed().unwrap(), start);

        assert!(storage.value("k", ExpirationExtending::CacheTime).unwrap().is_some());
        wait_for_probe(&storage);
        let expiry = fs::metadata(&path).unwrap().modified().unwrap();
        assert!(expiry > SystemTime::now() + Duration::from_secs(55));
    }

    #[test]
    fn test_fixed_date_store_uses_reference_time() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, 0);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let at = t0 + Duration::from_secs(5);
        storage
            .store_at(&vec![1], "live", Some(StorageExpiration::At(at)), t0)
            .unwrap();
        storage
            .store_at(&vec![1], "stale", Some(StorageExpiration::At(at)), at)
            .unwrap();
        assert!(storage.cache_file_url("live").exists());
        assert!(storage.is_cached_at("live", t0));
        assert!(!storage.cache_file_url("stale").exists());
    }

    #[test]
    fn test_vanished_file_is_expired_with_zero_size() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, 0);
        storage
            .store(&vec![0; 64], "k", Some(StorageExpiration::Never))
            .unwrap();
        let path = storage.cache_file_url("k");
        assert!(!is_file_expired(&path, SystemTime::now()));
        assert_eq!(file_size(&path), 64);

        fs::remove_file(&path).unwrap();
        assert!(is_file_expired(&path, SystemTime::now()));
        assert_eq!(file_size(&path), 0);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, 0);
        storage.store(&vec![1], "k", None).unwrap();
        storage.remove("k").unwrap();
        storage.remove("k").unwrap();
        storage.remove("never-stored").unwrap();
        assert!(!storage.is_cached("k"));
    }

    #[test]
    fn test_remove_all_recreates_directory() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, 0);
        storage.store(&vec![1], "a", None).unwrap();
        storage.store(&vec![1], "b", None).unwrap();
        storage.remove_all().unwrap();
        assert!(storage.directory().is_dir());
        assert_eq!(storage.total_size().unwrap(), 0);
        storage.store(&vec![1], "c", None).unwrap();
        assert!(storage.is_cached("c"));
    }

    #[test]
    fn test_remove_expired_values() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, 0);
        let now = SystemTime::now();
        storage
            .store_at(&vec![1], "short", Some(StorageExpiration::Seconds(10)), now)
            .unwrap();
        storage
            .store_at(&vec![1], "long", Some(StorageExpiration::Days(1)), now)
            .unwrap();
        fs::write(storage.directory().join(".hidden"), b"x").unwrap();

        let removed = storage
            .remove_expired_values_at(now + Duration::from_secs(20))
            .unwrap();
        assert_eq!(removed, vec![storage.cache_file_url("short")]);
        assert!(storage.is_cached("long"));
        assert!(storage.directory().join(".hidden").exists());
    }

    #[test]
    fn test_size_eviction_keeps_most_recent_half() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, 1000);
        let base = SystemTime::now() - Duration::from_secs(1000);
        for i in 0..6u64 {
            storage
                .store_at(
                    &vec![0; 300],
                    &format!("k{i}"),
                    Some(StorageExpiration::Never),
                    base + Duration::from_secs(i * 10),
                )
                .unwrap();
        }
        assert_eq!(storage.total_size().unwrap(), 1800);

        let removed = storage.remove_size_exceeded_values().unwrap();
        let expected: Vec<_> = (0..5).map(|i| storage.cache_file_url(&format!("k{i}"))).collect();
        assert_eq!(removed, expected);
        assert!(storage.total_size().unwrap() <= 500);
        assert!(storage.is_cached("k5"));
    }

    #[test]
    fn test_size_eviction_noop_cases() {
        let dir = TempDir::new().unwrap();
        let unlimited = storage(&dir, 0);
        unlimited.store(&vec![0; 100], "a", None).unwrap();
        assert!(unlimited.remove_size_exceeded_values().unwrap().is_empty());

        let roomy = DiskStorage::<Vec<u8>>::new(
            DiskConfig::new("roomy", 1000).with_directory(dir.path()),
        )
        .unwrap();
        roomy.store(&vec![0; 100], "a", None).unwrap();
        assert!(roomy.remove_size_exceeded_values().unwrap().is_empty());
    }

    #[test]
    fn test_bytes_values() {
        let dir = TempDir::new().unwrap();
        let storage: DiskStorage<Bytes> =
            DiskStorage::new(DiskConfig::new("bytes", 0).with_directory(dir.path())).unwrap();
        storage.store(&Bytes::from_static(b"abc"), "k", None).unwrap();
        assert_eq!(
            storage.value("k", ExpirationExtending::None).unwrap(),
            Some(Bytes::from_static(b"abc"))
        );
    }
}
