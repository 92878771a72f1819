//! In-memory storage with cost and count limits, per-entry expiration and a
//! periodic expiry sweep.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use lru::LruCache;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::domain::entities::{
    CacheCostCalculable, ExpirationExtending, StorageExpiration, is_past,
};

/// Default expiration of memory entries.
pub const DEFAULT_MEMORY_EXPIRATION: StorageExpiration = StorageExpiration::Seconds(300);

/// Default interval between expiry sweeps.
pub const DEFAULT_CLEAN_INTERVAL: Duration = Duration::from_secs(120);

/// Memory storage configuration.
#[derive(Debug, Clone, Copy)]
pub struct MemoryConfig {
    /// Maximum total cost in bytes.
    pub total_cost_limit: usize,
    /// Maximum number of entries.
    pub count_limit: usize,
    /// Expiration used when a store passes none.
    pub expiration: StorageExpiration,
    /// Interval of the background sweep. Zero disables it.
    pub clean_interval: Duration,
}

impl MemoryConfig {
    /// Creates a configuration with the given cost limit and defaults
    /// elsewhere.
    #[must_use]
    pub const fn new(total_cost_limit: usize) -> Self {
        Self {
            total_cost_limit,
            count_limit: usize::MAX,
            expiration: DEFAULT_MEMORY_EXPIRATION,
            clean_interval: DEFAULT_CLEAN_INTERVAL,
        }
    }
}

#[derive(Debug)]
struct StorageObject<T> {
    value: T,
    expiration: StorageExpiration,
    estimated_expiration: SystemTime,
    cost: usize,
}

impl<T> StorageObject<T> {
    fn extend_expiration(&mut self, extending: ExpirationExtending, now: SystemTime) {
        match extending {
            ExpirationExtending::None => {}
            ExpirationExtending::CacheTime => {
                self.estimated_expiration = self.expiration.estimated_expiration_since(now);
            }
            ExpirationExtending::ExpirationTime(expiration) => {
                self.expiration = expiration;
                self.estimated_expiration = expiration.estimated_expiration_since(now);
            }
        }
    }

    fn is_expired(&self, now: SystemTime) -> bool {
        is_past(self.estimated_expiration, now)
    }
}

struct Backing<T> {
    lru: LruCache<String, StorageObject<T>>,
    total_cost: usize,
}

impl<T> Backing<T> {
    fn insert(&mut self, key: String, object: StorageObject<T>) {
        self.total_cost += object.cost;
        if let Some(old) = self.lru.put(key, object) {
            self.total_cost -= old.cost;
        }
    }

    fn pop(&mut self, key: &str) -> Option<StorageObject<T>> {
        let object = self.lru.pop(key)?;
        self.total_cost -= object.cost;
        Some(object)
    }

    fn evict_over_limits(&mut self, config: &MemoryConfig) {
        while self.total_cost > config.total_cost_limit || self.lru.len() > config.count_limit {
            let Some((key, object)) = self.lru.pop_lru() else {
                break;
            };
            self.total_cost -= object.cost;
            trace!(key = %key, cost = object.cost, "Evicted memory entry over limit");
        }
    }

    fn clear(&mut self) {
        self.lru.clear();
        self.total_cost = 0;
    }
}

struct Inner<T> {
    config: MemoryConfig,
    keys: Mutex<HashSet<String>>,
    backing: Mutex<Backing<T>>,
}

impl<T: Clone> Inner<T> {
    fn remove_expired_at(&self, now: SystemTime) -> usize {
        let mut keys = self.keys.lock();
        let mut backing = self.backing.lock();
        let mut removed = 0;
        keys.retain(|key| {
            let expired = match backing.lru.peek(key) {
                None => return false,
                Some(object) => object.is_expired(now),
            };
            if expired {
                backing.pop(key);
                removed += 1;
            }
            !expired
        });
        removed
    }
}

/// Bounded key-value storage kept in memory.
///
/// Cost and count eviction is least-recently-used. Expired entries are
/// invisible to reads and physically dropped by [`MemoryStorage::remove_expired`],
/// which also runs on a background interval while a tokio runtime is
/// available.
pub struct MemoryStorage<T> {
    inner: Arc<Inner<T>>,
    sweeper: Option<JoinHandle<()>>,
}

impl<T> MemoryStorage<T>
where
    T: CacheCostCalculable + Clone + Send + Sync + 'static,
{
    /// Creates the storage and starts the sweep when a runtime is present.
    #[must_use]
    pub fn new(config: MemoryConfig) -> Self {
        let inner = Arc::new(Inner {
            config,
            keys: Mutex::new(HashSet::new()),
            backing: Mutex::new(Backing {
                lru: LruCache::unbounded(),
                total_cost: 0,
            }),
        });
        let sweeper = spawn_sweeper(Arc::downgrade(&inner), config.clean_interval);
        Self { inner, sweeper }
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &MemoryConfig {
        &self.inner.config
    }

    /// Stores `value` under `key`.
    pub fn store(&self, value: T, key: &str, expiration: Option<StorageExpiration>) {
        self.store_at(value, key, expiration, SystemTime::now());
    }

    /// Stores `value` with `now` as the reference instant.
    pub fn store_at(
        &self,
        value: T,
        key: &str,
        expiration: Option<StorageExpiration>,
        now: SystemTime,
    ) {
        let expiration = expiration.unwrap_or(self.inner.config.expiration);
        if expiration.is_expired_at(now) {
            trace!(key = %key, "Skipping memory store with expired expiration");
            return;
        }
        let object = StorageObject {
            cost: value.cache_cost(),
            value,
            expiration,
            estimated_expiration: expiration.estimated_expiration_since(now),
        };

        let mut keys = self.inner.keys.lock();
        let mut backing = self.inner.backing.lock();
        backing.insert(key.to_string(), object);
        backing.evict_over_limits(&self.inner.config);
        keys.insert(key.to_string());
    }

    /// Returns the live value for `key`, extending its expiration.
    #[must_use]
    pub fn value(&self, key: &str, extending: ExpirationExtending) -> Option<T> {
        self.value_at(key, extending, SystemTime::now())
    }

    /// Returns the live value for `key` relative to `now`.
    #[must_use]
    pub fn value_at(&self, key: &str, extending: ExpirationExtending, now: SystemTime) -> Option<T> {
        let mut backing = self.inner.backing.lock();
        let object = backing.lru.get_mut(key)?;
        if object.is_expired(now) {
            return None;
        }
        object.extend_expiration(extending, now);
        Some(object.value.clone())
    }

    /// Returns whether a live value exists for `key`.
    #[must_use]
    pub fn is_cached(&self, key: &str) -> bool {
        self.is_cached_at(key, SystemTime::now())
    }

    /// Returns whether a live value exists for `key` relative to `now`.
    #[must_use]
    pub fn is_cached_at(&self, key: &str, now: SystemTime) -> bool {
        self.inner
            .backing
            .lock()
            .lru
            .peek(key)
            .is_some_and(|object| !object.is_expired(now))
    }

    /// Removes the value for `key`.
    pub fn remove(&self, key: &str) {
        let mut keys = self.inner.keys.lock();
        let mut backing = self.inner.backing.lock();
        backing.pop(key);
        keys.remove(key);
    }

    /// Removes every value.
    pub fn remove_all(&self) {
        let mut keys = self.inner.keys.lock();
        let mut backing = self.inner.backing.lock();
        backing.clear();
        keys.clear();
    }

    /// Drops every expired entry. Returns how many were removed.
    pub fn remove_expired(&self) -> usize {
        self.remove_expired_at(SystemTime::now())
    }

    /// Drops entries expired relative to `now`.
    pub fn remove_expired_at(&self, now: SystemTime) -> usize {
        self.inner.remove_expired_at(now)
    }

    /// Total cost of the stored values.
    #[must_use]
    pub fn total_cost(&self) -> usize {
        self.inner.backing.lock().total_cost
    }

    /// Number of stored values, expired ones included.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.backing.lock().lru.len()
    }
}

impl<T> Drop for MemoryStorage<T> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

fn spawn_sweeper<T>(inner: Weak<Inner<T>>, interval: Duration) -> Option<JoinHandle<()>>
where
    T: Clone + Send + Sync + 'static,
{
    if interval.is_zero() {
        return None;
    }
    let handle = tokio::runtime::Handle::try_current().ok()?;
    Some(handle.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let removed = inner.remove_expired_at(SystemTime::now());
            if removed > 0 {
                debug!(removed, "Swept expired memory entries");
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Blob(usize);

    impl CacheCostCalculable for Blob {
        fn cache_cost(&self) -> usize {
            self.0
        }
    }

    fn storage(limit: usize) -> MemoryStorage<Blob> {
        MemoryStorage::new(MemoryConfig {
            clean_interval: Duration::ZERO,
            ..MemoryConfig::new(limit)
        })
    }

    fn t0() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    #[test]
    fn test_store_and_expire_with_simulated_clock() {
        let storage = storage(1000);
        storage.store_at(Blob(1), "k", Some(StorageExpiration::Seconds(10)), t0());

        let just_after = t0() + Duration::from_secs(1);
        assert_eq!(
            storage.value_at("k", ExpirationExtending::None, just_after),
            Some(Blob(1))
        );

        let later = t0() + Duration::from_secs(11);
        assert_eq!(storage.value_at("k", ExpirationExtending::None, later), None);
        assert!(!storage.is_cached_at("k", later));
        assert_eq!(storage.count(), 1);
    }

    #[test]
    fn test_already_expired_store_is_noop() {
        let storage = storage(1000);
        storage.store(Blob(1), "k", Some(StorageExpiration::Expired));
        storage.store(Blob(1), "z", Some(StorageExpiration::Seconds(0)));
        assert!(!storage.is_cached("k"));
        assert!(!storage.is_cached("z"));
        assert_eq!(storage.count(), 0);
    }

    #[test]
    fn test_fixed_date_store_uses_reference_time() {
        let storage = storage(1000);
        let at = t0() + Duration::from_secs(5);
        storage.store_at(Blob(1), "live", Some(StorageExpiration::At(at)), t0());
        storage.store_at(Blob(2), "stale", Some(StorageExpiration::At(at)), at);

        assert!(storage.is_cached_at("live", t0()));
        assert!(!storage.is_cached_at("live", at));
        assert_eq!(storage.count(), 1);
    }

    #[test]
    fn test_cache_time_extension_restarts_window() {
        let storage = storage(1000);
        storage.store_at(Blob(1), "k", Some(StorageExpiration::Seconds(10)), t0());

        let read = t0() + Duration::from_secs(8);
        assert!(
            storage
                .value_at("k", ExpirationExtending::CacheTime, read)
                .is_some()
        );
        assert!(storage.is_cached_at("k", t0() + Duration::from_secs(17)));
        assert!(!storage.is_cached_at("k", t0() + Duration::from_secs(18)));
    }

    #[test]
    fn test_expiration_time_extension_uses_new_window() {
        let storage = storage(1000);
        storage.store_at(Blob(1), "k", Some(StorageExpiration::Seconds(10)), t0());
        let extending = ExpirationExtending::ExpirationTime(StorageExpiration::Seconds(100));
        assert!(storage.value_at("k", extending, t0()).is_some());
        assert!(storage.is_cached_at("k", t0() + Duration::from_secs(99)));
    }

    #[test]
    fn test_cost_eviction_drops_least_recent() {
        let storage = storage(10);
        storage.store(Blob(4), "a", None);
        storage.store(Blob(4), "b", None);
        let _ = storage.value("a", ExpirationExtending::None);
        storage.store(Blob(4), "c", None);

        assert!(storage.is_cached("a"));
        assert!(!storage.is_cached("b"));
        assert!(storage.is_cached("c"));
        assert_eq!(storage.total_cost(), 8);
    }

    #[test]
    fn test_count_limit() {
        let storage = MemoryStorage::new(MemoryConfig {
            count_limit: 2,
            clean_interval: Duration::ZERO,
            ..MemoryConfig::new(usize::MAX)
        });
        for key in ["a", "b", "c"] {
            storage.store(Blob(1), key, None);
        }
        assert_eq!(storage.count(), 2);
        assert!(!storage.is_cached("a"));
    }

    #[test]
    fn test_sweep_removes_expired_and_stale_keys() {
        let storage = storage(5);
        storage.store_at(Blob(1), "short", Some(StorageExpiration::Seconds(5)), t0());
        storage.store_at(Blob(1), "long", Some(StorageExpiration::Seconds(500)), t0());

        let removed = storage.remove_expired_at(t0() + Duration::from_secs(6));
        assert_eq!(removed, 1);
        assert_eq!(storage.count(), 1);
        assert_eq!(storage.inner.keys.lock().len(), 1);

        storage.store(Blob(5), "big", None);
        storage.remove_expired();
        assert_eq!(storage.inner.keys.lock().len(), 1);
    }

    #[test]
    fn test_overwrite_replaces_cost() {
        let storage = storage(100);
        storage.store(Blob(10), "k", None);
        storage.store(Blob(3), "k", None);
        assert_eq!(storage.total_cost(), 3);
        assert_eq!(storage.value("k", ExpirationExtending::None), Some(Blob(3)));
    }

    #[test]
    fn test_remove_and_remove_all() {
        let storage = storage(100);
        storage.store(Blob(1), "a", None);
        storage.store(Blob(1), "b", None);
        storage.remove("a");
        storage.remove("a");
        assert!(!storage.is_cached("a"));
        storage.remove_all();
        assert_eq!(storage.count(), 0);
        assert_eq!(storage.total_cost(), 0);
    }

    #[tokio::test]
    async fn test_background_sweep_runs() {
        let storage = MemoryStorage::new(MemoryConfig {
            clean_interval: Duration::from_millis(20),
            ..MemoryConfig::new(100)
        });
        storage.store_at(
            Blob(1),
            "old",
            Some(StorageExpiration::Seconds(1)),
            SystemTime::now() - Duration::from_secs(60),
        );
        assert_eq!(storage.count(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(storage.count(), 0);
    }
}
