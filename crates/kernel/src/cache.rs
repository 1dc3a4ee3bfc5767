//! Second-level data cache contract
//!
//! The cache holds committed rows keyed by object id so brokers can skip the
//! store on `find`. Eviction policy is the cache's own business; the kernel
//! only evicts rows a commit wrote or deleted.

use crate::store::StoredRow;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use stead_core::ObjectId;

/// Hit and miss counters of a cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the cache
    pub hits: u64,
    /// Lookups that fell through
    pub misses: u64,
}

/// Committed-row cache shared by the brokers of a factory
pub trait DataCache: Send + Sync {
    /// Cache name
    fn name(&self) -> &str;

    /// Cached row for `oid`
    fn get(&self, oid: &ObjectId) -> Option<StoredRow>;

    /// Cache `row` under `oid`
    fn put(&self, oid: ObjectId, row: StoredRow);

    /// Drop `oid`; returns whether it was cached
    fn evict(&self, oid: &ObjectId) -> bool;

    /// Drop everything
    fn clear(&self);

    /// Counters since creation
    fn stats(&self) -> CacheStats;

    /// Drop every id in `oids`
    fn evict_all(&self, oids: &[ObjectId]) {
        for oid in oids {
            self.evict(oid);
        }
    }
}

/// Unbounded concurrent [`DataCache`]
#[derive(Debug)]
pub struct InMemoryDataCache {
    name: String,
    rows: DashMap<ObjectId, StoredRow>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl InMemoryDataCache {
    /// Empty cache called `name`
    pub fn new(name: impl Into<String>) -> Self {
        InMemoryDataCache {
            name: name.into(),
            rows: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Number of cached rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Whether `oid` is cached, without touching the counters
    pub fn contains(&self, oid: &ObjectId) -> bool {
        self.rows.contains_key(oid)
    }
}

impl DataCache for InMemoryDataCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, oid: &ObjectId) -> Option<StoredRow> {
        match self.rows.get(oid) {
            Some(row) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(row.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn put(&self, oid: ObjectId, row: StoredRow) {
        self.rows.insert(oid, row);
    }

    fn evict(&self, oid: &ObjectId) -> bool {
        self.rows.remove(oid).is_some()
    }

    fn clear(&self) {
        self.rows.clear();
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Name of the cache a manager creates by default
pub const DEFAULT_CACHE_NAME: &str = "default";

/// Named caches of one factory
#[derive(Clone)]
pub struct DataCacheManager {
    caches: Arc<DashMap<String, Arc<dyn DataCache>>>,
}

impl std::fmt::Debug for DataCacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataCacheManager")
            .field(
                "caches",
                &self.caches.iter().map(|e| e.key().clone()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Default for DataCacheManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DataCacheManager {
    /// Manager holding an in-memory default cache
    pub fn new() -> Self {
        let manager = DataCacheManager {
            caches: Arc::new(DashMap::new()),
        };
        manager.register(Arc::new(InMemoryDataCache::new(DEFAULT_CACHE_NAME)));
        manager
    }

    /// Add or replace a cache under its own name
    pub fn register(&self, cache: Arc<dyn DataCache>) {
        self.caches.insert(cache.name().to_string(), cache);
    }

    /// Cache called `name`
    pub fn cache(&self, name: &str) -> Option<Arc<dyn DataCache>> {
        self.caches.get(name).map(|c| Arc::clone(c.value()))
    }

    /// The default cache
    pub fn system_cache(&self) -> Option<Arc<dyn DataCache>> {
        self.cache(DEFAULT_CACHE_NAME)
    }

    /// Evict `oids` from every cache
    pub fn evict_all(&self, oids: &[ObjectId]) {
        for entry in self.caches.iter() {
            entry.value().evict_all(oids);
        }
    }

    /// Clear every cache
    pub fn clear(&self) {
        for entry in self.caches.iter() {
            entry.value().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stead_core::{FieldValue, Version};

    fn row() -> StoredRow {
        StoredRow {
            values: vec![FieldValue::string("Ann")],
            version: Version::Counter(1),
        }
    }

    #[test]
    fn test_hit_and_miss_counters() {
        let cache = InMemoryDataCache::new("c");
        let oid = ObjectId::datastore("Person", 1);
        assert!(cache.get(&oid).is_none());
        cache.put(oid.clone(), row());
        assert_eq!(cache.get(&oid), Some(row()));
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1 });
    }

    #[test]
    fn test_evict_and_clear() {
        let cache = InMemoryDataCache::new("c");
        let a = ObjectId::datastore("Person", 1);
        let b = ObjectId::datastore("Person", 2);
        cache.put(a.clone(), row());
        cache.put(b.clone(), row());
        assert!(cache.evict(&a));
        assert!(!cache.evict(&a));
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_manager_evicts_from_every_cache() {
        let manager = DataCacheManager::new();
        let extra = Arc::new(InMemoryDataCache::new("extra"));
        manager.register(extra.clone());
        let oid = ObjectId::datastore("Person", 1);
        manager.system_cache().unwrap().put(oid.clone(), row());
        extra.put(oid.clone(), row());
        manager.evict_all(&[oid.clone()]);
        assert!(!extra.contains(&oid));
        assert!(manager.system_cache().unwrap().get(&oid).is_none());
    }
}
