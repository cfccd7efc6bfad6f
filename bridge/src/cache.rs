use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::encoder::GeneratedMeshDescriptor;
use crate::error::ConfigError;
use crate::fingerprint::Fingerprint;

/// Identity of a generation result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub shape: Fingerprint,
    pub attributes: Fingerprint,
    /// [`RulePackageRef::id_fingerprint`](crate::RulePackageRef::id_fingerprint) of the rule package.
    pub package: Fingerprint,
    pub rule_version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of descriptors kept.
    pub capacity: usize,
    /// Optional cap on the summed approximate descriptor size.
    pub memory_budget_bytes: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            memory_budget_bytes: Some(256 * 1024 * 1024),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::Invalid("cache capacity must be at least 1".into()));
        }
        if self.memory_budget_bytes == Some(0) {
            return Err(ConfigError::Invalid("cache memory budget must be positive when set".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    pub rejected: u64,
    pub entries: usize,
    pub bytes: usize,
}

struct Entry {
    descriptor: Arc<GeneratedMeshDescriptor>,
    size: usize,
    tick: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<CacheKey, Entry>,
    /// tick -> key, oldest first
    recency: BTreeMap<u64, CacheKey>,
    next_tick: u64,
    bytes: usize,
    /// Oldest rule version accepted for every package.
    min_version: u64,
    /// Oldest rule version accepted per package, raised by `invalidate_package`.
    package_min_versions: HashMap<Fingerprint, u64>,
    stats: CacheStats,
}

impl Inner {
    fn min_version_for(&self, package: &Fingerprint) -> u64 {
        let package_min = self.package_min_versions.get(package).copied().unwrap_or(0);
        self.min_version.max(package_min)
    }

    fn remove_where(&mut self, stale: impl Fn(&CacheKey) -> bool) -> usize {
        let keys: Vec<CacheKey> = self.entries.keys().filter(|k| stale(k)).copied().collect();
        for key in &keys {
            self.remove(key);
        }
        keys.len()
    }

    fn touch(&mut self, key: &CacheKey) {
        let tick = self.next_tick;
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.tick);
            entry.tick = tick;
            self.recency.insert(tick, *key);
            self.next_tick += 1;
        }
    }

    fn remove(&mut self, key: &CacheKey) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        self.bytes -= entry.size;
        Some(entry)
    }

    fn evict_oldest(&mut self) -> bool {
        let Some((_, key)) = self.recency.pop_first() else {
            return false;
        };
        if let Some(entry) = self.entries.remove(&key) {
            self.bytes -= entry.size;
            self.stats.evictions += 1;
            debug!("evicted cached result {} ({} bytes)", key.shape.short(), entry.size);
        }
        true
    }
}

/// Bounded LRU map from [`CacheKey`] to finished descriptors. Shared by all
/// workers; every operation takes one short internal lock.
pub struct ResultCache {
    config: CacheConfig,
    inner: Mutex<Inner>,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn lookup(&self, key: &CacheKey) -> Option<Arc<GeneratedMeshDescriptor>> {
        let mut inner = self.inner.lock();
        let found = inner.entries.get(key).map(|e| Arc::clone(&e.descriptor));
        match found {
            Some(descriptor) => {
                inner.touch(key);
                inner.stats.hits += 1;
                Some(descriptor)
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Stores `descriptor`, evicting least recently used entries to stay within
    /// bounds. Returns `false` when the entry was not kept: its rule version is
    /// older than an invalidation already seen, or it alone exceeds the memory
    /// budget.
    pub fn insert(&self, key: CacheKey, descriptor: Arc<GeneratedMeshDescriptor>) -> bool {
        let size = descriptor.approx_size_bytes();
        let mut inner = self.inner.lock();

        let min_version = inner.min_version_for(&key.package);
        if key.rule_version < min_version {
            inner.stats.rejected += 1;
            debug!(
                "dropping result for rule version {}, oldest accepted is {}",
                key.rule_version, min_version
            );
            return false;
        }
        if self.config.memory_budget_bytes.is_some_and(|budget| size > budget) {
            inner.stats.rejected += 1;
            warn!("result of {} bytes exceeds the cache budget, not cached", size);
            return false;
        }

        inner.remove(&key);
        let tick = inner.next_tick;
        inner.next_tick += 1;
        inner.entries.insert(key, Entry { descriptor, size, tick });
        inner.recency.insert(tick, key);
        inner.bytes += size;
        inner.stats.inserts += 1;

        while inner.entries.len() > self.config.capacity
            || self.config.memory_budget_bytes.is_some_and(|budget| inner.bytes > budget)
        {
            if !inner.evict_oldest() {
                break;
            }
        }
        true
    }

    /// Every rule package moved to at least `rule_version`: drops older entries
    /// and refuses older results from then on. Newer versions stay cacheable.
    /// Returns the number removed.
    pub fn invalidate_all(&self, rule_version: u64) -> usize {
        let mut inner = self.inner.lock();
        inner.min_version = inner.min_version.max(rule_version);
        let removed = inner.remove_where(|k| k.rule_version < rule_version);
        info!("cache invalidated below rule version {}: {} entries removed", rule_version, removed);
        removed
    }

    /// Like [`ResultCache::invalidate_all`], for one package only.
    pub fn invalidate_package(&self, package: Fingerprint, rule_version: u64) -> usize {
        let mut inner = self.inner.lock();
        let entry = inner.package_min_versions.entry(package).or_insert(0);
        *entry = (*entry).max(rule_version);
        let removed = inner.remove_where(|k| k.package == package && k.rule_version < rule_version);
        info!(
            "cache invalidated below version {} for package {}: {} entries removed",
            rule_version,
            package.short(),
            removed
        );
        removed
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.recency.clear();
        inner.bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            bytes: inner.bytes,
            ..inner.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttributeSet;
    use crate::encoder::{GeometryGroup, MaterialTag};
    use crate::shape::RulePackageRef;
    use glam::Vec3;

    fn package_key(package: &str, n: u64, version: u64) -> CacheKey {
        let attributes = AttributeSet::new().with("n", n as f64).unwrap().fingerprint();
        CacheKey {
            shape: AttributeSet::new().fingerprint(),
            attributes,
            package: RulePackageRef::new(package, version).id_fingerprint(),
            rule_version: version,
        }
    }

    fn key(n: u64, version: u64) -> CacheKey {
        package_key("extrude", n, version)
    }

    fn descriptor(vertices: usize) -> Arc<GeneratedMeshDescriptor> {
        Arc::new(GeneratedMeshDescriptor {
            groups: vec![GeometryGroup {
                material: MaterialTag::named("wall"),
                positions: vec![Vec3::ONE; vertices],
                normals: vec![Vec3::Y; vertices],
                uv_sets: Vec::new(),
                indices: (0..vertices as u32).collect(),
            }],
            ..Default::default()
        })
    }

    #[test]
    fn repeated_lookups_return_the_same_value() {
        let cache = ResultCache::new(CacheConfig::default());
        let inserted = descriptor(3);
        assert!(cache.insert(key(1, 1), inserted.clone()));
        for _ in 0..3 {
            assert_eq!(cache.lookup(&key(1, 1)).as_deref(), Some(&*inserted));
        }
        assert_eq!(cache.stats().hits, 3);
        assert!(cache.lookup(&key(2, 1)).is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn least_recently_used_entry_is_evicted() {
        let cache = ResultCache::new(CacheConfig { capacity: 2, memory_budget_bytes: None });
        cache.insert(key(1, 1), descriptor(3));
        cache.insert(key(2, 1), descriptor(3));
        cache.lookup(&key(1, 1));
        cache.insert(key(3, 1), descriptor(3));
        assert!(cache.contains(&key(1, 1)));
        assert!(!cache.contains(&key(2, 1)));
        assert!(cache.contains(&key(3, 1)));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn memory_budget_bounds_total_size() {
        let size = descriptor(100).approx_size_bytes();
        let cache = ResultCache::new(CacheConfig { capacity: 100, memory_budget_bytes: Some(size * 2 + size / 2) });
        for n in 0..5 {
            cache.insert(key(n, 1), descriptor(100));
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.stats().bytes <= size * 2 + size / 2);

        assert!(!cache.insert(key(9, 1), descriptor(10_000)));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn invalidation_removes_old_versions() {
        let cache = ResultCache::new(CacheConfig::default());
        cache.insert(key(1, 1), descriptor(3));
        cache.insert(key(2, 1), descriptor(3));
        assert_eq!(cache.invalidate_all(2), 2);
        assert!(cache.lookup(&key(1, 1)).is_none());
        assert!(cache.lookup(&key(2, 1)).is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().bytes, 0);

        // late results from the old rule version stay out
        assert!(!cache.insert(key(1, 1), descriptor(3)));
        assert!(cache.insert(key(1, 2), descriptor(3)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn newer_versions_stay_cacheable_after_invalidation() {
        let cache = ResultCache::new(CacheConfig::default());
        cache.insert(key(1, 1), descriptor(3));
        cache.insert(key(2, 3), descriptor(3));
        assert_eq!(cache.invalidate_all(2), 1);
        assert!(cache.contains(&key(2, 3)));

        // a later bump needs no second invalidation
        assert!(cache.insert(key(3, 3), descriptor(3)));
        assert!(cache.insert(key(4, 7), descriptor(3)));
        assert!(cache.lookup(&key(4, 7)).is_some());
        assert_eq!(cache.stats().rejected, 0);
    }

    #[test]
    fn package_invalidation_leaves_other_packages_alone() {
        let cache = ResultCache::new(CacheConfig::default());
        let extrude = RulePackageRef::new("extrude", 5).id_fingerprint();
        cache.insert(package_key("extrude", 1, 4), descriptor(3));
        cache.insert(package_key("facades", 1, 1), descriptor(3));

        assert_eq!(cache.invalidate_package(extrude, 5), 1);
        assert!(cache.contains(&package_key("facades", 1, 1)));
        assert!(!cache.insert(package_key("extrude", 2, 4), descriptor(3)));
        assert!(cache.insert(package_key("extrude", 2, 5), descriptor(3)));
        // a package at a lower version number is still cached
        assert!(cache.insert(package_key("facades", 2, 1), descriptor(3)));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn reinsert_replaces_without_double_counting() {
        let cache = ResultCache::new(CacheConfig::default());
        cache.insert(key(1, 1), descriptor(3));
        let bytes = cache.stats().bytes;
        cache.insert(key(1, 1), descriptor(3));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().bytes, bytes);
    }

    #[test]
    fn concurrent_access_is_safe() {
        let cache = Arc::new(ResultCache::new(CacheConfig { capacity: 16, memory_budget_bytes: None }));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for n in 0..50 {
                        cache.insert(key(t * 100 + n, 1), descriptor(3));
                        cache.lookup(&key(t * 100 + n / 2, 1));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 16);
    }
}
