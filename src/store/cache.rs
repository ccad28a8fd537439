//! Bounded profile cache with scored eviction.
//!
//! Keeps the hot working set of profiles in memory so ingest bursts do not
//! hot-key the backing store. Eviction prefers entries that are cold, young
//! in sample count, and low priority.

use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of cached profiles.
    pub max_entries: usize,
    /// Minimum accesses before an entry can be evicted.
    pub min_accesses_for_eviction: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: 50_000, min_accesses_for_eviction: 10 }
    }
}

#[derive(Debug, Clone)]
struct EntryMeta {
    last_access: Instant,
    access_count: u64,
    priority: u8,
}

impl EntryMeta {
    fn new(priority: u8) -> Self {
        Self { last_access: Instant::now(), access_count: 0, priority }
    }

    fn touch(&mut self) {
        self.last_access = Instant::now();
        self.access_count += 1;
    }

    /// Lower score evicts first: recency, accumulated accesses, and
    /// priority all raise it.
    fn retention_score(&self) -> f64 {
        let age_seconds = self.last_access.elapsed().as_secs_f64();
        let access_factor = (self.access_count as f64).ln().max(1.0);
        let priority_factor = 1.0 + self.priority as f64 * 0.5;
        (access_factor * priority_factor) / (age_seconds + 1.0)
    }
}

#[derive(Debug)]
struct Entry<P> {
    value: P,
    meta: EntryMeta,
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub evictions: u64,
    pub creations: u64,
    pub accesses: u64,
}

pub struct ProfileCache<P> {
    entries: HashMap<u64, Entry<P>>,
    config: CacheConfig,
    stats: CacheStats,
}

impl<P> ProfileCache<P> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: HashMap::with_capacity(config.max_entries.min(4_096)),
            config,
            stats: CacheStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats { entries: self.entries.len(), ..self.stats.clone() }
    }

    pub fn get(&mut self, key: u64) -> Option<&P> {
        self.entries.get_mut(&key).map(|e| {
            e.meta.touch();
            &e.value
        })
    }

    pub fn get_mut(&mut self, key: u64) -> Option<&mut P> {
        let entry = self.entries.get_mut(&key)?;
        entry.meta.touch();
        self.stats.accesses += 1;
        Some(&mut entry.value)
    }

    pub fn contains(&self, key: u64) -> bool {
        self.entries.contains_key(&key)
    }

    /// Fetch or lazily create, evicting one entry when at capacity.
    pub fn get_or_create<F>(&mut self, key: u64, priority: u8, create: F) -> &mut P
    where
        F: FnOnce() -> P,
    {
        if self.entries.contains_key(&key) {
            let entry = self.entries.get_mut(&key).unwrap();
            entry.meta.touch();
            self.stats.accesses += 1;
            return &mut entry.value;
        }

        if self.entries.len() >= self.config.max_entries {
            self.evict_one();
        }

        self.stats.creations += 1;
        self.entries
            .entry(key)
            .or_insert_with(|| Entry { value: create(), meta: EntryMeta::new(priority) });
        &mut self.entries.get_mut(&key).unwrap().value
    }

    pub fn remove(&mut self, key: u64) -> Option<P> {
        self.entries.remove(&key).map(|e| e.value)
    }

    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&u64, &P) -> bool,
    {
        self.entries.retain(|k, e| keep(k, &e.value));
    }

    fn evict_one(&mut self) {
        let candidate = self.eviction_candidate();
        if let Some(key) = candidate {
            self.entries.remove(&key);
            self.stats.evictions += 1;
        }
    }

    fn eviction_candidate(&self) -> Option<u64> {
        let mut best: Option<(u64, f64)> = None;
        for (&key, entry) in &self.entries {
            if entry.meta.access_count < self.config.min_accesses_for_eviction {
                continue;
            }
            let score = entry.meta.retention_score();
            match best {
                None => best = Some((key, score)),
                Some((_, current)) if score < current => best = Some((key, score)),
                _ => {}
            }
        }

        // Every entry is still warming up: fall back to plain LRU.
        if best.is_none() {
            best = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.meta.last_access)
                .map(|(&k, e)| (k, e.meta.retention_score()));
        }

        best.map(|(k, _)| k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(max: usize) -> ProfileCache<u32> {
        ProfileCache::new(CacheConfig { max_entries: max, min_accesses_for_eviction: 0 })
    }

    #[test]
    fn test_get_or_create() {
        let mut cache = small(10);
        assert_eq!(*cache.get_or_create(1, 0, || 42), 42);
        *cache.get_or_create(1, 0, || 99) = 7;
        assert_eq!(cache.get(1), Some(&7));
        assert_eq!(cache.stats().creations, 1);
    }

    #[test]
    fn test_bounded() {
        let mut cache = small(3);
        for key in 0..10 {
            cache.get_or_create(key, 0, || key as u32);
        }
        assert_eq!(cache.len(), 3);
        assert!(cache.stats().evictions >= 7);
    }

    #[test]
    fn test_priority_survives_eviction() {
        let mut cache = small(3);
        cache.get_or_create(1, 0, || 1);
        cache.get_or_create(2, 0, || 2);
        cache.get_or_create(3, 10, || 3);
        for _ in 0..5 {
            cache.get_mut(1);
            cache.get_mut(2);
            cache.get_mut(3);
        }
        cache.get_or_create(4, 0, || 4);
        assert!(cache.contains(3), "high-priority entry evicted");
    }

    #[test]
    fn test_retain() {
        let mut cache = small(10);
        for key in 0..5 {
            cache.get_or_create(key, 0, || key as u32);
        }
        cache.retain(|_, v| *v % 2 == 0);
        assert_eq!(cache.len(), 3);
    }
}
