//! Bounded least-recently-used cache.
//!
//! Every read or insert stamps the touched entry with the next value
//! of a monotonic clock. When the cache is full, the entries with the
//! smallest stamps are evicted in batches. Entries that share a stamp
//! (only possible right after renumbering, which preserves order) are
//! evicted in arbitrary order.

use std::collections::{hash_map, HashMap};
use std::hash::Hash;

/// Called once for every entry leaving the cache.
pub type RemoveHook<K, V> = Box<dyn FnMut(&K, &mut V) + Send>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Values inserted.
    pub added: u64,
    /// Successful reads.
    pub retrieved: u64,
    /// Values displaced, evicted, or cleared.
    pub removed: u64,
    /// Times the cache was full on insert.
    pub eviction_passes: u64,
}

struct Entry<V> {
    value: V,
    stamp: u64,
}

pub struct BoundedCache<K, V> {
    capacity: usize,
    evict_batch: usize,
    entries: HashMap<K, Entry<V>>,
    clock: u64,
    on_remove: Option<RemoveHook<K, V>>,
    stats: CacheStats,
}

impl<K, V> BoundedCache<K, V>
where
    K: Hash + Eq + Clone,
{
    /// Returns an empty cache holding at most `capacity` values and
    /// evicting `evict_batch` of them whenever it is full.
    ///
    /// # Panics
    ///
    /// If either argument is zero.
    pub fn new(capacity: usize, evict_batch: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be non-zero");
        assert!(evict_batch > 0, "cache eviction batch must be non-zero");
        Self {
            capacity,
            evict_batch,
            entries: HashMap::with_capacity(capacity),
            clock: 0,
            on_remove: None,
            stats: CacheStats::default(),
        }
    }

    #[must_use]
    pub fn with_on_remove<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&K, &mut V) + Send + 'static,
    {
        self.on_remove = Some(Box::new(hook));
        self
    }

    /// Returns the value for `key` and marks it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        if !self.entries.contains_key(key) {
            return None;
        }
        let stamp = self.tick();
        self.stats.retrieved += 1;
        self.entries.get_mut(key).map(|entry| {
            entry.stamp = stamp;
            &entry.value
        })
    }

    /// Returns the value for `key`, calling `load` to produce it on a
    /// miss.
    ///
    /// Room is only made once `load` succeeds, so a failed load leaves
    /// the cache as it was.
    pub fn get_or_try_insert_with<E, F>(&mut self, key: K, load: F) -> Result<&V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let loaded = if self.entries.contains_key(&key) {
            None
        } else {
            let value = load()?;
            if self.entries.len() >= self.capacity {
                self.evict();
            }
            Some(value)
        };
        let stamp = self.tick();
        let entry = match (self.entries.entry(key), loaded) {
            (hash_map::Entry::Occupied(occupied), _) => {
                self.stats.retrieved += 1;
                let entry = occupied.into_mut();
                entry.stamp = stamp;
                entry
            }
            (hash_map::Entry::Vacant(vacant), Some(value)) => {
                self.stats.added += 1;
                vacant.insert(Entry { value, stamp })
            }
            (hash_map::Entry::Vacant(_), None) => unreachable!(),
        };
        Ok(&entry.value)
    }

    /// Inserts `value`, evicting the least recently used entries first
    /// if the cache is full.
    ///
    /// A value already stored under `key` is replaced and handed to
    /// the remove hook.
    pub fn add(&mut self, key: K, value: V) {
        if let Some(mut displaced) = self.entries.remove(&key) {
            self.stats.removed += 1;
            self.run_hook(&key, &mut displaced.value);
        } else if self.entries.len() >= self.capacity {
            self.evict();
        }
        let stamp = self.tick();
        self.entries.insert(key, Entry { value, stamp });
        self.stats.added += 1;
    }

    /// Does not affect recency.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Removes every entry, running the remove hook on each, and
    /// resets all counters.
    pub fn clear(&mut self) {
        let entries = std::mem::take(&mut self.entries);
        for (key, mut entry) in entries {
            self.run_hook(&key, &mut entry.value);
        }
        self.clock = 0;
        self.stats = CacheStats::default();
    }
}

/// Private API.
impl<K, V> BoundedCache<K, V>
where
    K: Hash + Eq + Clone,
{
    fn tick(&mut self) -> u64 {
        if self.clock == u64::MAX {
            self.renumber();
        }
        let stamp = self.clock;
        self.clock += 1;
        stamp
    }

    /// Compacts stamps to `0..len`, keeping their relative order.
    fn renumber(&mut self) {
        let mut entries: Vec<&mut Entry<V>> = self.entries.values_mut().collect();
        entries.sort_unstable_by_key(|entry| entry.stamp);
        for (stamp, entry) in (0..).zip(entries) {
            entry.stamp = stamp;
        }
        self.clock = self.entries.len() as u64;
    }

    fn evict(&mut self) {
        assert!(!self.entries.is_empty(), "eviction from an empty cache");
        let count = self.evict_batch.min(self.entries.len());
        let mut oldest: Vec<(u64, K)> = self
            .entries
            .iter()
            .map(|(key, entry)| (entry.stamp, key.clone()))
            .collect();
        if count < oldest.len() {
            oldest.select_nth_unstable_by_key(count, |(stamp, _)| *stamp);
            oldest.truncate(count);
        }
        for (_, key) in oldest {
            if let Some(mut entry) = self.entries.remove(&key) {
                self.stats.removed += 1;
                self.run_hook(&key, &mut entry.value);
            }
        }
        self.stats.eviction_passes += 1;
    }

    fn run_hook(&mut self, key: &K, value: &mut V) {
        if let Some(hook) = self.on_remove.as_mut() {
            hook(key, value);
        }
    }
}

impl<K, V> Drop for BoundedCache<K, V> {
    fn drop(&mut self) {
        if let Some(hook) = self.on_remove.as_mut() {
            for (key, mut entry) in self.entries.drain() {
                hook(&key, &mut entry.value);
            }
        }
    }
}
