//! Keyed lazy cache with TTL ("lifespan") and explicit dependency invalidation.
//!
//! Mirrors the teacher's `storage/pcache.rs` page cache (a keyed slot map with
//! an eviction policy) but swaps the LRU eviction for wall-clock expiry and a
//! lazy-compute entry point, since the record engine's page/record/parsed
//! tiers (spec §4.3.2) need "compute once, reuse until invalidated or stale"
//! rather than "evict least-recently-used under memory pressure".

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

/// A keyed cache whose entries expire after `lifespan` and can be explicitly
/// invalidated when the record engine knows a dependency changed underneath
/// them (spec §4.7: "before an update, dependent keys are re-derived lazily").
pub struct Cache<K, V> {
    entries: RwLock<HashMap<K, Entry<V>>>,
    lifespan: Duration,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Build a cache whose entries are considered stale after `lifespan`.
    pub fn new(lifespan: Duration) -> Self {
        Cache {
            entries: RwLock::new(HashMap::new()),
            lifespan,
        }
    }

    /// Return a cached, unexpired value for `key`, computing and storing one
    /// via `compute` on a miss or after expiry. `compute` may fail; a failed
    /// compute never populates the cache.
    pub fn get_or_try_compute<E>(
        &self,
        key: &K,
        compute: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        if let Some(value) = self.fresh(key) {
            return Ok(value);
        }
        let value = compute()?;
        self.entries.write().unwrap().insert(
            key.clone(),
            Entry {
                value: value.clone(),
                inserted_at: Instant::now(),
            },
        );
        Ok(value)
    }

    fn fresh(&self, key: &K) -> Option<V> {
        let entries = self.entries.read().unwrap();
        let entry = entries.get(key)?;
        if entry.inserted_at.elapsed() > self.lifespan {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Directly store a freshly known value, bypassing `compute` (used when
    /// the record engine just wrote a page and already has its new bytes in
    /// hand, per spec §4.3.2 "When a page is mutated, the engine updates the
    /// page-cache entry for that index").
    pub fn put(&self, key: K, value: V) {
        self.entries.write().unwrap().insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop a single key, forcing the next access to recompute. Used for
    /// transitive invalidation: the record engine calls this on every
    /// dependent cache tier (page header, parsed header, record, parsed
    /// record) whenever the underlying page changes.
    pub fn invalidate(&self, key: &K) {
        self.entries.write().unwrap().remove(key);
    }

    /// Drop every entry. Used when the whole address space shifts under the
    /// cache (e.g. after a journal restore reloads metadata).
    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
    }
}
