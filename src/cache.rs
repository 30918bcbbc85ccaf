//! In-process TTL cache with pattern invalidation.
//!
//! Expired entries are never returned: a read at or past `expires_at` is a
//! miss and evicts the entry. The periodic sweep only reclaims memory.
//!
//! Every delete or invalidation bumps a generation counter. A reader that
//! loaded from the store before a concurrent invalidation uses the counter
//! to avoid writing its (possibly stale) result back.

use crate::clock::Clock;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

#[derive(Clone)]
pub struct TtlCache<V> {
    entries: Arc<DashMap<String, CacheEntry<V>>>,
    default_ttl: Duration,
    clock: Arc<dyn Clock>,
    generation: Arc<AtomicU64>,
}

impl<V> TtlCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(default_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            default_ttl,
            clock,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Look up a live entry. Expired entries count as a miss and are evicted.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();

        let expired = match self.entries.get(key) {
            Some(entry) if now < entry.expires_at => {
                metrics::increment_counter!("cache_hits_total");
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        // The read guard above is released before taking the write lock.
        if expired {
            self.entries.remove_if(key, |_, entry| now >= entry.expires_at);
            debug!(key, "Evicted expired cache entry on read");
        }
        metrics::increment_counter!("cache_misses_total");
        None
    }

    /// Store `value` under `key` with the default TTL, overwriting.
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    /// A TTL too large to represent is not stored, and any older value under
    /// the key is dropped.
    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        match self.clock.now().checked_add(ttl) {
            Some(expires_at) => {
                self.entries.insert(key, CacheEntry { value, expires_at });
            }
            None => {
                warn!(key = %key, ttl_secs = ttl.as_secs(), "Cache TTL out of range, entry not stored");
                self.entries.remove(&key);
            }
        }
    }

    /// Store only if no delete or invalidation ran since `observed` was read
    /// from [`generation`](Self::generation). Returns whether the value stayed.
    pub fn set_if_generation(&self, key: &str, value: V, ttl: Duration, observed: u64) -> bool {
        if self.generation() != observed {
            return false;
        }
        self.set_with_ttl(key, value, ttl);

        // An invalidation that bumped the generation between the check and
        // the insert may have missed our entry; take it back out.
        if self.generation() != observed {
            self.entries.remove(key);
            return false;
        }
        true
    }

    /// Exact-key delete. Returns the number of entries removed (0 or 1).
    pub fn delete(&self, key: &str) -> usize {
        self.bump_generation();
        let removed = usize::from(self.entries.remove(key).is_some());
        metrics::counter!("cache_invalidated_total", removed as u64);
        removed
    }

    /// Delete every entry whose key satisfies `predicate`.
    pub fn invalidate_by_predicate<F>(&self, predicate: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        self.bump_generation();
        let before = self.entries.len();
        self.entries.retain(|key, _| !predicate(key));
        let removed = before.saturating_sub(self.entries.len());
        metrics::counter!("cache_invalidated_total", removed as u64);
        removed
    }

    /// Delete every entry whose key starts with or contains `token`.
    ///
    /// Matching on containment is deliberately loose: `posts:` also clears
    /// `user-posts:` keys. Over-invalidation costs a store read; under-
    /// invalidation would serve stale data.
    pub fn invalidate_by_prefix(&self, token: &str) -> usize {
        self.invalidate_by_predicate(|key| key.starts_with(token) || key.contains(token))
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| now < entry.expires_at);
        before.saturating_sub(self.entries.len())
    }

    pub fn clear(&self) {
        self.bump_generation();
        self.entries.clear();
    }

    /// Entries currently held, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Counter bumped by every delete and invalidation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Read-through helper: serve from cache, otherwise run `loader` and
    /// populate unless an invalidation raced with the load.
    pub async fn get_or_load<F, Fut, E>(&self, key: &str, loader: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let observed = self.generation();
        let value = loader().await?;
        if !self.set_if_generation(key, value.clone(), self.default_ttl, observed) {
            debug!(key, "Skipped cache population after concurrent invalidation");
        }
        Ok(value)
    }

    /// Sweep expired entries every `interval` on the current runtime.
    pub fn spawn_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let purged = cache.purge_expired();
                if purged > 0 {
                    debug!(purged, remaining = cache.len(), "Cache sweep");
                }
                metrics::gauge!("cache_entries", cache.len() as f64);
            }
        })
    }
}

/// Response cache holding JSON payloads.
pub type JsonCache = TtlCache<serde_json::Value>;

impl TtlCache<serde_json::Value> {
    /// Typed read. A payload that no longer deserializes is logged, evicted
    /// and reported as a miss.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                warn!(key, error = %e, "Corrupt cache entry, treating as miss");
                self.entries.remove(key);
                None
            }
        }
    }

    /// Typed write. Serialization failures are logged and skipped.
    pub fn set_as<T: Serialize>(&self, key: impl Into<String>, value: &T) {
        let key = key.into();
        match serde_json::to_value(value) {
            Ok(json) => self.set(key, json),
            Err(e) => warn!(key = %key, error = %e, "Failed to serialize cache entry"),
        }
    }

    /// Typed read-through. Store errors propagate; cache problems never do.
    pub async fn get_or_load_as<T, F, Fut, E>(&self, key: &str, loader: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(cached) = self.get_as::<T>(key) {
            return Ok(cached);
        }

        let observed = self.generation();
        let loaded = loader().await?;
        match serde_json::to_value(&loaded) {
            Ok(json) => {
                self.set_if_generation(key, json, self.default_ttl, observed);
            }
            Err(e) => warn!(key, error = %e, "Failed to serialize cache entry"),
        }
        Ok(loaded)
    }
}
