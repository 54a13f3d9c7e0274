use lru::LruCache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::entry::{CacheConfig, CacheConfigUpdate, CacheEntry, CacheStats, TtlClass, TtlDistribution};
use super::{estimate_size, CacheWriteError, KeyPattern};
use crate::util::format_bytes;

struct CacheInner {
    /// Recency order is last access, not insertion.
    entries: LruCache<String, CacheEntry>,
    total_size: usize,
    config: CacheConfig,
    hits: u64,
    misses: u64,
}

impl CacheInner {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.total_size = self.total_size.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn over_budget(&self) -> bool {
        self.entries.len() > self.config.max_entries || self.total_size > self.config.max_size_bytes
    }

    fn remove_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    /// Drops expired entries, then least-recently-used ones, until both
    /// budgets hold.
    fn enforce_budget(&mut self, now: Instant) -> usize {
        if !self.over_budget() {
            return 0;
        }
        let mut removed = self.remove_expired(now);
        while self.over_budget() {
            match self.entries.pop_lru() {
                Some((key, entry)) => {
                    self.total_size = self.total_size.saturating_sub(entry.size_bytes);
                    tracing::trace!(key = %key, "Evicted least recently used cache entry");
                    removed += 1;
                }
                None => break,
            }
        }
        removed
    }
}

#[derive(Default)]
struct CleanupTimer {
    token: Option<CancellationToken>,
    destroyed: bool,
}

/// TTL + LRU cache of JSON values keyed by string.
///
/// All state sits behind one mutex held only for synchronous updates. A
/// background sweep removes expired entries every `cleanup_interval`; call
/// [`destroy`](Self::destroy) (or drop the last `Arc`) to stop it.
pub struct ValidationCache {
    inner: Mutex<CacheInner>,
    timer: Mutex<CleanupTimer>,
    me: Weak<ValidationCache>,
}

impl ValidationCache {
    /// Creates the cache and, when called inside a Tokio runtime, starts the
    /// cleanup timer.
    pub fn new(config: CacheConfig) -> Arc<Self> {
        let cache = Arc::new_cyclic(|me| Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::unbounded(),
                total_size: 0,
                config,
                hits: 0,
                misses: 0,
            }),
            timer: Mutex::new(CleanupTimer::default()),
            me: me.clone(),
        });
        cache.restart_timer();
        cache
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_timer(&self) -> MutexGuard<'_, CleanupTimer> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Stores `data` under `key` with the TTL selected by `class`.
    ///
    /// Replaces any existing entry. Afterwards both the entry-count and byte
    /// budgets hold; least-recently-accessed entries are evicted to get there.
    ///
    /// # Errors
    ///
    /// [`CacheWriteError::TooLarge`] if the entry alone exceeds the byte
    /// budget, [`CacheWriteError::Destroyed`] after [`destroy`](Self::destroy).
    pub fn set(&self, key: &str, data: Value, class: TtlClass) -> Result<(), CacheWriteError> {
        if self.lock_timer().destroyed {
            return Err(CacheWriteError::Destroyed);
        }

        let class = class.resolve(key);
        let size_bytes = key.len() + estimate_size(&data);
        let now = Instant::now();

        let mut inner = self.lock();
        if size_bytes > inner.config.max_size_bytes {
            return Err(CacheWriteError::TooLarge {
                size: size_bytes,
                max: inner.config.max_size_bytes,
            });
        }

        let ttl = class.ttl(&inner.config);
        inner.remove(key);
        inner.entries.push(
            key.to_owned(),
            CacheEntry {
                key: key.to_owned(),
                data,
                ttl,
                class,
                created_at: now,
                last_accessed: now,
                access_count: 0,
                size_bytes,
            },
        );
        inner.total_size += size_bytes;

        let evicted = inner.enforce_budget(now);
        if evicted > 0 {
            tracing::debug!(
                evicted = evicted,
                entries = inner.entries.len(),
                size = inner.total_size,
                "Cache budget enforced"
            );
        }
        Ok(())
    }

    /// Stores any serializable value.
    pub fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        class: TtlClass,
    ) -> Result<(), CacheWriteError> {
        let data =
            serde_json::to_value(value).map_err(|e| CacheWriteError::Serialize(e.to_string()))?;
        self.set(key, data, class)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Returns the live entry for `key`, bumping its recency and access count.
    ///
    /// An expired entry is removed and reported as a miss.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = Instant::now();
        let mut inner = self.lock();

        let expired = inner.entries.peek(key).map(|e| e.is_expired(now));
        match expired {
            None => {
                inner.misses += 1;
                None
            }
            Some(true) => {
                inner.remove(key);
                inner.misses += 1;
                None
            }
            Some(false) => {
                inner.hits += 1;
                let entry = inner.entries.get_mut(key)?;
                entry.access_count += 1;
                entry.last_accessed = now;
                Some(entry.clone())
            }
        }
    }

    /// Reads and deserializes a value stored with [`set_json`](Self::set_json).
    ///
    /// A value that no longer deserializes is treated as absent.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entry = self.get(key)?;
        match serde_json::from_value(entry.data) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Discarding undecodable cache entry");
                self.invalidate(key);
                None
            }
        }
    }

    /// Whether a live entry exists. Does not touch recency or hit counters.
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.lock();
        let expired = inner.entries.peek(key).map(|e| e.is_expired(now));
        match expired {
            Some(false) => true,
            Some(true) => {
                inner.remove(key);
                false
            }
            None => false,
        }
    }

    /// Resident entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========================================================================
    // Invalidation
    // ========================================================================

    /// Removes `key`. Returns whether it was present.
    pub fn invalidate(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Removes every key matching the glob `pattern` (`*`, `?`). Returns the
    /// number removed.
    pub fn invalidate_pattern(&self, pattern: &str) -> usize {
        let matcher = match KeyPattern::new(pattern) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "Invalid cache key pattern");
                return 0;
            }
        };

        let mut inner = self.lock();
        let keys: Vec<String> = inner
            .entries
            .iter()
            .filter(|(k, _)| matcher.matches(k))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            inner.remove(key);
        }

        tracing::debug!(pattern = %pattern, removed = keys.len(), "Cache pattern invalidated");
        keys.len()
    }

    /// Marks `key` as already expired; the next `get`/`has` sees a miss.
    /// Returns whether the key was present.
    pub fn refresh(&self, key: &str) -> bool {
        let mut inner = self.lock();
        match inner.entries.peek_mut(key) {
            Some(entry) => {
                entry.ttl = Duration::ZERO;
                true
            }
            None => false,
        }
    }

    /// Removes all expired entries now. Returns the number removed.
    pub fn cleanup(&self) -> usize {
        self.lock().remove_expired(Instant::now())
    }

    /// Removes every entry and resets hit/miss counters.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.total_size = 0;
        inner.hits = 0;
        inner.misses = 0;
    }

    // ========================================================================
    // Configuration & lifecycle
    // ========================================================================

    pub fn config(&self) -> CacheConfig {
        self.lock().config.clone()
    }

    /// Merges `update` into the live configuration.
    ///
    /// New TTLs apply to entries created afterwards. Smaller budgets are
    /// enforced immediately. A changed cleanup interval restarts the timer.
    pub fn configure(&self, update: CacheConfigUpdate) {
        let interval_changed = {
            let mut inner = self.lock();
            let changed = inner.config.merge(update);
            inner.enforce_budget(Instant::now());
            changed
        };
        if interval_changed {
            self.restart_timer();
        }
    }

    /// Stops the cleanup timer and drops all entries. Idempotent; later
    /// writes fail with [`CacheWriteError::Destroyed`].
    pub fn destroy(&self) {
        {
            let mut timer = self.lock_timer();
            if timer.destroyed {
                return;
            }
            timer.destroyed = true;
            if let Some(token) = timer.token.take() {
                token.cancel();
            }
        }
        self.clear();
        tracing::debug!("Validation cache destroyed");
    }

    fn restart_timer(&self) {
        let mut timer = self.lock_timer();
        if timer.destroyed {
            return;
        }
        if let Some(token) = timer.token.take() {
            token.cancel();
        }

        let interval = self.lock().config.cleanup_interval;
        if interval.is_zero() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("No Tokio runtime; cache cleanup timer not started");
            return;
        };

        let Some(first_tick) = Instant::now().checked_add(interval) else {
            tracing::debug!(
                interval_secs = interval.as_secs(),
                "Cleanup interval out of range; cache cleanup timer not started"
            );
            return;
        };

        let token = CancellationToken::new();
        let stop = token.clone();
        let me = self.me.clone();
        handle.spawn(async move {
            let mut ticker = tokio::time::interval_at(first_tick, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(cache) = me.upgrade() else { break };
                        let removed = cache.cleanup();
                        if removed > 0 {
                            tracing::debug!(removed = removed, "Expired cache entries swept");
                        }
                    }
                }
            }
        });
        timer.token = Some(token);
    }

    // ========================================================================
    // Stats
    // ========================================================================

    pub fn get_stats(&self) -> CacheStats {
        let inner = self.lock();

        let mut ttl_distribution = TtlDistribution::default();
        for (_, entry) in inner.entries.iter() {
            ttl_distribution.add(entry.class);
        }

        let lookups = inner.hits + inner.misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            (inner.hits as f64 / lookups as f64 * 10_000.0).round() / 100.0
        };

        CacheStats {
            total_entries: inner.entries.len(),
            total_size_bytes: inner.total_size,
            hit_count: inner.hits,
            miss_count: inner.misses,
            hit_rate,
            ttl_distribution,
            memory_usage: format_bytes(inner.total_size),
        }
    }
}

impl Drop for ValidationCache {
    fn drop(&mut self) {
        if let Some(token) = self.lock_timer().token.take() {
            token.cancel();
        }
    }
}
