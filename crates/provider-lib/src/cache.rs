//! Per-key TTL cache
//!
//! Backs the per-pod caches (cumulative usage, container-group lookups,
//! previous realtime polls). Entries expire `ttl` after their last write and
//! are evicted lazily on read or in bulk by `purge_expired`.

use crate::clock::Clock;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use tracing::debug;

struct Entry<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

pub struct TtlCache<K, V> {
    name: &'static str,
    entries: DashMap<K, Entry<V>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(name: &'static str, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            ttl,
            clock,
        }
    }

    /// Get a live entry, dropping it if it has expired
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Some(entry.value.clone());
            }
        }

        if self
            .entries
            .remove_if(key, |_, entry| entry.expires_at <= now)
            .is_some()
        {
            debug!(cache = self.name, "Evicted expired cache entry");
        }
        None
    }

    /// Insert or replace an entry, restarting its TTL
    pub fn set(&self, key: K, value: V) {
        let expires_at = self.clock.now() + self.ttl;
        self.entries.insert(key, Entry { value, expires_at });
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(cache = self.name, removed, "Purged expired cache entries");
        }
        removed
    }

    /// Number of stored entries, including ones not yet evicted
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn cache_with_clock(ttl_minutes: i64) -> (TtlCache<String, u64>, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let cache = TtlCache::new("test", Duration::minutes(ttl_minutes), Arc::new(clock.clone()));
        (cache, clock)
    }

    #[test]
    fn test_get_before_expiry() {
        let (cache, clock) = cache_with_clock(5);
        cache.set("pod-a".to_string(), 42);

        clock.advance(Duration::minutes(4));
        assert_eq!(cache.get(&"pod-a".to_string()), Some(42));
    }

    #[test]
    fn test_entry_expires_after_ttl() {
        let (cache, clock) = cache_with_clock(5);
        cache.set("pod-a".to_string(), 42);

        clock.advance(Duration::minutes(5));
        assert_eq!(cache.get(&"pod-a".to_string()), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_set_restarts_ttl() {
        let (cache, clock) = cache_with_clock(5);
        cache.set("pod-a".to_string(), 1);
        clock.advance(Duration::minutes(4));
        cache.set("pod-a".to_string(), 2);
        clock.advance(Duration::minutes(4));

        assert_eq!(cache.get(&"pod-a".to_string()), Some(2));
    }

    #[test]
    fn test_purge_expired() {
        let (cache, clock) = cache_with_clock(5);
        cache.set("old".to_string(), 1);
        clock.advance(Duration::minutes(3));
        cache.set("new".to_string(), 2);
        clock.advance(Duration::minutes(3));

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"new".to_string()), Some(2));
    }
}
