//! In-memory TTL cache for gateway aggregates.
//!
//! Two read paths:
//! - [`ResponseCache::get_fresh`] never returns an expired value; touching an
//!   expired entry evicts it.
//! - [`ResponseCache::get_even_if_stale`] is the explicit degraded read used
//!   when Telegram is unavailable. Entries evicted by expiry are kept in a
//!   last-known-good slot for it; explicit deletes and invalidations drop them
//!   from both places.
//!
//! [`ResponseCache::expire_prefix`] sits in between: matching entries stop
//! being fresh but stay available to degraded reads.

use std::{
    collections::HashMap,
    fmt,
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant},
};

use crate::{
    domain::{ChatId, UserId},
    telemetry,
};

pub const DEFAULT_CAPACITY: usize = 1024;

/// Namespaced cache keys. Every rendered key starts with `{namespace}:`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Chats a user may administer.
    Chats { user: UserId },
    /// Administrators of one chat, as requested by one user.
    Members { chat: ChatId, user: UserId },
}

impl CacheKey {
    pub const CHATS_NAMESPACE: &'static str = "chats:";
    pub const MEMBERS_NAMESPACE: &'static str = "members:";

    /// Prefix matching every member listing of `chat`, whoever requested it.
    pub fn members_prefix(chat: ChatId) -> String {
        format!("{}{}:", Self::MEMBERS_NAMESPACE, chat.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Chats { user } => write!(f, "{}{}", Self::CHATS_NAMESPACE, user.0),
            CacheKey::Members { chat, user } => {
                write!(f, "{}{}:{}", Self::MEMBERS_NAMESPACE, chat.0, user.0)
            }
        }
    }
}

#[derive(Clone, Debug)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn expires_at(&self) -> Instant {
        self.created_at + self.ttl
    }

    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at()
    }
}

/// Result of a degraded read.
#[derive(Clone, Debug, PartialEq)]
pub struct StaleRead<V> {
    pub value: V,
    pub age: Duration,
    pub expired: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub total: usize,
    pub active: usize,
    pub expired: usize,
}

struct Inner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    last_good: HashMap<String, CacheEntry<V>>,
}

impl<V> Inner<V> {
    fn publish_size(&self) {
        telemetry::record_cache_size(self.entries.len(), self.last_good.len());
    }
}

pub struct ResponseCache<V> {
    capacity: usize,
    inner: Mutex<Inner<V>>,
}

impl<V: Clone> Default for ResponseCache<V> {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl<V: Clone> ResponseCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache holding at most `capacity` live entries (and as many stale ones).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                last_good: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<V>> {
        // A panic while holding the lock cannot leave the maps half-updated in a
        // way that matters for a cache; keep serving.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get_fresh(&self, key: &str) -> Option<V> {
        self.get_fresh_at(key, Instant::now())
    }

    pub fn get_fresh_at(&self, key: &str, now: Instant) -> Option<V> {
        let mut inner = self.lock();
        let Some(expired) = inner.entries.get(key).map(|e| e.is_expired(now)) else {
            telemetry::record_cache("get", "miss");
            return None;
        };
        if !expired {
            telemetry::record_cache("get", "hit");
            return inner.entries.get(key).map(|e| e.value.clone());
        }

        telemetry::record_cache("get", "expired");
        if let Some(entry) = inner.entries.remove(key) {
            tracing::debug!(key, "cache entry expired");
            let capacity = self.capacity;
            insert_bounded(&mut inner.last_good, key.to_string(), entry, capacity);
            inner.publish_size();
        }
        None
    }

    pub fn get_even_if_stale(&self, key: &str) -> Option<StaleRead<V>> {
        self.get_even_if_stale_at(key, Instant::now())
    }

    pub fn get_even_if_stale_at(&self, key: &str, now: Instant) -> Option<StaleRead<V>> {
        let inner = self.lock();
        let Some(entry) = inner.entries.get(key).or_else(|| inner.last_good.get(key)) else {
            telemetry::record_cache("get_stale", "miss");
            return None;
        };
        telemetry::record_cache("get_stale", "hit");
        Some(StaleRead {
            value: entry.value.clone(),
            age: now.saturating_duration_since(entry.created_at),
            expired: entry.is_expired(now),
        })
    }

    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        self.set_at(key, value, ttl, Instant::now());
    }

    pub fn set_at(&self, key: impl Into<String>, value: V, ttl: Duration, now: Instant) {
        let key = key.into();
        let mut inner = self.lock();
        inner.last_good.remove(&key);
        let entry = CacheEntry {
            value,
            created_at: now,
            ttl,
        };
        tracing::debug!(key = %key, ttl_secs = ttl.as_secs(), "cache entry stored");
        let capacity = self.capacity;
        insert_bounded(&mut inner.entries, key, entry, capacity);
        telemetry::record_cache("set", "ok");
        inner.publish_size();
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.lock();
        let live = inner.entries.remove(key).is_some();
        let stale = inner.last_good.remove(key).is_some();
        let found = live || stale;
        telemetry::record_cache("delete", if found { "hit" } else { "miss" });
        inner.publish_size();
        found
    }

    /// Drop every key starting with `prefix`; returns how many live entries went.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|k, _| !k.starts_with(prefix));
        inner.last_good.retain(|k, _| !k.starts_with(prefix));
        let removed = before - inner.entries.len();
        if removed > 0 {
            tracing::debug!(prefix, removed, "cache entries invalidated");
        }
        telemetry::record_cache("invalidate", "ok");
        inner.publish_size();
        removed
    }

    /// Retire every live key starting with `prefix` to the last-known-good
    /// slot: strict reads miss, degraded reads still see the old value.
    pub fn expire_prefix(&self, prefix: &str) -> usize {
        let mut inner = self.lock();
        let keys: Vec<String> = inner
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        let capacity = self.capacity;
        for key in &keys {
            if let Some(entry) = inner.entries.remove(key) {
                insert_bounded(&mut inner.last_good, key.clone(), entry, capacity);
            }
        }
        if !keys.is_empty() {
            tracing::debug!(prefix, expired = keys.len(), "cache entries expired early");
        }
        telemetry::record_cache("expire", "ok");
        inner.publish_size();
        keys.len()
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.last_good.clear();
        inner.publish_size();
    }

    pub fn stats(&self) -> CacheStats {
        self.stats_at(Instant::now())
    }

    pub fn stats_at(&self, now: Instant) -> CacheStats {
        let inner = self.lock();
        let total = inner.entries.len();
        let expired = inner
            .entries
            .values()
            .filter(|e| e.is_expired(now))
            .count();
        CacheStats {
            total,
            active: total - expired,
            expired,
        }
    }

    /// Move every expired live entry to the last-known-good slot.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub fn purge_expired_at(&self, now: Instant) -> usize {
        let mut inner = self.lock();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        let capacity = self.capacity;
        for key in &expired {
            if let Some(entry) = inner.entries.remove(key) {
                insert_bounded(&mut inner.last_good, key.clone(), entry, capacity);
            }
        }
        inner.publish_size();
        expired.len()
    }
}

/// Insert, evicting the oldest entry first when a new key would exceed `capacity`.
fn insert_bounded<V>(
    map: &mut HashMap<String, CacheEntry<V>>,
    key: String,
    entry: CacheEntry<V>,
    capacity: usize,
) {
    if !map.contains_key(&key) && map.len() >= capacity {
        let oldest = map
            .iter()
            .min_by_key(|(_, e)| e.created_at)
            .map(|(k, _)| k.clone());
        if let Some(oldest) = oldest {
            map.remove(&oldest);
        }
    }
    map.insert(key, entry);
}
