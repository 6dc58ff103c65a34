//! Two-namespace TTL cache with optional disk snapshots.
//!
//! The `auth` namespace holds verified sessions and the `catalog` namespace
//! holds upstream response payloads. Each namespace is served by a
//! [`CacheBackend`]: [`MemoryOnly`] or [`MemoryWithSnapshot`]. A namespace
//! without a backend is disabled: every `get` misses and every `set` is
//! dropped.

mod memory;
mod snapshot;

pub use memory::MemoryOnly;
pub use snapshot::MemoryWithSnapshot;

use crate::config::Config;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Longest TTL honoured; longer values are clamped.
const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Cache namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Verified sessions keyed by credential fingerprint.
    Auth,
    /// Upstream response payloads keyed by request digest.
    Catalog,
}

impl Namespace {
    /// Both namespaces.
    pub const ALL: [Namespace; 2] = [Namespace::Auth, Namespace::Catalog];

    /// Name used in logs and snapshot file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Auth => "auth",
            Namespace::Catalog => "catalog",
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cached value with its expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Entry key.
    pub key: String,
    /// Opaque serialized payload.
    pub value: serde_json::Value,
    /// When the entry was written.
    pub stored_at: DateTime<Utc>,
    /// When the entry stops being served.
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Create an entry stored now and expiring after `ttl`.
    pub fn new(key: impl Into<String>, value: serde_json::Value, ttl: Duration) -> Self {
        let stored_at = Utc::now();
        let ttl = chrono::Duration::from_std(ttl.min(MAX_TTL)).unwrap_or(chrono::Duration::zero());

        Self {
            key: key.into(),
            value,
            stored_at,
            expires_at: stored_at + ttl,
        }
    }

    /// Whether the entry is expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether the entry is expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Storage strategy for one namespace.
///
/// Implementations must be safe for concurrent use and must never return an
/// expired entry from [`get`](CacheBackend::get).
pub trait CacheBackend: Send + Sync {
    /// Unexpired entry for `key`.
    fn get(&self, key: &str) -> Option<CacheEntry>;

    /// Insert or replace an entry.
    fn set(&self, entry: CacheEntry);

    /// Remove `key`, returning whether it was present.
    fn remove(&self, key: &str) -> bool;

    /// Remove every entry.
    fn clear(&self);

    /// Drop expired entries, returning how many were removed.
    fn sweep(&self) -> usize;

    /// Number of stored entries, expired or not.
    fn len(&self) -> usize;

    /// Whether the backend holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Entries in the auth namespace.
    pub auth_entries: usize,
    /// Entries in the catalog namespace.
    pub catalog_entries: usize,
    /// Lookups served from cache.
    pub hits: u64,
    /// Lookups that missed.
    pub misses: u64,
}

/// Cache shared by the auth resolver and the upstream client.
pub struct Cache {
    auth: Option<Box<dyn CacheBackend>>,
    catalog: Option<Box<dyn CacheBackend>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Cache {
    /// Create a cache from explicit backends (`None` disables a namespace).
    pub fn new(
        auth: Option<Box<dyn CacheBackend>>,
        catalog: Option<Box<dyn CacheBackend>>,
    ) -> Self {
        Self {
            auth,
            catalog,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// In-memory cache with both namespaces enabled.
    pub fn in_memory() -> Self {
        Self::new(
            Some(Box::new(MemoryOnly::new())),
            Some(Box::new(MemoryOnly::new())),
        )
    }

    /// Cache with both namespaces disabled.
    pub fn disabled() -> Self {
        Self::new(None, None)
    }

    /// Select backends from configuration, loading snapshots when persistence is on.
    pub fn from_config(config: &Config) -> Result<Self> {
        let auth = if config.auth.token_cache {
            Some(Self::backend(
                config,
                Namespace::Auth,
                config.cache.persist && config.auth.persist_sessions,
            )?)
        } else {
            None
        };

        let catalog = if config.cache.enabled {
            Some(Self::backend(config, Namespace::Catalog, config.cache.persist)?)
        } else {
            None
        };

        tracing::info!(
            auth = auth.is_some(),
            catalog = catalog.is_some(),
            persist = config.cache.persist,
            "Cache configured"
        );

        Ok(Self::new(auth, catalog))
    }

    fn backend(
        config: &Config,
        namespace: Namespace,
        persist: bool,
    ) -> Result<Box<dyn CacheBackend>> {
        if persist {
            let path = snapshot_path(&config.cache.dir, namespace);
            Ok(Box::new(MemoryWithSnapshot::open(path)?))
        } else {
            Ok(Box::new(MemoryOnly::new()))
        }
    }

    fn store(&self, namespace: Namespace) -> Option<&dyn CacheBackend> {
        match namespace {
            Namespace::Auth => self.auth.as_deref(),
            Namespace::Catalog => self.catalog.as_deref(),
        }
    }

    /// Whether `namespace` has a backend.
    pub fn is_enabled(&self, namespace: Namespace) -> bool {
        self.store(namespace).is_some()
    }

    /// Unexpired value for `key`.
    pub fn get(&self, namespace: Namespace, key: &str) -> Option<serde_json::Value> {
        let found = self
            .store(namespace)
            .and_then(|store| store.get(key))
            .map(|entry| entry.value);

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Unexpired value for `key`, decoded as `T`.
    ///
    /// A payload that no longer decodes is dropped and reported as a miss.
    pub fn get_as<T: DeserializeOwned>(&self, namespace: Namespace, key: &str) -> Option<T> {
        let value = self.get(namespace, key)?;
        match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                tracing::warn!(namespace = %namespace, error = %e, "Dropping undecodable cache entry");
                self.invalidate(namespace, key);
                None
            }
        }
    }

    /// Store `value` under `key` for `ttl`. A zero TTL stores nothing.
    pub fn set(&self, namespace: Namespace, key: &str, value: serde_json::Value, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        if let Some(store) = self.store(namespace) {
            store.set(CacheEntry::new(key, value, ttl));
        }
    }

    /// Serialize and store `value` under `key` for `ttl`.
    pub fn set_as<T: Serialize>(&self, namespace: Namespace, key: &str, value: &T, ttl: Duration) {
        if !self.is_enabled(namespace) || ttl.is_zero() {
            return;
        }
        match serde_json::to_value(value) {
            Ok(value) => self.set(namespace, key, value, ttl),
            Err(e) => {
                tracing::warn!(namespace = %namespace, error = %e, "Failed to serialize cache entry");
            }
        }
    }

    /// Remove `key`, returning whether it was present.
    pub fn invalidate(&self, namespace: Namespace, key: &str) -> bool {
        self.store(namespace)
            .map(|store| store.remove(key))
            .unwrap_or(false)
    }

    /// Remove every entry of `namespace`.
    pub fn clear(&self, namespace: Namespace) {
        if let Some(store) = self.store(namespace) {
            store.clear();
        }
    }

    /// Drop expired entries in both namespaces.
    pub fn sweep(&self) -> usize {
        Namespace::ALL
            .iter()
            .filter_map(|ns| self.store(*ns))
            .map(|store| store.sweep())
            .sum()
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            auth_entries: self.store(Namespace::Auth).map_or(0, |s| s.len()),
            catalog_entries: self.store(Namespace::Catalog).map_or(0, |s| s.len()),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot file of `namespace` inside `dir`.
pub fn snapshot_path(dir: &std::path::Path, namespace: Namespace) -> std::path::PathBuf {
    dir.join(format!("{}.jsonl", namespace.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_then_get() {
        let cache = Cache::in_memory();
        cache.set(Namespace::Catalog, "k", json!({"a": 1}), Duration::from_secs(60));

        assert_eq!(cache.get(Namespace::Catalog, "k"), Some(json!({"a": 1})));
        assert_eq!(cache.get(Namespace::Auth, "k"), None);
    }

    #[test]
    fn zero_ttl_is_never_written() {
        let cache = Cache::in_memory();
        cache.set(Namespace::Catalog, "k", json!(1), Duration::ZERO);

        assert_eq!(cache.stats().catalog_entries, 0);
        assert!(cache.get(Namespace::Catalog, "k").is_none());
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = Cache::in_memory();
        cache.set(Namespace::Auth, "fp", json!("s"), Duration::from_secs(60));

        assert!(cache.invalidate(Namespace::Auth, "fp"));
        assert!(!cache.invalidate(Namespace::Auth, "fp"));
        assert!(cache.get(Namespace::Auth, "fp").is_none());
    }

    #[test]
    fn disabled_namespace_always_misses() {
        let cache = Cache::new(Some(Box::new(MemoryOnly::new())), None);
        cache.set(Namespace::Catalog, "k", json!(1), Duration::from_secs(60));

        assert!(!cache.is_enabled(Namespace::Catalog));
        assert!(cache.get(Namespace::Catalog, "k").is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn get_as_drops_undecodable_entries() {
        let cache = Cache::in_memory();
        cache.set(Namespace::Catalog, "k", json!("not a number"), Duration::from_secs(60));

        assert_eq!(cache.get_as::<u32>(Namespace::Catalog, "k"), None);
        assert_eq!(cache.stats().catalog_entries, 0);
    }

    #[test]
    fn counts_hits_and_misses() {
        let cache = Cache::in_memory();
        cache.set(Namespace::Catalog, "k", json!(1), Duration::from_secs(60));
        cache.get(Namespace::Catalog, "k");
        cache.get(Namespace::Catalog, "missing");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn from_config_respects_switches() {
        let mut config = Config::default();
        config.cache.enabled = false;
        config.auth.token_cache = true;

        let cache = Cache::from_config(&config).unwrap();
        assert!(cache.is_enabled(Namespace::Auth));
        assert!(!cache.is_enabled(Namespace::Catalog));
    }

    #[test]
    fn entry_expiry() {
        let entry = CacheEntry::new("k", json!(null), Duration::from_secs(60));
        assert!(!entry.is_expired());
        assert!(entry.is_expired_at(entry.expires_at));
    }
}
