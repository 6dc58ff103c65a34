//! In-memory cache backend.

use super::{CacheBackend, CacheEntry};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Writes between opportunistic sweeps.
const SWEEP_EVERY: usize = 256;

/// Process-local map of entries, lost at shutdown.
#[derive(Default)]
pub struct MemoryOnly {
    entries: RwLock<HashMap<String, CacheEntry>>,
    writes: AtomicUsize,
}

impl MemoryOnly {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend seeded with `entries`.
    pub(crate) fn with_entries(entries: HashMap<String, CacheEntry>) -> Self {
        Self {
            entries: RwLock::new(entries),
            writes: AtomicUsize::new(0),
        }
    }

    /// Clone of every unexpired entry.
    pub(crate) fn live_entries(&self) -> Vec<CacheEntry> {
        let now = Utc::now();
        self.entries
            .read()
            .values()
            .filter(|e| !e.is_expired_at(now))
            .cloned()
            .collect()
    }
}

impl CacheBackend for MemoryOnly {
    fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = Utc::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if !entry.is_expired_at(now) => return Some(entry.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        let mut entries = self.entries.write();
        if entries.get(key).is_some_and(|e| e.is_expired_at(now)) {
            entries.remove(key);
        }
        None
    }

    fn set(&self, entry: CacheEntry) {
        self.entries.write().insert(entry.key.clone(), entry);

        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_EVERY == 0 {
            self.sweep();
        }
    }

    fn remove(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    fn clear(&self) {
        self.entries.write().clear();
    }

    fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired_at(now));
        before - entries.len()
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn expired(key: &str) -> CacheEntry {
        let mut entry = CacheEntry::new(key, json!(key), Duration::from_secs(60));
        entry.expires_at = entry.stored_at - chrono::Duration::seconds(1);
        entry
    }

    #[test]
    fn expired_entries_are_not_served() {
        let backend = MemoryOnly::new();
        backend.set(expired("old"));

        assert!(backend.get("old").is_none());
        assert_eq!(backend.len(), 0);
    }

    #[test]
    fn sweep_counts_removed_entries() {
        let backend = MemoryOnly::new();
        backend.set(expired("a"));
        backend.set(expired("b"));
        backend.set(CacheEntry::new("c", json!(1), Duration::from_secs(60)));

        assert_eq!(backend.sweep(), 2);
        assert_eq!(backend.len(), 1);
        assert!(backend.get("c").is_some());
    }

    #[test]
    fn writes_trigger_opportunistic_sweep() {
        let backend = MemoryOnly::new();
        backend.set(expired("stale"));
        for i in 1..SWEEP_EVERY {
            backend.set(CacheEntry::new(format!("k{i}"), json!(i), Duration::from_secs(60)));
        }

        assert_eq!(backend.len(), SWEEP_EVERY - 1);
    }

    #[test]
    fn set_replaces_existing_key() {
        let backend = MemoryOnly::new();
        backend.set(CacheEntry::new("k", json!(1), Duration::from_secs(60)));
        backend.set(CacheEntry::new("k", json!(2), Duration::from_secs(60)));

        assert_eq!(backend.len(), 1);
        assert_eq!(backend.get("k").map(|e| e.value), Some(json!(2)));
    }
}
