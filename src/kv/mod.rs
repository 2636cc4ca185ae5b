//! TTL key-value interface for ephemeral flow state.
//!
//! Pending authorizations and CSRF tokens live behind this trait so the
//! in-memory backing can be swapped for a shared store (e.g. Redis)
//! without touching the flow logic. Per-key operations are atomic within
//! one process; the read-then-delete sequences built on top are a known
//! check-then-act gap for multi-instance deployments.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

/// Key-value store with per-entry expiry.
pub trait KvStore: Send + Sync {
    /// Inserts or overwrites a value with a time-to-live.
    fn put(&self, key: &str, value: &str, ttl: Duration);

    /// Returns the value if present and not expired.
    fn get(&self, key: &str) -> Option<String>;

    /// Removes and returns the value if present and not expired.
    /// An expired entry is removed but not returned.
    fn take(&self, key: &str) -> Option<String>;

    /// Removes an entry. Returns true if something was removed.
    fn remove(&self, key: &str) -> bool;

    /// Drops expired entries. Returns how many were removed.
    fn purge_expired(&self) -> usize;
}

struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// In-memory TTL store.
///
/// Entries are dropped lazily on access and in bulk by `purge_expired`,
/// which the host invokes from a periodic cleanup task.
#[derive(Default)]
pub struct MemoryKv {
    entries: DashMap<String, Entry>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Number of live (possibly expired but not yet purged) entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KvStore for MemoryKv {
    fn put(&self, key: &str, value: &str, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Utc::now() + ttl,
            },
        );
    }

    fn get(&self, key: &str) -> Option<String> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > Utc::now() => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    fn take(&self, key: &str) -> Option<String> {
        let (_, entry) = self.entries.remove(key)?;
        if entry.expires_at > Utc::now() {
            Some(entry.value)
        } else {
            None
        }
    }

    fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_roundtrip() {
        let kv = MemoryKv::new();
        kv.put("k", "v", Duration::minutes(5));
        assert_eq!(kv.get("k"), Some("v".to_string()));
    }

    #[test]
    fn test_put_overwrites() {
        let kv = MemoryKv::new();
        kv.put("k", "first", Duration::minutes(5));
        kv.put("k", "second", Duration::minutes(5));
        assert_eq!(kv.get("k"), Some("second".to_string()));
        assert_eq!(kv.len(), 1);
    }

    #[test]
    fn test_take_is_single_shot() {
        let kv = MemoryKv::new();
        kv.put("k", "v", Duration::minutes(5));

        assert_eq!(kv.take("k"), Some("v".to_string()));
        assert_eq!(kv.take("k"), None);
        assert_eq!(kv.get("k"), None);
    }

    #[test]
    fn test_expired_entry_not_returned() {
        let kv = MemoryKv::new();
        kv.put("k", "v", Duration::seconds(-1));

        assert_eq!(kv.get("k"), None);

        kv.put("k2", "v", Duration::seconds(-1));
        assert_eq!(kv.take("k2"), None);
    }

    #[test]
    fn test_purge_expired() {
        let kv = MemoryKv::new();
        kv.put("live", "v", Duration::minutes(5));
        kv.put("dead1", "v", Duration::seconds(-1));
        kv.put("dead2", "v", Duration::seconds(-1));

        assert_eq!(kv.purge_expired(), 2);
        assert_eq!(kv.len(), 1);
        assert_eq!(kv.get("live"), Some("v".to_string()));
    }

    #[test]
    fn test_remove() {
        let kv = MemoryKv::new();
        kv.put("k", "v", Duration::minutes(5));
        assert!(kv.remove("k"));
        assert!(!kv.remove("k"));
    }
}
