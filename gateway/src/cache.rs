//! Hash-to-peers cache.
//!
//! A bounded TTL+LRU map from a blob digest to the set of upstream servers
//! known to hold the blob. Paths handed to the cache may carry a file
//! extension (`<digest>.mp4`); only the digest (first 64 characters) is used
//! as the key, so `<digest>` and `<digest>.ext` share a slot. Paths shorter
//! than 64 characters address nothing: every operation on them is a no-op.
//!
//! All operations run under one exclusive lock. Critical sections are O(1)
//! for the common path and O(n) only during eviction sweeps.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct CacheEntry {
    servers: Vec<String>,
    created_at: Instant,
    last_access: Instant,
}

struct CacheInner {
    items: HashMap<String, CacheEntry>,
}

/// Bounded TTL+LRU map from digest to the servers that hold the blob.
pub struct HashCache {
    inner: Mutex<CacheInner>,
    /// Entry lifetime measured from creation. Zero disables expiry.
    ttl: Duration,
    max_size: usize,
}

/// Extract the digest (first 64 characters) from a path.
/// Returns None for paths too short to contain one.
fn digest_key(path: &str) -> Option<&str> {
    path.get(..64)
}

impl HashCache {
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                items: HashMap::new(),
            }),
            ttl,
            max_size,
        }
    }

    /// Make room for one new entry: sweep every expired entry first, then
    /// fall back to evicting the entry with the oldest last access.
    fn evict_for_admission(&self, inner: &mut CacheInner, now: Instant) {
        if inner.items.len() < self.max_size {
            return;
        }

        if !self.ttl.is_zero() {
            let ttl = self.ttl;
            inner
                .items
                .retain(|_, entry| now.duration_since(entry.created_at) <= ttl);
        }

        if inner.items.len() >= self.max_size {
            if let Some(oldest) = inner
                .items
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(hash, _)| hash.clone())
            {
                inner.items.remove(&oldest);
            }
        }
    }

    /// Create or replace the mapping for a path. An empty server list
    /// removes the entry instead.
    pub fn add(&self, path: &str, servers: Vec<String>) {
        let Some(hash) = digest_key(path) else {
            return;
        };

        let mut inner = self.inner.lock();
        if servers.is_empty() {
            inner.items.remove(hash);
            return;
        }

        let now = Instant::now();
        if !inner.items.contains_key(hash) && inner.items.len() >= self.max_size {
            self.evict_for_admission(&mut inner, now);
        }

        let mut deduped: Vec<String> = Vec::with_capacity(servers.len());
        for server in servers {
            if !deduped.contains(&server) {
                deduped.push(server);
            }
        }

        inner.items.insert(
            hash.to_string(),
            CacheEntry {
                servers: deduped,
                created_at: now,
                last_access: now,
            },
        );
    }

    /// Current server list for a path. Expired entries are deleted on access
    /// and reported as absent.
    pub fn get(&self, path: &str) -> Option<Vec<String>> {
        let hash = digest_key(path)?;

        let mut inner = self.inner.lock();
        let now = Instant::now();
        let entry = inner.items.get_mut(hash)?;
        if !self.ttl.is_zero() && now.duration_since(entry.created_at) > self.ttl {
            inner.items.remove(hash);
            return None;
        }
        entry.last_access = now;
        Some(entry.servers.clone())
    }

    /// Add one server to a path's entry, creating the entry if absent.
    /// Idempotent: an already-listed server only refreshes last access.
    pub fn add_server(&self, path: &str, server: &str) {
        let Some(hash) = digest_key(path) else {
            return;
        };

        let mut inner = self.inner.lock();
        let now = Instant::now();

        if let Some(entry) = inner.items.get_mut(hash) {
            if !self.ttl.is_zero() && now.duration_since(entry.created_at) > self.ttl {
                // Expired: fall through and recreate below
            } else {
                if !entry.servers.iter().any(|s| s == server) {
                    entry.servers.push(server.to_string());
                }
                entry.last_access = now;
                return;
            }
        }

        // Absent or expired: start a fresh entry
        if !inner.items.contains_key(hash) && inner.items.len() >= self.max_size {
            self.evict_for_admission(&mut inner, now);
        }
        inner.items.insert(
            hash.to_string(),
            CacheEntry {
                servers: vec![server.to_string()],
                created_at: now,
                last_access: now,
            },
        );
    }

    /// Remove one server from a path's entry. Removing the last server
    /// removes the entry; expired entries are treated as absent.
    pub fn remove_server(&self, path: &str, server: &str) {
        let Some(hash) = digest_key(path) else {
            return;
        };

        let mut inner = self.inner.lock();
        let now = Instant::now();
        let Some(entry) = inner.items.get_mut(hash) else {
            return;
        };
        if !self.ttl.is_zero() && now.duration_since(entry.created_at) > self.ttl {
            inner.items.remove(hash);
            return;
        }

        entry.servers.retain(|s| s != server);
        if entry.servers.is_empty() {
            inner.items.remove(hash);
        } else {
            entry.last_access = now;
        }
    }

    /// Unconditional delete.
    pub fn remove(&self, path: &str) {
        let Some(hash) = digest_key(path) else {
            return;
        };
        self.inner.lock().items.remove(hash);
    }

    /// Number of live entries (expired-but-unswept entries included).
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
