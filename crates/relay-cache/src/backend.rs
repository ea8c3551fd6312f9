//! Cache backend abstraction.
//!
//! Backends are deliberately dumb: bytes in, bytes out, TTL semantics, and
//! a cursor-based scan. Anything smarter (negative entries, probe caching,
//! fallback routing) lives in the [`crate::store`] facade.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// Error types for cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    /// Backend unreachable
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    /// Value could not be encoded or decoded
    #[error("cache serialization error: {0}")]
    Serialization(String),

    /// Operation timed out
    #[error("cache operation timeout after {0:?}")]
    Timeout(Duration),
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache backend trait for polymorphic cache implementations
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get a value from the cache
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Set a value in the cache with TTL
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()>;

    /// Delete a key from the cache
    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Increment a counter, setting the TTL on first write. Returns the new
    /// value.
    async fn incr_with_ttl(&self, key: &str, delta: i64, ttl: Duration) -> CacheResult<i64>;

    /// Cursor-based scan of keys with a prefix. Returns the next cursor
    /// (0 when exhausted) and a batch of keys. Full-keyspace enumeration in
    /// one call is intentionally not offered; it blocks shared backends.
    async fn scan_prefix(
        &self,
        prefix: &str,
        cursor: u64,
        count: usize,
    ) -> CacheResult<(u64, Vec<String>)>;

    /// Check if the backend is reachable
    async fn health_check(&self) -> CacheResult<()>;

    /// Backend name for logs and metrics
    fn name(&self) -> &'static str;

    /// Whether the backend is shared across gateway processes
    fn is_distributed(&self) -> bool;
}

#[derive(Debug, Clone)]
enum Stored {
    Bytes(Vec<u8>),
    Counter(i64),
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Stored,
    expires_at: Instant,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-memory cache backend with best-effort eviction.
///
/// Used standalone in single-instance deployments and as the degradation
/// target when a distributed backend is unreachable.
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, MemoryEntry>>,
    capacity: usize,
}

impl MemoryBackend {
    /// Create a backend bounded to `capacity` entries
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Drop expired entries; if still over capacity, drop arbitrary entries
    /// until under it. Best effort only.
    fn evict(entries: &mut HashMap<String, MemoryEntry>, capacity: usize) {
        let now = Instant::now();
        entries.retain(|_, entry| !entry.is_expired(now));

        if entries.len() >= capacity {
            let overflow = entries.len() + 1 - capacity;
            let victims: Vec<String> = entries.keys().take(overflow).cloned().collect();
            for key in victims {
                entries.remove(&key);
            }
            debug!(evicted = overflow, "Memory cache over capacity, evicted entries");
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let entries = self.entries.read().await;
        let now = Instant::now();
        Ok(entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .and_then(|entry| match &entry.value {
                Stored::Bytes(bytes) => Some(bytes.clone()),
                Stored::Counter(n) => Some(n.to_string().into_bytes()),
            }))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()> {
        let mut entries = self.entries.write().await;
        Self::evict(&mut entries, self.capacity);
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: Stored::Bytes(value),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn incr_with_ttl(&self, key: &str, delta: i64, ttl: Duration) -> CacheResult<i64> {
        let mut entries = self.entries.write().await;
        Self::evict(&mut entries, self.capacity);
        let now = Instant::now();

        let current = entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .and_then(|entry| match &entry.value {
                Stored::Counter(n) => Some(*n),
                Stored::Bytes(bytes) => std::str::from_utf8(bytes).ok()?.parse().ok(),
            })
            .unwrap_or(0);

        let next = current + delta;
        // TTL is set on first write and refreshed thereafter; counters are
        // short-lived window keys either way.
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: Stored::Counter(next),
                expires_at: now + ttl,
            },
        );
        Ok(next)
    }

    async fn scan_prefix(
        &self,
        prefix: &str,
        cursor: u64,
        count: usize,
    ) -> CacheResult<(u64, Vec<String>)> {
        let entries = self.entries.read().await;
        let now = Instant::now();
        let mut matching: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        matching.sort();

        let start = cursor as usize;
        let batch: Vec<String> = matching.iter().skip(start).take(count).cloned().collect();
        let next = start + batch.len();
        let next_cursor = if next >= matching.len() { 0 } else { next as u64 };
        Ok((next_cursor, batch))
    }

    async fn health_check(&self) -> CacheResult<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    fn is_distributed(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete() {
        let backend = MemoryBackend::default();
        backend
            .set("k", b"v".to_vec(), Duration::from_secs(60))
            .await
            .expect("set");
        assert_eq!(backend.get("k").await.expect("get"), Some(b"v".to_vec()));

        backend.delete("k").await.expect("delete");
        assert_eq!(backend.get("k").await.expect("get"), None);
    }

    #[tokio::test]
    async fn expired_entries_are_absent() {
        let backend = MemoryBackend::default();
        backend
            .set("k", b"v".to_vec(), Duration::from_millis(10))
            .await
            .expect("set");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(backend.get("k").await.expect("get"), None);
    }

    #[tokio::test]
    async fn counter_increments_and_expires() {
        let backend = MemoryBackend::default();
        let ttl = Duration::from_secs(60);
        assert_eq!(backend.incr_with_ttl("c", 1, ttl).await.expect("incr"), 1);
        assert_eq!(backend.incr_with_ttl("c", 1, ttl).await.expect("incr"), 2);
        assert_eq!(backend.incr_with_ttl("c", 3, ttl).await.expect("incr"), 5);
    }

    #[tokio::test]
    async fn capacity_eviction() {
        let backend = MemoryBackend::new(4);
        for i in 0..10 {
            backend
                .set(&format!("k{i}"), vec![0], Duration::from_secs(60))
                .await
                .expect("set");
        }
        let entries = backend.entries.read().await;
        assert!(entries.len() <= 4);
    }

    #[tokio::test]
    async fn scan_is_cursor_based() {
        let backend = MemoryBackend::default();
        for i in 0..5 {
            backend
                .set(&format!("pre:{i}"), vec![0], Duration::from_secs(60))
                .await
                .expect("set");
        }
        backend
            .set("other", vec![0], Duration::from_secs(60))
            .await
            .expect("set");

        let (cursor, batch) = backend.scan_prefix("pre:", 0, 2).await.expect("scan");
        assert_eq!(batch.len(), 2);
        assert_ne!(cursor, 0);

        let (cursor, batch) = backend.scan_prefix("pre:", cursor, 10).await.expect("scan");
        assert_eq!(batch.len(), 3);
        assert_eq!(cursor, 0);
    }
}
