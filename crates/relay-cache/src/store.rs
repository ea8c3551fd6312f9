//! Cache store facade.
//!
//! Routes operations to the configured backend while it is reachable and to
//! an in-process fallback map when it is not. Reachability is decided by a
//! cached probe so a flapping backend does not turn every cache call into a
//! network round-trip, and a transient latency spike does not fan out into
//! a thundering herd against the next tier.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::backend::{CacheBackend, MemoryBackend};

/// A cached lookup result with an explicit negative state.
///
/// `Unknown` means the cache has no opinion (never looked up, or entry
/// expired) and the caller must consult the source of truth. `Miss` means
/// the source of truth was consulted recently and had nothing; callers may
/// trust it until its (shorter) TTL lapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEntry<T> {
    /// Cached positive value
    Hit(T),
    /// Cached negative: the source had no value
    Miss,
    /// Not cached; consult the source
    Unknown,
}

/// On-wire envelope distinguishing positive from negative entries
#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    kind: EnvelopeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<T>,
}

#[derive(Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum EnvelopeKind {
    Hit,
    Miss,
}

#[derive(Debug, Clone, Copy)]
struct ProbeState {
    available: bool,
    checked_at: Instant,
}

/// Cache facade with probe-based fallback routing.
///
/// All operations are infallible from the caller's perspective: backend
/// errors are indistinguishable from misses, and writes degrade to no-ops.
/// Every caller is expected to tolerate cache absence.
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    fallback: MemoryBackend,
    probe: Mutex<Option<ProbeState>>,
    probe_positive_ttl: Duration,
    probe_negative_ttl: Duration,
}

impl CacheStore {
    /// Create a store over the given backend
    #[must_use]
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        probe_positive_ttl: Duration,
        probe_negative_ttl: Duration,
    ) -> Self {
        Self {
            backend,
            fallback: MemoryBackend::default(),
            probe: Mutex::new(None),
            probe_positive_ttl,
            probe_negative_ttl,
        }
    }

    /// Create a store backed purely by process memory
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryBackend::default()),
            Duration::from_secs(30),
            Duration::from_secs(5),
        )
    }

    /// Whether the backend is considered reachable, answered from a cached
    /// probe: positive results are trusted for ~30 s, negative for ~5 s.
    pub async fn probe_available(&self) -> bool {
        {
            let probe = self.probe.lock();
            if let Some(state) = *probe {
                let ttl = if state.available {
                    self.probe_positive_ttl
                } else {
                    self.probe_negative_ttl
                };
                if state.checked_at.elapsed() < ttl {
                    return state.available;
                }
            }
        }

        let available = self.backend.health_check().await.is_ok();
        if !available {
            debug!(backend = self.backend.name(), "Cache backend probe failed");
        }
        *self.probe.lock() = Some(ProbeState {
            available,
            checked_at: Instant::now(),
        });
        available
    }

    async fn active(&self) -> &dyn CacheBackend {
        if self.probe_available().await {
            self.backend.as_ref()
        } else {
            &self.fallback
        }
    }

    /// Get raw bytes. Errors and misses are both `None`.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        match self.active().await.get(key).await {
            Ok(value) => value,
            Err(e) => {
                debug!(key = %key, error = %e, "Cache read failed, treating as miss");
                None
            }
        }
    }

    /// Set raw bytes. Failures degrade silently to no-ops.
    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        if let Err(e) = self.active().await.set(key, value, ttl).await {
            debug!(key = %key, error = %e, "Cache write failed, dropping");
        }
    }

    /// Delete a key, best effort.
    pub async fn delete(&self, key: &str) {
        if let Err(e) = self.active().await.delete(key).await {
            debug!(key = %key, error = %e, "Cache delete failed");
        }
    }

    /// Increment a windowed counter. Returns `None` when the increment
    /// could not be performed anywhere.
    pub async fn incr_with_ttl(&self, key: &str, delta: i64, ttl: Duration) -> Option<i64> {
        match self.active().await.incr_with_ttl(key, delta, ttl).await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key, error = %e, "Cache counter increment failed");
                None
            }
        }
    }

    /// One page of a cursor-based key scan. Never enumerates the whole
    /// keyspace in a single call; large scans hold the backend hostage.
    pub async fn scan_prefix(&self, prefix: &str, cursor: u64, count: usize) -> (u64, Vec<String>) {
        match self.active().await.scan_prefix(prefix, cursor, count).await {
            Ok(page) => page,
            Err(e) => {
                debug!(prefix = %prefix, error = %e, "Cache scan failed");
                (0, Vec::new())
            }
        }
    }

    /// Get a typed entry, distinguishing cached negatives from absence.
    pub async fn get_entry<T: DeserializeOwned>(&self, key: &str) -> CacheEntry<T> {
        let Some(bytes) = self.get(key).await else {
            return CacheEntry::Unknown;
        };
        match serde_json::from_slice::<Envelope<T>>(&bytes) {
            Ok(Envelope {
                kind: EnvelopeKind::Hit,
                value: Some(value),
            }) => CacheEntry::Hit(value),
            Ok(Envelope {
                kind: EnvelopeKind::Miss,
                ..
            }) => CacheEntry::Miss,
            _ => {
                debug!(key = %key, "Undecodable cache entry, treating as unknown");
                CacheEntry::Unknown
            }
        }
    }

    /// Cache a typed positive entry
    pub async fn set_hit<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let envelope = Envelope {
            kind: EnvelopeKind::Hit,
            value: Some(value),
        };
        if let Ok(bytes) = serde_json::to_vec(&envelope) {
            self.set(key, bytes, ttl).await;
        }
    }

    /// Cache a negative entry
    pub async fn set_miss(&self, key: &str, ttl: Duration) {
        let envelope: Envelope<()> = Envelope {
            kind: EnvelopeKind::Miss,
            value: None,
        };
        if let Ok(bytes) = serde_json::to_vec(&envelope) {
            self.set(key, bytes, ttl).await;
        }
    }

    /// Name of the backend currently in use
    pub async fn backend_name(&self) -> &'static str {
        self.active().await.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CacheError, CacheResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Backend whose health can be flipped, counting health checks.
    struct FlakyBackend {
        healthy: AtomicBool,
        probes: AtomicU32,
        inner: MemoryBackend,
    }

    impl FlakyBackend {
        fn new(healthy: bool) -> Self {
            Self {
                healthy: AtomicBool::new(healthy),
                probes: AtomicU32::new(0),
                inner: MemoryBackend::default(),
            }
        }
    }

    #[async_trait]
    impl CacheBackend for FlakyBackend {
        async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()> {
            self.inner.set(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> CacheResult<()> {
            self.inner.delete(key).await
        }
        async fn incr_with_ttl(&self, key: &str, delta: i64, ttl: Duration) -> CacheResult<i64> {
            self.inner.incr_with_ttl(key, delta, ttl).await
        }
        async fn scan_prefix(
            &self,
            prefix: &str,
            cursor: u64,
            count: usize,
        ) -> CacheResult<(u64, Vec<String>)> {
            self.inner.scan_prefix(prefix, cursor, count).await
        }
        async fn health_check(&self) -> CacheResult<()> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(CacheError::Unavailable("down".to_string()))
            }
        }
        fn name(&self) -> &'static str {
            "flaky"
        }
        fn is_distributed(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn probe_result_is_cached() {
        let backend = Arc::new(FlakyBackend::new(true));
        let store = CacheStore::new(
            Arc::clone(&backend) as Arc<dyn CacheBackend>,
            Duration::from_secs(30),
            Duration::from_secs(5),
        );

        assert!(store.probe_available().await);
        assert!(store.probe_available().await);
        assert!(store.probe_available().await);
        // One network probe for three calls
        assert_eq!(backend.probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn falls_back_to_memory_when_backend_down() {
        let backend = Arc::new(FlakyBackend::new(false));
        let store = CacheStore::new(
            Arc::clone(&backend) as Arc<dyn CacheBackend>,
            Duration::from_secs(30),
            Duration::from_secs(5),
        );

        store.set("k", b"v".to_vec(), Duration::from_secs(60)).await;
        assert_eq!(store.get("k").await, Some(b"v".to_vec()));
        assert_eq!(store.backend_name().await, "memory");
    }

    #[tokio::test]
    async fn entry_states_are_distinct() {
        let store = CacheStore::in_memory();

        assert_eq!(store.get_entry::<String>("k").await, CacheEntry::Unknown);

        store.set_miss("k", Duration::from_secs(60)).await;
        assert_eq!(store.get_entry::<String>("k").await, CacheEntry::Miss);

        store
            .set_hit("k", &"value".to_string(), Duration::from_secs(60))
            .await;
        assert_eq!(
            store.get_entry::<String>("k").await,
            CacheEntry::Hit("value".to_string())
        );
    }
}
