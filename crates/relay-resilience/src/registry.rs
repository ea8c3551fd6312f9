//! Per-(provider, model) breaker registry.
//!
//! The in-process map is the authoritative copy. Snapshots are replicated
//! to the cache layer best-effort so other workers and the monitoring
//! surface see a warm picture; a worker that finds nothing in the cache
//! starts CLOSED.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use relay_cache::CacheStore;
use relay_config::BreakerConfig;
use relay_core::{ErrorKind, GatewayError};

use crate::circuit_breaker::CircuitBreaker;

const SNAPSHOT_TTL: Duration = Duration::from_secs(300);

/// Replicated breaker snapshot
#[derive(Debug, Serialize, Deserialize)]
struct BreakerSnapshot {
    state: String,
    consecutive_failures: u32,
    updated_at: i64,
}

/// Registry of circuit breakers keyed by (provider, model)
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<(String, String), Arc<CircuitBreaker>>,
    cache: Option<Arc<CacheStore>>,
}

impl BreakerRegistry {
    /// Create a registry with the given thresholds
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            cache: None,
        }
    }

    /// Enable best-effort snapshot replication to the cache layer
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Get or create the breaker for a (provider, model) pair
    pub fn get_or_create(&self, provider: &str, model: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self
            .breakers
            .get(&(provider.to_string(), model.to_string()))
        {
            return Arc::clone(&existing);
        }
        let breaker = Arc::new(CircuitBreaker::new(provider, model, self.config.clone()));
        self.breakers
            .entry((provider.to_string(), model.to_string()))
            .or_insert(breaker)
            .clone()
    }

    /// Gate a call against the pair's breaker.
    ///
    /// # Errors
    /// Returns `GatewayError::CircuitOpen` when the breaker denies the call.
    pub fn before_call(&self, provider: &str, model: &str) -> Result<(), GatewayError> {
        self.get_or_create(provider, model).before_call()
    }

    /// Record an outcome for the pair.
    ///
    /// Failures that say nothing about provider health (client errors,
    /// cancellations, content policy refusals) are ignored.
    pub async fn record_outcome(
        &self,
        provider: &str,
        model: &str,
        success: bool,
        kind: Option<ErrorKind>,
    ) {
        if !success && !kind.is_some_and(ErrorKind::counts_for_breaker) {
            debug!(
                provider = %provider,
                model = %model,
                kind = ?kind,
                "Skipping breaker update for non-provider failure"
            );
            return;
        }

        let breaker = self.get_or_create(provider, model);
        breaker.record_outcome(success);
        self.replicate(&breaker).await;
    }

    /// Whether the pair is currently admitting calls
    #[must_use]
    pub fn is_available(&self, provider: &str, model: &str) -> bool {
        // Peek without creating: an unknown pair is closed by definition
        self.breakers
            .get(&(provider.to_string(), model.to_string()))
            .map_or(true, |breaker| breaker.would_admit())
    }

    async fn replicate(&self, breaker: &CircuitBreaker) {
        let Some(cache) = &self.cache else { return };

        let snapshot = BreakerSnapshot {
            state: breaker.state().as_str().to_string(),
            consecutive_failures: breaker.consecutive_failures(),
            updated_at: chrono::Utc::now().timestamp(),
        };
        let key = format!("circuit:{}:{}", breaker.provider(), breaker.model());
        if let Ok(bytes) = serde_json::to_vec(&snapshot) {
            cache.set(&key, bytes, SNAPSHOT_TTL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> BreakerRegistry {
        BreakerRegistry::new(BreakerConfig {
            failure_threshold: 2,
            ..BreakerConfig::default()
        })
    }

    #[tokio::test]
    async fn client_errors_do_not_trip() {
        let registry = registry();
        for _ in 0..10 {
            registry
                .record_outcome("p", "m", false, Some(ErrorKind::Upstream4xxClient))
                .await;
            registry
                .record_outcome("p", "m", false, Some(ErrorKind::ContentPolicy))
                .await;
        }
        assert!(registry.before_call("p", "m").is_ok());
    }

    #[tokio::test]
    async fn server_errors_trip() {
        let registry = registry();
        registry
            .record_outcome("p", "m", false, Some(ErrorKind::Upstream5xx))
            .await;
        registry
            .record_outcome("p", "m", false, Some(ErrorKind::Timeout))
            .await;
        assert!(registry.before_call("p", "m").is_err());
    }

    #[tokio::test]
    async fn pairs_are_isolated() {
        let registry = registry();
        registry
            .record_outcome("p", "m1", false, Some(ErrorKind::Upstream5xx))
            .await;
        registry
            .record_outcome("p", "m1", false, Some(ErrorKind::Upstream5xx))
            .await;

        assert!(registry.before_call("p", "m1").is_err());
        assert!(registry.before_call("p", "m2").is_ok());
        assert!(registry.before_call("q", "m1").is_ok());
    }

    #[tokio::test]
    async fn unknown_pair_reads_available() {
        let registry = registry();
        assert!(registry.is_available("never", "seen"));
    }

    #[tokio::test]
    async fn snapshot_replicated_to_cache() {
        let cache = Arc::new(CacheStore::in_memory());
        let registry = BreakerRegistry::new(BreakerConfig::default()).with_cache(Arc::clone(&cache));

        registry
            .record_outcome("openrouter", "gpt-4", true, None)
            .await;

        let raw = cache.get("circuit:openrouter:gpt-4").await.expect("snapshot");
        let snapshot: serde_json::Value = serde_json::from_slice(&raw).expect("json");
        assert_eq!(snapshot["state"], "CLOSED");
    }
}
