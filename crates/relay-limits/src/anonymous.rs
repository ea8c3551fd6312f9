//! Anonymous (unauthenticated) request limiting.
//!
//! Requests without an API key are allowed limited access for demos and
//! evaluations: only whitelisted free models, and a small per-IP daily
//! quota. The IP is one-way hashed before it is used as a counter key.

use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use relay_cache::CacheStore;
use relay_config::AnonymousConfig;

const COUNTER_TTL: Duration = Duration::from_secs(86_400);

/// Aggregate anonymous usage, for the monitoring surface
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct AnonymousStats {
    /// Distinct IPs seen today
    pub unique_ips_today: u64,
    /// Total anonymous requests today
    pub total_requests_today: u64,
}

/// Outcome of an anonymous admission check
#[derive(Debug, Clone)]
pub struct AnonymousDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests left today for this IP
    pub remaining: u32,
    /// The daily limit
    pub limit: u32,
    /// Denial reason, when denied
    pub reason: Option<String>,
}

/// Per-IP daily limiter for anonymous requests
pub struct AnonymousLimiter {
    cache: Arc<CacheStore>,
    config: AnonymousConfig,
}

impl AnonymousLimiter {
    /// Create a limiter over the shared cache store
    #[must_use]
    pub fn new(cache: Arc<CacheStore>, config: AnonymousConfig) -> Self {
        Self { cache, config }
    }

    /// Models anonymous callers may use
    #[must_use]
    pub fn allowed_models(&self) -> &[String] {
        &self.config.allowed_models
    }

    /// Whether a model is allowed for anonymous use: it must carry the
    /// `:free` suffix and be explicitly whitelisted.
    #[must_use]
    pub fn is_model_allowed(&self, model: &str) -> bool {
        if !model.ends_with(":free") {
            return false;
        }
        let lower = model.to_ascii_lowercase();
        self.config
            .allowed_models
            .iter()
            .any(|allowed| allowed.to_ascii_lowercase() == lower)
    }

    /// Denial message listing a sample of allowed models
    #[must_use]
    pub fn model_denied_reason(&self, model: &str) -> String {
        let sample = self
            .config
            .allowed_models
            .iter()
            .take(3)
            .cloned()
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "Model '{model}' is not available for anonymous users. \
             Anonymous access is limited to free models: {sample}... \
             Please sign up for an account to access this model."
        )
    }

    fn hash_ip(ip: &str) -> String {
        let digest = Sha256::digest(format!("anon_rate:{ip}").as_bytes());
        hex::encode(digest)[..32].to_string()
    }

    fn counter_key(ip: &str) -> String {
        let day = chrono::Utc::now().format("%Y-%m-%d");
        format!("anon_limit:{}:{day}", Self::hash_ip(ip))
    }

    /// Check the daily quota without consuming it.
    pub async fn check(&self, ip: &str) -> AnonymousDecision {
        let used = self
            .cache
            .incr_with_ttl(&Self::counter_key(ip), 0, COUNTER_TTL)
            .await
            .unwrap_or(0)
            .max(0) as u32;

        let limit = self.config.daily_limit;
        if used >= limit {
            AnonymousDecision {
                allowed: false,
                remaining: 0,
                limit,
                reason: Some(format!(
                    "Anonymous daily limit exceeded ({limit} requests/day). \
                     Please sign up for an account to continue."
                )),
            }
        } else {
            AnonymousDecision {
                allowed: true,
                remaining: limit - used,
                limit,
                reason: None,
            }
        }
    }

    /// Today's anonymous usage, gathered with cursor-based scans.
    pub async fn stats(&self) -> AnonymousStats {
        let day = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let mut stats = AnonymousStats::default();
        let mut cursor = 0;

        loop {
            let (next, keys) = self.cache.scan_prefix("anon_limit:", cursor, 100).await;
            for key in keys {
                if !key.ends_with(&day) {
                    continue;
                }
                stats.unique_ips_today += 1;
                if let Some(count) = self.cache.incr_with_ttl(&key, 0, COUNTER_TTL).await {
                    stats.total_requests_today += count.max(0) as u64;
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        stats
    }

    /// Record a successful anonymous request. Called after completion.
    pub async fn record(&self, ip: &str, model: &str) -> u32 {
        let count = self
            .cache
            .incr_with_ttl(&Self::counter_key(ip), 1, COUNTER_TTL)
            .await
            .unwrap_or(0)
            .max(0) as u32;

        info!(
            ip_hash = %&Self::hash_ip(ip)[..8],
            model = %model,
            count = count,
            limit = self.config.daily_limit,
            "Anonymous request recorded"
        );
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> AnonymousLimiter {
        AnonymousLimiter::new(Arc::new(CacheStore::in_memory()), AnonymousConfig::default())
    }

    #[test]
    fn model_whitelist() {
        let limiter = limiter();
        assert!(limiter.is_model_allowed("google/gemma-2-9b-it:free"));
        assert!(limiter.is_model_allowed("GOOGLE/GEMMA-2-9B-IT:FREE"));
        // Free suffix alone is not enough
        assert!(!limiter.is_model_allowed("some/other-model:free"));
        // Paid models never allowed
        assert!(!limiter.is_model_allowed("gpt-4"));
    }

    #[tokio::test]
    async fn quota_enforced_per_ip() {
        let limiter = limiter();
        let ip = "192.0.2.7";

        for _ in 0..3 {
            assert!(limiter.check(ip).await.allowed);
            limiter.record(ip, "google/gemma-2-9b-it:free").await;
        }

        let decision = limiter.check(ip).await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(decision.reason.as_deref().is_some_and(|r| r.contains("daily limit")));

        // A different IP is unaffected
        assert!(limiter.check("198.51.100.1").await.allowed);
    }

    #[test]
    fn ip_is_hashed_not_stored() {
        let key = AnonymousLimiter::counter_key("192.0.2.7");
        assert!(!key.contains("192.0.2.7"));
        assert!(key.starts_with("anon_limit:"));
    }

    #[tokio::test]
    async fn stats_cover_todays_usage() {
        let limiter = limiter();
        limiter.record("192.0.2.7", "google/gemma-2-9b-it:free").await;
        limiter.record("192.0.2.7", "google/gemma-2-9b-it:free").await;
        limiter.record("198.51.100.1", "google/gemma-2-9b-it:free").await;

        let stats = limiter.stats().await;
        assert_eq!(stats.unique_ips_today, 2);
        assert_eq!(stats.total_requests_today, 3);
    }

    #[test]
    fn denial_reason_lists_models() {
        let limiter = limiter();
        let reason = limiter.model_denied_reason("gpt-4");
        assert!(reason.contains("gpt-4"));
        assert!(reason.contains(":free"));
    }
}
