//! Application state.
//!
//! Every component is an explicit dependency injected at startup; there
//! are no lazily initialized singletons. Handlers receive the state by
//! clone (it is a shared handle).

use std::sync::Arc;

use relay_accounting::Accounting;
use relay_cache::{AuthCache, CacheStore};
use relay_config::RelayConfig;
use relay_core::UserStore;
use relay_limits::{AnonymousLimiter, ConcurrencyLimiter, RateLimitManager};
use relay_providers::AdapterTable;
use relay_resilience::BreakerRegistry;
use relay_routing::{Catalog, Router};
use relay_telemetry::MetricsRecorder;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: RelayConfig,
    cache: Arc<CacheStore>,
    auth: Arc<AuthCache>,
    store: Arc<dyn UserStore>,
    rate_limits: Arc<RateLimitManager>,
    concurrency: Arc<ConcurrencyLimiter>,
    anonymous: Arc<AnonymousLimiter>,
    breakers: Arc<BreakerRegistry>,
    catalog: Arc<Catalog>,
    router: Arc<Router>,
    adapters: Arc<AdapterTable>,
    accounting: Arc<Accounting>,
    metrics: Arc<MetricsRecorder>,
}

impl AppState {
    /// Assemble the state from constructed components
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        config: RelayConfig,
        cache: Arc<CacheStore>,
        auth: Arc<AuthCache>,
        store: Arc<dyn UserStore>,
        rate_limits: Arc<RateLimitManager>,
        concurrency: Arc<ConcurrencyLimiter>,
        anonymous: Arc<AnonymousLimiter>,
        breakers: Arc<BreakerRegistry>,
        catalog: Arc<Catalog>,
        router: Arc<Router>,
        adapters: Arc<AdapterTable>,
        accounting: Arc<Accounting>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config,
                cache,
                auth,
                store,
                rate_limits,
                concurrency,
                anonymous,
                breakers,
                catalog,
                router,
                adapters,
                accounting,
                metrics,
            }),
        }
    }

    /// Gateway configuration
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    /// Cache store
    #[must_use]
    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.inner.cache
    }

    /// Auth cache
    #[must_use]
    pub fn auth(&self) -> &Arc<AuthCache> {
        &self.inner.auth
    }

    /// External datastore
    #[must_use]
    pub fn store(&self) -> &Arc<dyn UserStore> {
        &self.inner.store
    }

    /// Rate limit manager
    #[must_use]
    pub fn rate_limits(&self) -> &Arc<RateLimitManager> {
        &self.inner.rate_limits
    }

    /// Per-key concurrency limiter
    #[must_use]
    pub fn concurrency(&self) -> &Arc<ConcurrencyLimiter> {
        &self.inner.concurrency
    }

    /// Anonymous limiter
    #[must_use]
    pub fn anonymous(&self) -> &Arc<AnonymousLimiter> {
        &self.inner.anonymous
    }

    /// Circuit breaker registry
    #[must_use]
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.inner.breakers
    }

    /// Provider/model catalog
    #[must_use]
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.inner.catalog
    }

    /// Failover chain router
    #[must_use]
    pub fn router(&self) -> &Arc<Router> {
        &self.inner.router
    }

    /// Provider adapter table
    #[must_use]
    pub fn adapters(&self) -> &Arc<AdapterTable> {
        &self.inner.adapters
    }

    /// Accounting component
    #[must_use]
    pub fn accounting(&self) -> &Arc<Accounting> {
        &self.inner.accounting
    }

    /// Metrics recorder
    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.inner.metrics
    }
}
