//! # LLM Relay
//!
//! OpenAI-compatible LLM API gateway with metered access, provider
//! failover, circuit breaking, and streaming normalization.
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults (in-memory datastore, config from environment)
//! llm-relay
//!
//! # Start with a config file
//! RELAY_CONFIG=/etc/relay/config.yaml llm-relay
//! ```

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use relay_accounting::{Accounting, TaskGroup};
use relay_cache::{AuthCache, CacheStore, MemoryBackend};
use relay_config::{ProviderKind, RelayConfig};
use relay_core::store::MemoryUserStore;
use relay_core::{EnvironmentTag, TrialDescriptor, User, UserStore};
use relay_limits::{AnonymousLimiter, ConcurrencyLimiter, RateLimitManager};
use relay_providers::{
    AdapterTable, AnthropicAdapter, GeminiAdapter, OpenAiCompatAdapter, OpenAiCompatConfig,
};
use relay_resilience::BreakerRegistry;
use relay_routing::{
    Catalog, CatalogSnapshot, HealthState, ModelRecord, ProviderRecord, Router, Transformer,
};
use relay_server::{AppState, Server, ServerConfig};
use relay_telemetry::{init_logging, LoggingConfig, MetricsRecorder};

const CATALOG_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    if let Err(e) = init_logging(&LoggingConfig::new().with_level("info")) {
        eprintln!("Failed to initialize logging: {e}");
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting LLM Relay");

    if let Err(e) = run().await {
        tracing::error!(error = %e, "Gateway failed");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = RelayConfig::load().context("loading configuration")?;

    info!(
        host = %config.server.host,
        port = config.server.port,
        providers = config.providers.len(),
        models = config.models.len(),
        "Configuration loaded"
    );

    // Cache layer; the backend trait is the seam for a distributed store
    let cache = Arc::new(CacheStore::new(
        Arc::new(MemoryBackend::new(config.cache.memory_capacity)),
        config.cache.probe_positive_ttl,
        config.cache.probe_negative_ttl,
    ));

    // Datastore; in-memory unless wired to an external implementation
    let store: Arc<dyn UserStore> = Arc::new(seed_dev_store());

    let auth = Arc::new(AuthCache::new(
        Arc::clone(&cache),
        Arc::clone(&store),
        config.cache.auth_positive_ttl,
        config.cache.auth_negative_ttl,
    ));

    let rate_limits = Arc::new(RateLimitManager::new(config.rate_limit.clone()));
    let concurrency = Arc::new(ConcurrencyLimiter::new(config.rate_limit.max_concurrency));
    let anonymous = Arc::new(AnonymousLimiter::new(
        Arc::clone(&cache),
        config.anonymous.clone(),
    ));

    let breakers = Arc::new(
        BreakerRegistry::new(config.breaker.clone()).with_cache(Arc::clone(&cache)),
    );

    let metrics = Arc::new(MetricsRecorder::new(config.metrics.clone()));

    // Catalog: seeded from config, refreshed with observed health
    let catalog = Arc::new(Catalog::new(build_snapshot(&config, None)));
    {
        let refresh_config = config.clone();
        let refresh_metrics = Arc::clone(&metrics);
        catalog.spawn_refresher(CATALOG_REFRESH_INTERVAL, move || {
            let config = refresh_config.clone();
            let metrics = Arc::clone(&refresh_metrics);
            async move { Some(build_snapshot(&config, Some(&metrics))) }
        });
    }

    let mut transformer = Transformer::new();
    for model in &config.models {
        if let Some(provider_id) = &model.provider_model_id {
            transformer.add_exact(&model.provider, &model.canonical_id, provider_id);
        }
    }

    let mut router = Router::new(Arc::clone(&catalog), Arc::new(transformer));
    // OpenRouter carries nearly everything; it backstops every direct
    // provider when the request locks one
    if config.providers.iter().any(|p| p.slug == "openrouter") {
        for provider in &config.providers {
            if provider.slug != "openrouter" {
                router.add_fallbacks(provider.slug.clone(), vec!["openrouter".to_string()]);
            }
        }
    }
    let router = Arc::new(router);

    let adapters = Arc::new(build_adapter_table(&config)?);
    info!(providers = adapters.len(), "Adapter table initialized");

    let accounting = Arc::new(Accounting::new(
        Arc::clone(&store),
        Arc::clone(&auth),
        Arc::clone(&rate_limits),
        TaskGroup::new(256),
    ));

    let state = AppState::new(
        config.clone(),
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
    );

    let server_config = ServerConfig::new()
        .with_host(&config.server.host)
        .with_port(config.server.port);

    Server::new(server_config, state)
        .run()
        .await
        .context("running server")
}

/// Build the catalog snapshot from config, folding in observed health when
/// the recorder has data.
fn build_snapshot(config: &RelayConfig, metrics: Option<&MetricsRecorder>) -> CatalogSnapshot {
    let providers = config
        .providers
        .iter()
        .filter(|p| p.enabled)
        .map(|p| {
            let health = metrics.map_or(HealthState::Healthy, |m| {
                let score = m.health_score(&p.slug);
                if score >= 80.0 {
                    HealthState::Healthy
                } else if score >= 50.0 {
                    HealthState::Degraded
                } else {
                    HealthState::Unhealthy
                }
            });
            ProviderRecord {
                slug: p.slug.clone(),
                is_active: true,
                health,
                average_latency_ms: 0,
                supports_streaming: true,
                supports_function_calling: p.kind == ProviderKind::Openai,
                supports_vision: false,
            }
        })
        .collect();

    let models = config
        .models
        .iter()
        .map(|m| ModelRecord {
            canonical_id: m.canonical_id.clone(),
            provider_slug: m.provider.clone(),
            provider_model_id: m
                .provider_model_id
                .clone()
                .unwrap_or_else(|| m.canonical_id.clone()),
            input_price_per_token: m.input_price_per_token,
            output_price_per_token: m.output_price_per_token,
            context_length: m.context_length,
            is_active: true,
            recent_success_rate: 1.0,
        })
        .collect();

    CatalogSnapshot::new(providers, models)
}

fn build_adapter_table(config: &RelayConfig) -> anyhow::Result<AdapterTable> {
    let mut table = AdapterTable::new();

    for provider in config.providers.iter().filter(|p| p.enabled) {
        let credential = RelayConfig::provider_credential(provider);
        let timeout = config.provider_timeout(&provider.slug);

        if credential.is_none() && provider.api_key_env.is_some() {
            warn!(
                provider = %provider.slug,
                env = ?provider.api_key_env,
                "Credential not set, provider registered without auth"
            );
        }

        match provider.kind {
            ProviderKind::Openai => {
                let mut adapter_config =
                    OpenAiCompatConfig::new(&provider.slug, &provider.base_url)
                        .with_timeout(timeout);
                if let Some(key) = credential {
                    adapter_config = adapter_config.with_api_key(key);
                }
                table.register(Arc::new(OpenAiCompatAdapter::new(adapter_config)?));
            }
            ProviderKind::Anthropic => {
                table.register(Arc::new(AnthropicAdapter::new(
                    &provider.slug,
                    &provider.base_url,
                    credential.unwrap_or_default(),
                    timeout,
                )?));
            }
            ProviderKind::Gemini => {
                table.register(Arc::new(GeminiAdapter::new(
                    &provider.slug,
                    &provider.base_url,
                    credential.unwrap_or_default(),
                    timeout,
                )?));
            }
        }
    }

    Ok(table)
}

/// In-memory datastore with an optional development key from the
/// environment (`RELAY_DEV_API_KEY`, `RELAY_DEV_CREDITS`).
fn seed_dev_store() -> MemoryUserStore {
    let store = MemoryUserStore::new();

    if let Ok(api_key) = std::env::var("RELAY_DEV_API_KEY") {
        let credits = std::env::var("RELAY_DEV_CREDITS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(100.0);
        info!(credits = credits, "Seeding development API key");
        store.put_user(User {
            id: 1,
            api_key,
            environment_tag: EnvironmentTag::Live,
            credits,
            plan_id: None,
            trial: TrialDescriptor::default(),
        });
    }

    store
}
