//! Route definitions for the gateway API.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::{chat, handlers, responses, state::AppState};

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(handlers::health_check))
        .route("/healthz", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        // Metrics endpoint
        .route("/metrics", get(handlers::metrics_endpoint))
        // OpenAI-compatible endpoints
        .nest("/v1", openai_routes())
        // Admin endpoints
        .nest("/admin", admin_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// OpenAI-compatible API routes
fn openai_routes() -> Router<AppState> {
    Router::new()
        .route("/chat/completions", post(chat::chat_completions))
        .route("/responses", post(responses::unified_responses))
        .route("/models", get(handlers::list_models))
}

/// Admin/management routes
fn admin_routes() -> Router<AppState> {
    Router::new().route("/stats", get(handlers::gateway_stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use relay_accounting::{Accounting, TaskGroup};
    use relay_cache::{AuthCache, CacheStore};
    use relay_config::RelayConfig;
    use relay_core::store::MemoryUserStore;
    use relay_core::UserStore;
    use relay_limits::{AnonymousLimiter, ConcurrencyLimiter, RateLimitManager};
    use relay_providers::AdapterTable;
    use relay_resilience::BreakerRegistry;
    use relay_routing::{Catalog, CatalogSnapshot, Router as ChainRouter, Transformer};
    use relay_telemetry::MetricsRecorder;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn create_test_state() -> AppState {
        let config = RelayConfig::default();
        let cache = Arc::new(CacheStore::in_memory());
        let store: Arc<dyn UserStore> = Arc::new(MemoryUserStore::new());
        let auth = Arc::new(AuthCache::new(
            Arc::clone(&cache),
            Arc::clone(&store),
            Duration::from_secs(300),
            Duration::from_secs(60),
        ));
        let rate_limits = Arc::new(RateLimitManager::new(config.rate_limit.clone()));
        let catalog = Arc::new(Catalog::new(CatalogSnapshot::default()));
        let accounting = Arc::new(Accounting::new(
            Arc::clone(&store),
            Arc::clone(&auth),
            Arc::clone(&rate_limits),
            TaskGroup::new(4),
        ));

        AppState::new(
            config.clone(),
            Arc::clone(&cache),
            auth,
            store,
            rate_limits,
            Arc::new(ConcurrencyLimiter::new(config.rate_limit.max_concurrency)),
            Arc::new(AnonymousLimiter::new(cache, config.anonymous.clone())),
            Arc::new(BreakerRegistry::new(config.breaker.clone())),
            Arc::clone(&catalog),
            Arc::new(ChainRouter::new(catalog, Arc::new(Transformer::new()))),
            Arc::new(AdapterTable::new()),
            accounting,
            Arc::new(MetricsRecorder::default()),
        )
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = create_router(create_test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let app = create_router(create_test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_models_endpoint() {
        let app = create_router(create_test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/models")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_chat_rejects_malformed_body() {
        let app = create_router(create_test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
