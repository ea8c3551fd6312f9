//! Operational endpoints: health, models, stats, metrics.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Version
    pub version: String,
    /// Cache backend currently serving
    pub cache_backend: String,
    /// Registered provider count
    pub providers: usize,
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        cache_backend: state.cache().backend_name().await.to_string(),
        providers: state.adapters().len(),
    })
}

/// Readiness check endpoint
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.adapters().is_empty() {
        (StatusCode::SERVICE_UNAVAILABLE, "no providers available")
    } else {
        (StatusCode::OK, "ready")
    }
}

/// Metrics endpoint (Prometheus text format)
pub async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics().gather(),
    )
}

/// Model list entry (OpenAI compatible)
#[derive(Debug, Serialize)]
pub struct ModelObject {
    /// Canonical model id
    pub id: String,
    /// Object type
    pub object: String,
    /// Owner label
    pub owned_by: String,
}

/// Model list response
#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    /// Object type
    pub object: String,
    /// The models
    pub data: Vec<ModelObject>,
}

/// List models endpoint (OpenAI compatible)
pub async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    let data = state
        .catalog()
        .load()
        .canonical_models()
        .into_iter()
        .map(|id| ModelObject {
            id,
            object: "model".to_string(),
            owned_by: "system".to_string(),
        })
        .collect();

    Json(ModelsResponse {
        object: "list".to_string(),
        data,
    })
}

/// Gateway statistics response
#[derive(Debug, Serialize)]
pub struct GatewayStats {
    /// Registered providers
    pub providers: Vec<String>,
    /// Health score per provider
    pub provider_health: std::collections::HashMap<String, f64>,
    /// Anonymous usage today
    pub anonymous: relay_limits::AnonymousStats,
    /// Post-flight tasks not yet finished
    pub pending_accounting_tasks: usize,
}

/// Gateway statistics endpoint
pub async fn gateway_stats(State(state): State<AppState>) -> Json<GatewayStats> {
    Json(GatewayStats {
        providers: state.adapters().slugs(),
        provider_health: state.metrics().all_health_scores(),
        anonymous: state.anonymous().stats().await,
        pending_accounting_tasks: state.accounting().tasks().outstanding(),
    })
}
