//! Provider and model catalog.
//!
//! Read-mostly records describing which providers exist, which models each
//! carries, their pricing, and their observed health. The whole catalog is
//! swapped atomically by a background refresher; readers always see a
//! consistent snapshot and never block. Record values are relative to the
//! rest of the snapshot at sort time, not absolute truths.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Provider health, ordered best-first for sorting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Serving normally
    #[default]
    Healthy,
    /// Elevated latency or error rate
    Degraded,
    /// Failing; avoid unless nothing else carries the model
    Unhealthy,
}

/// One upstream provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRecord {
    /// Provider slug
    pub slug: String,
    /// Whether the provider participates in routing
    pub is_active: bool,
    /// Observed health
    #[serde(default)]
    pub health: HealthState,
    /// Rolling average latency in milliseconds
    #[serde(default)]
    pub average_latency_ms: u64,
    /// Streaming support
    #[serde(default = "default_true")]
    pub supports_streaming: bool,
    /// Function-calling support
    #[serde(default)]
    pub supports_function_calling: bool,
    /// Vision support
    #[serde(default)]
    pub supports_vision: bool,
}

fn default_true() -> bool {
    true
}

/// One model as carried by one provider.
///
/// (provider_slug, canonical_id) is unique within a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecord {
    /// Gateway-internal stable model name
    pub canonical_id: String,
    /// Provider carrying it
    pub provider_slug: String,
    /// Identifier the provider requires on the wire
    pub provider_model_id: String,
    /// USD per input token
    pub input_price_per_token: f64,
    /// USD per output token
    pub output_price_per_token: f64,
    /// Context window size
    #[serde(default)]
    pub context_length: u32,
    /// Whether the model is currently served
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Recent success rate in [0, 1]
    #[serde(default = "default_success_rate")]
    pub recent_success_rate: f64,
}

fn default_success_rate() -> f64 {
    1.0
}

/// Immutable catalog snapshot
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    providers: HashMap<String, ProviderRecord>,
    models: Vec<ModelRecord>,
}

impl CatalogSnapshot {
    /// Build a snapshot from records
    #[must_use]
    pub fn new(providers: Vec<ProviderRecord>, models: Vec<ModelRecord>) -> Self {
        Self {
            providers: providers.into_iter().map(|p| (p.slug.clone(), p)).collect(),
            models,
        }
    }

    /// Provider record by slug
    #[must_use]
    pub fn provider(&self, slug: &str) -> Option<&ProviderRecord> {
        self.providers.get(slug)
    }

    /// All active provider slugs
    #[must_use]
    pub fn provider_slugs(&self) -> Vec<String> {
        let mut slugs: Vec<String> = self
            .providers
            .values()
            .filter(|p| p.is_active)
            .map(|p| p.slug.clone())
            .collect();
        slugs.sort();
        slugs
    }

    /// All distinct canonical model ids
    #[must_use]
    pub fn canonical_models(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .models
            .iter()
            .filter(|m| m.is_active)
            .map(|m| m.canonical_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Active (provider, model) pairs carrying a canonical model
    #[must_use]
    pub fn carriers(&self, canonical_id: &str) -> Vec<(&ProviderRecord, &ModelRecord)> {
        self.models
            .iter()
            .filter(|m| m.is_active && m.canonical_id == canonical_id)
            .filter_map(|m| {
                self.providers
                    .get(&m.provider_slug)
                    .filter(|p| p.is_active)
                    .map(|p| (p, m))
            })
            .collect()
    }

    /// Model record for a specific (provider, canonical) pair
    #[must_use]
    pub fn model(&self, provider_slug: &str, canonical_id: &str) -> Option<&ModelRecord> {
        self.models
            .iter()
            .find(|m| m.provider_slug == provider_slug && m.canonical_id == canonical_id)
    }

    /// Pricing for a canonical model, preferring the given provider's row
    #[must_use]
    pub fn pricing(&self, provider_slug: &str, canonical_id: &str) -> Option<(f64, f64)> {
        self.model(provider_slug, canonical_id)
            .or_else(|| self.models.iter().find(|m| m.canonical_id == canonical_id))
            .map(|m| (m.input_price_per_token, m.output_price_per_token))
    }

    /// Whether any provider carries the model
    #[must_use]
    pub fn knows_model(&self, canonical_id: &str) -> bool {
        self.models
            .iter()
            .any(|m| m.is_active && m.canonical_id == canonical_id)
    }
}

/// Atomically swappable catalog
pub struct Catalog {
    snapshot: ArcSwap<CatalogSnapshot>,
}

impl Catalog {
    /// Create a catalog with an initial snapshot
    #[must_use]
    pub fn new(snapshot: CatalogSnapshot) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
        }
    }

    /// Current snapshot
    #[must_use]
    pub fn load(&self) -> Arc<CatalogSnapshot> {
        self.snapshot.load_full()
    }

    /// Replace the snapshot
    pub fn swap(&self, snapshot: CatalogSnapshot) {
        debug!(
            providers = snapshot.providers.len(),
            models = snapshot.models.len(),
            "Catalog snapshot swapped"
        );
        self.snapshot.store(Arc::new(snapshot));
    }

    /// Spawn a background task that refreshes the catalog on an interval.
    ///
    /// The source returns `None` when it cannot produce a snapshot; the
    /// previous one stays in place.
    pub fn spawn_refresher<F, Fut>(self: &Arc<Self>, interval: Duration, source: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<CatalogSnapshot>> + Send,
    {
        let catalog = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match source().await {
                    Some(snapshot) => catalog.swap(snapshot),
                    None => warn!("Catalog refresh produced no snapshot, keeping previous"),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(slug: &str, health: HealthState) -> ProviderRecord {
        ProviderRecord {
            slug: slug.to_string(),
            is_active: true,
            health,
            average_latency_ms: 100,
            supports_streaming: true,
            supports_function_calling: false,
            supports_vision: false,
        }
    }

    fn model(provider: &str, canonical: &str) -> ModelRecord {
        ModelRecord {
            canonical_id: canonical.to_string(),
            provider_slug: provider.to_string(),
            provider_model_id: canonical.to_string(),
            input_price_per_token: 1e-6,
            output_price_per_token: 2e-6,
            context_length: 8192,
            is_active: true,
            recent_success_rate: 1.0,
        }
    }

    #[test]
    fn carriers_excludes_inactive() {
        let mut inactive = provider("b", HealthState::Healthy);
        inactive.is_active = false;

        let snapshot = CatalogSnapshot::new(
            vec![provider("a", HealthState::Healthy), inactive],
            vec![model("a", "gpt-4"), model("b", "gpt-4")],
        );

        let carriers = snapshot.carriers("gpt-4");
        assert_eq!(carriers.len(), 1);
        assert_eq!(carriers[0].0.slug, "a");
    }

    #[test]
    fn health_orders_best_first() {
        assert!(HealthState::Healthy < HealthState::Degraded);
        assert!(HealthState::Degraded < HealthState::Unhealthy);
    }

    #[test]
    fn pricing_prefers_provider_row() {
        let mut premium = model("b", "gpt-4");
        premium.input_price_per_token = 5e-6;

        let snapshot = CatalogSnapshot::new(
            vec![
                provider("a", HealthState::Healthy),
                provider("b", HealthState::Healthy),
            ],
            vec![model("a", "gpt-4"), premium],
        );

        let (input, _) = snapshot.pricing("b", "gpt-4").expect("pricing");
        assert!((input - 5e-6).abs() < f64::EPSILON);

        // Unknown provider falls back to any carrier's row
        assert!(snapshot.pricing("zzz", "gpt-4").is_some());
        assert!(snapshot.pricing("zzz", "missing").is_none());
    }

    #[test]
    fn swap_replaces_snapshot() {
        let catalog = Catalog::new(CatalogSnapshot::default());
        assert!(!catalog.load().knows_model("gpt-4"));

        catalog.swap(CatalogSnapshot::new(
            vec![provider("a", HealthState::Healthy)],
            vec![model("a", "gpt-4")],
        ));
        assert!(catalog.load().knows_model("gpt-4"));
    }
}
