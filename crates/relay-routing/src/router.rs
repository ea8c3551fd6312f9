//! Failover chain construction.
//!
//! Ordering rules, highest priority first:
//! 1. A request-locked provider leads and no foreign providers are
//!    appended; failover stays within that provider's configured fallbacks.
//! 2. A provider encoded in the model id leads.
//! 3. Remaining carriers sort by (health, average latency, input price).
//! 4. Model-specific pinning rules remove forbidden providers.
//!
//! Sorting is stable with the provider slug as the final tiebreaker, so a
//! given catalog snapshot always yields the same chain. Breaker filtering
//! is the orchestrator's job; the router only builds the ordered list.

use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::transform::{detect_provider_from_model_id, normalize_provider_alias, Transformer};

/// One step of a failover chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderStep {
    /// Provider slug
    pub provider: String,
    /// Provider-specific model id, already rewritten
    pub model: String,
}

/// Model-scoped provider exclusion (compliance or capability holds)
struct PinRule {
    model_pattern: Regex,
    denied_provider: String,
}

/// Failover chain builder
pub struct Router {
    catalog: Arc<Catalog>,
    transformer: Arc<Transformer>,
    /// Per-provider fallback lists used when the request locks a provider
    fallbacks: HashMap<String, Vec<String>>,
    pins: Vec<PinRule>,
}

impl Router {
    /// Create a router over the catalog and transformer
    #[must_use]
    pub fn new(catalog: Arc<Catalog>, transformer: Arc<Transformer>) -> Self {
        Self {
            catalog,
            transformer,
            fallbacks: HashMap::new(),
            pins: Vec::new(),
        }
    }

    /// Configure the fallback list for a locked provider
    pub fn add_fallbacks(&mut self, provider: impl Into<String>, fallbacks: Vec<String>) {
        self.fallbacks.insert(provider.into(), fallbacks);
    }

    /// Forbid a provider for models matching a pattern
    pub fn add_pin_rule(&mut self, model_pattern: &str, denied_provider: impl Into<String>) {
        if let Ok(pattern) = Regex::new(model_pattern) {
            self.pins.push(PinRule {
                model_pattern: pattern,
                denied_provider: denied_provider.into(),
            });
        }
    }

    /// The transformer used for model-id rewriting
    #[must_use]
    pub fn transformer(&self) -> &Transformer {
        &self.transformer
    }

    /// Build the ordered failover chain for a canonical model.
    ///
    /// The returned chain is deduplicated and non-empty for any model the
    /// catalog knows; an empty chain means the model is unknown or every
    /// carrier is excluded.
    #[must_use]
    pub fn build_chain(&self, canonical_model: &str, provider_hint: Option<&str>) -> Vec<ProviderStep> {
        let snapshot = self.catalog.load();

        let hint = provider_hint
            .filter(|h| !h.trim().is_empty())
            .map(normalize_provider_alias);

        let mut providers: Vec<String> = Vec::new();

        if let Some(locked) = hint {
            if snapshot.provider(&locked).is_some() {
                // Rule 1: locked provider leads; only its own fallbacks follow
                info!(
                    model = %canonical_model,
                    provider = %locked,
                    "Request locked provider"
                );
                providers.push(locked.clone());
                if let Some(fallbacks) = self.fallbacks.get(&locked) {
                    providers.extend(fallbacks.iter().cloned());
                }
            } else {
                debug!(
                    model = %canonical_model,
                    provider = %locked,
                    "Unsupported provider hint, falling back to detection"
                );
                providers = self.detect_and_sort(canonical_model, &snapshot);
            }
        } else {
            providers = self.detect_and_sort(canonical_model, &snapshot);
        }

        // Rule 4: model-scoped exclusions
        providers.retain(|provider| {
            !self.pins.iter().any(|pin| {
                pin.denied_provider == *provider && pin.model_pattern.is_match(canonical_model)
            })
        });

        // Dedupe preserving order, then rewrite ids per provider
        let mut seen = std::collections::HashSet::new();
        providers
            .into_iter()
            .filter(|provider| seen.insert(provider.clone()))
            .map(|provider| {
                let model = self.transformer.rewrite(canonical_model, &provider);
                if model != canonical_model {
                    debug!(
                        canonical = %canonical_model,
                        provider = %provider,
                        rewritten = %model,
                        "Model id rewritten"
                    );
                }
                ProviderStep { provider, model }
            })
            .collect()
    }

    fn detect_and_sort(
        &self,
        canonical_model: &str,
        snapshot: &crate::catalog::CatalogSnapshot,
    ) -> Vec<String> {
        let mut providers = Vec::new();

        // Rule 2: the model id may encode its provider
        let detected = detect_provider_from_model_id(canonical_model)
            .map(|p| normalize_provider_alias(&p))
            .filter(|p| snapshot.provider(p).is_some());
        if let Some(ref leader) = detected {
            providers.push(leader.clone());
        }

        // Rule 3: remaining carriers, best first, slug as final tiebreaker
        let mut carriers = snapshot.carriers(canonical_model);
        carriers.sort_by(|(pa, ma), (pb, mb)| {
            pa.health
                .cmp(&pb.health)
                .then(pa.average_latency_ms.cmp(&pb.average_latency_ms))
                .then(
                    ma.input_price_per_token
                        .partial_cmp(&mb.input_price_per_token)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(pa.slug.cmp(&pb.slug))
        });
        providers.extend(carriers.into_iter().map(|(p, _)| p.slug.clone()));

        providers
    }
}
