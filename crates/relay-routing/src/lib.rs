//! # Relay Routing
//!
//! Provider selection for the LLM Relay gateway.
//!
//! This crate provides:
//! - The provider/model catalog, a read-mostly snapshot refreshed in the
//!   background
//! - Failover chain construction with deterministic ordering
//! - Canonical to provider-specific model-id rewriting

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod catalog;
pub mod router;
pub mod transform;

// Re-export main types
pub use catalog::{Catalog, CatalogSnapshot, HealthState, ModelRecord, ProviderRecord};
pub use router::{ProviderStep, Router};
pub use transform::{detect_provider_from_model_id, normalize_provider_alias, Transformer};
