//! # Relay Providers
//!
//! Upstream provider adapters for the LLM Relay gateway.
//!
//! Every provider implements [`ProviderAdapter`]: one non-streaming call,
//! one streaming call decoding into canonical chunk events, and error
//! translation into the gateway taxonomy. Adapters register into the
//! slug-keyed [`AdapterTable`]; the orchestrator never sees a concrete
//! provider type. Adding a provider is one file plus one registration.
//!
//! Most OpenAI-shape providers are instances of the parameterized
//! [`OpenAiCompatAdapter`]; [`AnthropicAdapter`] and [`GeminiAdapter`]
//! cover the two other stream shapes seen in the wild.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod adapter;
pub mod anthropic;
pub mod error;
pub mod gemini;
pub mod openai_compat;
pub mod table;

// Re-export main types
pub use adapter::{apply_parameter_floors, ProviderAdapter};
pub use anthropic::AnthropicAdapter;
pub use gemini::GeminiAdapter;
pub use openai_compat::{OpenAiCompatAdapter, OpenAiCompatConfig};
pub use table::AdapterTable;
