//! # Relay Server
//!
//! HTTP server and request lifecycle orchestration for the LLM Relay
//! gateway.
//!
//! This crate composes every other subsystem around one chat completion:
//! admission (auth cache, trial, plan, rate limits, credits), provider
//! selection with failover, upstream dispatch, stream normalization,
//! and post-flight accounting and metrics.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admission;
pub mod chat;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod responses;
pub mod routes;
pub mod server;
pub mod state;

// Re-export main types
pub use error::ApiError;
pub use routes::create_router;
pub use server::{Server, ServerConfig};
pub use state::AppState;
