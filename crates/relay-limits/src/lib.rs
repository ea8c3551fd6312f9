//! # Relay Limits
//!
//! Rate limiting for the LLM Relay gateway:
//! - Sliding-window request and token limits per API key
//! - Per-key in-flight concurrency control
//! - Anonymous per-IP daily quota with a free-model whitelist
//! - Rate-limit response header construction (IETF draft + legacy)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod anonymous;
pub mod concurrency;
pub mod headers;
pub mod window;

// Re-export main types
pub use anonymous::{AnonymousDecision, AnonymousLimiter, AnonymousStats};
pub use concurrency::{ConcurrencyLimiter, ConcurrencyPermit};
pub use headers::rate_limit_headers;
pub use window::{Decision, RateLimitManager};
