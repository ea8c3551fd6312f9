//! # Relay Telemetry
//!
//! Observability for the LLM Relay gateway:
//! - Structured logging initialization
//! - Prometheus metrics for the `/metrics` endpoint
//! - The in-process metrics recorder: hourly aggregates, latency
//!   reservoirs, bounded error lists, and per-provider health scores

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod logging;
pub mod recorder;

// Re-export main types
pub use logging::{init_logging, LoggingConfig};
pub use recorder::{MetricsRecorder, RequestMetrics};
