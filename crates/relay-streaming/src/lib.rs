//! # Relay Streaming
//!
//! Stream normalization for the LLM Relay gateway.
//!
//! Provider adapters decode their native chunk formats into canonical
//! [`relay_core::ChunkEvent`]s; the [`normalizer`] folds those events into
//! OpenAI-shape chunks while accumulating content, reasoning, and usage for
//! post-flight accounting. [`sse`] holds the wire framing helpers.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod normalizer;
pub mod sse;

// Re-export main types
pub use normalizer::{StreamNormalizer, StreamSummary};
pub use sse::{data_frame, done_frame, error_frame, typed_event_frame};
