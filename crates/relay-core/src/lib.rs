//! # Relay Core
//!
//! Core types, traits, and error handling for the LLM Relay gateway.
//!
//! This crate provides the foundational types used throughout the gateway:
//! - Request and response types (OpenAI-compatible)
//! - The canonical streaming chunk event model
//! - Error types and the failover/breaker error taxonomy
//! - Account types and the external datastore interface

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod account;
pub mod error;
pub mod request;
pub mod response;
pub mod store;
pub mod streaming;
pub mod types;

// Re-export commonly used types
pub use account::{EnvironmentTag, TrialDescriptor, UsageEvent, User};
pub use error::{ErrorKind, GatewayError, GatewayResult};
pub use request::{
    ChatMessage, ContentPart, GatewayRequest, MessageContent, MessageRole, ResponseFormat,
    ToolChoice, ToolDefinition,
};
pub use response::{ChatCompletion, Choice, FinishReason, GatewayUsage, ResponseMessage, Usage};
pub use store::{ActivityRecord, PlanDecision, Session, StoreError, UserStore};
pub use streaming::{ChatChunk, ChunkChoice, ChunkDelta, ChunkEvent};
pub use types::{mask_key, RequestId};
