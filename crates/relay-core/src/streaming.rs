//! Streaming chunk types.
//!
//! Provider adapters decode their native wire format into a stream of
//! [`ChunkEvent`]s; the normalizer folds those events into OpenAI-shape
//! [`ChatChunk`]s for the client. The event type is the only contract
//! between the two sides.

use serde::{Deserialize, Serialize};

use crate::request::MessageRole;
use crate::response::{FinishReason, Usage};

/// Canonical event decoded from one provider chunk.
///
/// A single provider chunk may decode into several events (e.g. a role
/// marker plus a content fragment).
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkEvent {
    /// Role marker for a choice
    Role {
        /// Choice index
        index: u32,
        /// Message role
        role: MessageRole,
    },
    /// Content fragment for a choice
    Content {
        /// Choice index
        index: u32,
        /// Text fragment
        text: String,
    },
    /// Chain-of-thought fragment for a choice
    Reasoning {
        /// Choice index
        index: u32,
        /// Reasoning fragment
        text: String,
    },
    /// Finish marker for a choice
    Finish {
        /// Choice index
        index: u32,
        /// Normalized finish reason
        reason: FinishReason,
    },
    /// Usage block, typically on the final chunk
    Usage(Usage),
    /// Mid-stream upstream error
    Error {
        /// Human-readable message
        message: String,
    },
}

/// OpenAI-compatible streaming chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChunk {
    /// Chunk id, stable across one stream
    pub id: String,
    /// Object type, always "chat.completion.chunk"
    pub object: String,
    /// Creation timestamp (Unix seconds)
    pub created: i64,
    /// Model the stream is produced by
    pub model: String,
    /// Per-choice deltas
    pub choices: Vec<ChunkChoice>,
    /// Usage block on the final chunk, when the provider supplies one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatChunk {
    /// Create an empty chunk shell for the given stream identity
    #[must_use]
    pub fn shell(id: impl Into<String>, created: i64, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.into(),
            choices: Vec::new(),
            usage: None,
        }
    }
}

/// Delta for one choice within a chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    /// Choice index
    pub index: u32,
    /// The delta payload
    pub delta: ChunkDelta,
    /// Finish reason when the choice completed
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
}

/// Incremental message delta
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkDelta {
    /// Role, sent once at stream start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<MessageRole>,
    /// Content fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Reasoning fragment, kept separate from content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

impl ChunkDelta {
    /// True when the delta carries nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.role.is_none() && self.content.is_none() && self.reasoning_content.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_serializes_without_empty_fields() {
        let chunk = ChatChunk {
            id: "chatcmpl-1".to_string(),
            object: "chat.completion.chunk".to_string(),
            created: 1_700_000_000,
            model: "gpt-4".to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role: None,
                    content: Some("Hi".to_string()),
                    reasoning_content: None,
                },
                finish_reason: None,
            }],
            usage: None,
        };

        let json = serde_json::to_string(&chunk).expect("serialize");
        assert!(json.contains("\"content\":\"Hi\""));
        assert!(!json.contains("reasoning_content"));
        assert!(!json.contains("usage"));
    }

    #[test]
    fn delta_emptiness() {
        assert!(ChunkDelta::default().is_empty());
        let delta = ChunkDelta {
            content: Some(String::new()),
            ..Default::default()
        };
        assert!(!delta.is_empty());
    }
}
