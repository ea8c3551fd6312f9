//! Response types for the gateway.

use serde::{Deserialize, Serialize};

use crate::request::MessageRole;

/// OpenAI-compatible chat completion response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletion {
    /// Completion id
    pub id: String,
    /// Object type, always "chat.completion"
    pub object: String,
    /// Creation timestamp (Unix seconds)
    pub created: i64,
    /// Model that produced the completion (canonical id)
    pub model: String,
    /// Completion choices
    pub choices: Vec<Choice>,
    /// Token usage
    pub usage: Usage,
    /// Gateway accounting addendum
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_usage: Option<GatewayUsage>,
}

impl ChatCompletion {
    /// Create a single-choice completion
    #[must_use]
    pub fn new(id: impl Into<String>, model: impl Into<String>, message: ResponseMessage) -> Self {
        Self {
            id: id.into(),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
            choices: vec![Choice {
                index: 0,
                message,
                finish_reason: Some(FinishReason::Stop),
            }],
            usage: Usage::default(),
            gateway_usage: None,
        }
    }

    /// Content of the first choice, if any
    #[must_use]
    pub fn first_content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.message.content.as_deref())
    }
}

/// One completion choice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    /// Choice index
    pub index: u32,
    /// Generated message
    pub message: ResponseMessage,
    /// Why generation stopped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

/// Message generated by the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    /// Role, always assistant for completions
    pub role: MessageRole,
    /// Text content
    #[serde(default)]
    pub content: Option<String>,
    /// Chain-of-thought content, when the provider returns one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    /// Tool calls requested by the model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<serde_json::Value>>,
}

impl ResponseMessage {
    /// Create a plain assistant text message
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: Some(content.into()),
            reasoning_content: None,
            tool_calls: None,
        }
    }
}

/// Canonical finish reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural stop or stop sequence
    Stop,
    /// Token limit reached
    Length,
    /// Content filtered or stream errored
    Error,
    /// Model requested tool calls
    ToolCalls,
    /// Model requested a legacy function call
    FunctionCall,
}

impl FinishReason {
    /// Normalize a provider-reported finish reason into the canonical set.
    ///
    /// Unknown values collapse to `Stop`, matching upstream leniency.
    #[must_use]
    pub fn normalize(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "length" | "max_tokens" => Self::Length,
            "content_filter" | "safety" | "error" => Self::Error,
            "tool_calls" => Self::ToolCalls,
            "function_call" => Self::FunctionCall,
            // "stop", "end_turn", "stop_sequence", and everything else
            _ => Self::Stop,
        }
    }

    /// Wire string
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::Error => "error",
            Self::ToolCalls => "tool_calls",
            Self::FunctionCall => "function_call",
        }
    }
}

/// Token usage block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens in the prompt
    pub prompt_tokens: u32,
    /// Tokens generated
    pub completion_tokens: u32,
    /// Sum of both
    pub total_tokens: u32,
}

impl Usage {
    /// Build a usage block, computing the total
    #[must_use]
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Gateway accounting addendum attached to responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayUsage {
    /// Tokens the caller was charged for
    pub tokens_charged: u32,
    /// Wall-clock request duration in milliseconds
    pub request_ms: u64,
    /// Cost in USD; omitted for trial users
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}
