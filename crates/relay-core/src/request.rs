//! Request types for the gateway.
//!
//! This module defines the OpenAI-compatible chat-completion request body
//! accepted at ingress, together with its validation rules. Validation runs
//! before any I/O: a request that fails here never reaches a provider.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::GatewayError;

/// OpenAI-compatible chat completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRequest {
    /// Canonical model id (e.g. "gpt-4", "meta-llama/llama-3-70b")
    pub model: String,

    /// Chat messages for the conversation
    pub messages: Vec<ChatMessage>,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Sampling temperature (0.0 - 2.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Top-p (nucleus sampling) parameter (0.0 - 1.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Frequency penalty (-2.0 to 2.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,

    /// Presence penalty (-2.0 to 2.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,

    /// Stop sequences (at most 4)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,

    /// Number of completions to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,

    /// Seed for deterministic generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,

    /// End-user identifier for abuse tracking
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Token-id bias map
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logit_bias: Option<HashMap<String, f32>>,

    /// Whether to return logprobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<bool>,

    /// Number of top logprobs per token (0 - 20)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_logprobs: Option<u32>,

    /// Tool/function definitions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,

    /// Tool choice configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,

    /// Response format configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,

    /// Enable streaming response
    #[serde(default)]
    pub stream: bool,

    /// Streaming options (e.g. include_usage)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,

    /// Gateway provider hint: lock dispatch to this provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl GatewayRequest {
    /// Minimal request used as a starting point in tests and internal calls
    #[must_use]
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            max_tokens: None,
            temperature: None,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            stop: None,
            n: None,
            seed: None,
            user: None,
            logit_bias: None,
            logprobs: None,
            top_logprobs: None,
            tools: None,
            tool_choice: None,
            response_format: None,
            stream: false,
            stream_options: None,
            provider: None,
        }
    }

    /// Validate the entire request.
    ///
    /// # Errors
    /// Returns a `Validation` error naming the offending field.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.model.trim().is_empty() {
            return Err(GatewayError::validation(
                "model is required",
                Some("model".to_string()),
                "missing_model",
            ));
        }

        if self.messages.is_empty() {
            return Err(GatewayError::validation(
                "messages cannot be empty",
                Some("messages".to_string()),
                "empty_messages",
            ));
        }

        for (i, message) in self.messages.iter().enumerate() {
            message.validate().map_err(|e| match e {
                GatewayError::Validation { message, code, .. } => GatewayError::validation(
                    format!("messages[{i}]: {message}"),
                    Some("messages".to_string()),
                    code,
                ),
                other => other,
            })?;
        }

        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(GatewayError::validation(
                    format!("temperature must be between 0.0 and 2.0, got {t}"),
                    Some("temperature".to_string()),
                    "invalid_temperature",
                ));
            }
        }

        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(GatewayError::validation(
                    format!("top_p must be between 0.0 and 1.0, got {p}"),
                    Some("top_p".to_string()),
                    "invalid_top_p",
                ));
            }
        }

        if let Some(fp) = self.frequency_penalty {
            if !(-2.0..=2.0).contains(&fp) {
                return Err(GatewayError::validation(
                    format!("frequency_penalty must be between -2.0 and 2.0, got {fp}"),
                    Some("frequency_penalty".to_string()),
                    "invalid_frequency_penalty",
                ));
            }
        }

        if let Some(pp) = self.presence_penalty {
            if !(-2.0..=2.0).contains(&pp) {
                return Err(GatewayError::validation(
                    format!("presence_penalty must be between -2.0 and 2.0, got {pp}"),
                    Some("presence_penalty".to_string()),
                    "invalid_presence_penalty",
                ));
            }
        }

        if let Some(stop) = &self.stop {
            if stop.len() > 4 {
                return Err(GatewayError::validation(
                    format!("stop accepts at most 4 sequences, got {}", stop.len()),
                    Some("stop".to_string()),
                    "too_many_stop_sequences",
                ));
            }
        }

        if let Some(n) = self.n {
            if n == 0 {
                return Err(GatewayError::validation(
                    "n must be at least 1",
                    Some("n".to_string()),
                    "invalid_n",
                ));
            }
        }

        if let Some(k) = self.top_logprobs {
            if k > 20 {
                return Err(GatewayError::validation(
                    format!("top_logprobs must be between 0 and 20, got {k}"),
                    Some("top_logprobs".to_string()),
                    "invalid_top_logprobs",
                ));
            }
        }

        Ok(())
    }
}

/// Chat message with role and content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role of the message author
    pub role: MessageRole,

    /// Content of the message
    #[serde(default)]
    pub content: MessageContent,

    /// Optional name of the author
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Tool calls made by the assistant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<serde_json::Value>>,

    /// Tool call id for tool response messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// Create a system message
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(MessageRole::System, content)
    }

    /// Create a user message
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::text(MessageRole::User, content)
    }

    /// Create an assistant message
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(MessageRole::Assistant, content)
    }

    fn text(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(content.into()),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Validate content rules for this message's role.
    ///
    /// # Errors
    /// Returns a `Validation` error if the content shape is not allowed for
    /// the role.
    pub fn validate(&self) -> Result<(), GatewayError> {
        match self.role {
            MessageRole::System | MessageRole::User | MessageRole::Developer => {
                if self.content.is_empty() {
                    return Err(GatewayError::validation(
                        format!("{} message content cannot be empty", self.role),
                        Some("content".to_string()),
                        "empty_content",
                    ));
                }
            }
            MessageRole::Assistant => {
                // Assistant turns may carry tool calls instead of text
                if self.content.is_empty() && self.tool_calls.is_none() {
                    return Err(GatewayError::validation(
                        "assistant message requires content or tool_calls",
                        Some("content".to_string()),
                        "empty_content",
                    ));
                }
            }
            MessageRole::Tool | MessageRole::Function => {
                if self.tool_call_id.is_none() && self.role == MessageRole::Tool {
                    return Err(GatewayError::validation(
                        "tool message requires tool_call_id",
                        Some("tool_call_id".to_string()),
                        "missing_tool_call_id",
                    ));
                }
                if self.content.as_text().is_none() {
                    return Err(GatewayError::validation(
                        format!("{} message content must be a string", self.role),
                        Some("content".to_string()),
                        "invalid_content",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Flatten the content to plain text, joining multimodal text parts.
    #[must_use]
    pub fn text_content(&self) -> String {
        match &self.content {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System instruction
    System,
    /// End-user message
    User,
    /// Assistant message
    Assistant,
    /// Tool response message
    Tool,
    /// Legacy function response message
    Function,
    /// Developer instruction (newer OpenAI role, treated like system)
    Developer,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
            Self::Function => write!(f, "function"),
            Self::Developer => write!(f, "developer"),
        }
    }
}

/// Message content (text or multimodal parts)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Simple text content
    Text(String),
    /// Multimodal content parts
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl MessageContent {
    /// Get as text if this is text content
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Parts(_) => None,
        }
    }

    /// Check if content is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(s) => s.trim().is_empty(),
            Self::Parts(parts) => parts.is_empty(),
        }
    }

    /// Character count of all text, used for token estimation
    #[must_use]
    pub fn text_len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.len(),
                    ContentPart::ImageUrl { .. } => 0,
                })
                .sum(),
        }
    }
}

/// Content part for multimodal messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Text content part
    Text {
        /// The text content
        text: String,
    },
    /// Image content part
    ImageUrl {
        /// Image URL details
        image_url: ImageUrl,
    },
}

/// Image URL for vision models
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    /// URL of the image
    pub url: String,
    /// Detail level for processing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Tool/function definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool type (currently only "function")
    #[serde(rename = "type")]
    pub tool_type: String,
    /// Function definition
    pub function: FunctionDefinition,
}

/// Function definition for tools
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    /// Function name
    pub name: String,
    /// Function description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Function parameters (JSON Schema)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

/// Tool choice configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    /// String choice: "none", "auto", "required"
    Mode(String),
    /// Specific tool choice
    Tool {
        /// Tool type
        #[serde(rename = "type")]
        tool_type: String,
        /// Function to call
        function: ToolChoiceFunction,
    },
}

/// Function choice for a specific tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolChoiceFunction {
    /// Function name
    pub name: String,
}

/// Response format configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFormat {
    /// Format type: "text", "json_object", or "json_schema"
    #[serde(rename = "type")]
    pub format_type: String,
    /// Schema body when format_type is "json_schema"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<serde_json::Value>,
}

/// Streaming options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamOptions {
    /// Ask the provider to attach a usage block to the final chunk
    #[serde(default)]
    pub include_usage: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_request() -> GatewayRequest {
        GatewayRequest::new("gpt-4", vec![ChatMessage::user("Hello")])
    }

    #[test]
    fn valid_request_passes() {
        assert!(valid_request().validate().is_ok());
    }

    #[test]
    fn empty_messages_rejected() {
        let request = GatewayRequest::new("gpt-4", vec![]);
        assert!(request.validate().is_err());
    }

    #[test]
    fn empty_model_rejected() {
        let request = GatewayRequest::new("  ", vec![ChatMessage::user("Hello")]);
        assert!(request.validate().is_err());
    }

    #[test]
    fn temperature_bounds() {
        let mut request = valid_request();
        request.temperature = Some(2.0);
        assert!(request.validate().is_ok());

        request.temperature = Some(2.01);
        assert!(request.validate().is_err());

        request.temperature = Some(-0.1);
        assert!(request.validate().is_err());
    }

    #[test]
    fn stop_limit() {
        let mut request = valid_request();
        request.stop = Some(vec!["a".into(), "b".into(), "c".into(), "d".into()]);
        assert!(request.validate().is_ok());

        request.stop = Some(vec![
            "a".into(),
            "b".into(),
            "c".into(),
            "d".into(),
            "e".into(),
        ]);
        assert!(request.validate().is_err());
    }

    #[test]
    fn n_must_be_positive() {
        let mut request = valid_request();
        request.n = Some(0);
        assert!(request.validate().is_err());
    }

    #[test]
    fn top_logprobs_bounds() {
        let mut request = valid_request();
        request.top_logprobs = Some(20);
        assert!(request.validate().is_ok());
        request.top_logprobs = Some(21);
        assert!(request.validate().is_err());
    }

    #[test]
    fn empty_user_content_rejected() {
        let request = GatewayRequest::new("gpt-4", vec![ChatMessage::user("")]);
        assert!(request.validate().is_err());
    }

    #[test]
    fn assistant_with_tool_calls_only_accepted() {
        let message = ChatMessage {
            role: MessageRole::Assistant,
            content: MessageContent::Text(String::new()),
            name: None,
            tool_calls: Some(vec![serde_json::json!({"id": "call_1"})]),
            tool_call_id: None,
        };
        assert!(message.validate().is_ok());
    }

    #[test]
    fn tool_message_requires_tool_call_id() {
        let message = ChatMessage {
            role: MessageRole::Tool,
            content: MessageContent::Text("result".to_string()),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        };
        assert!(message.validate().is_err());
    }

    #[test]
    fn multimodal_content_deserializes() {
        let json = serde_json::json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "Describe this"},
                {"type": "image_url", "image_url": {"url": "https://example.com/a.png"}}
            ]
        });
        let message: ChatMessage = serde_json::from_value(json).expect("deserialize");
        assert!(matches!(message.content, MessageContent::Parts(ref p) if p.len() == 2));
        assert_eq!(message.text_content(), "Describe this");
    }

    #[test]
    fn developer_role_accepted() {
        let json = serde_json::json!({"role": "developer", "content": "Be terse"});
        let message: ChatMessage = serde_json::from_value(json).expect("deserialize");
        assert_eq!(message.role, MessageRole::Developer);
        assert!(message.validate().is_ok());
    }
}
