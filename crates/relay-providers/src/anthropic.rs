//! Anthropic messages adapter.
//!
//! Anthropic speaks its own dialect: system prompt out-of-band, a typed
//! event stream (`content_block_delta`, `message_delta`) instead of
//! choice deltas, and `input_tokens`/`output_tokens` usage naming.

use async_stream::stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures_util::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

use relay_core::{
    ChatCompletion, Choice, ChunkEvent, FinishReason, GatewayError, GatewayRequest, GatewayResult,
    MessageRole, ResponseMessage, Usage,
};

use crate::adapter::ProviderAdapter;
use crate::error::{map_status, map_transport};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Adapter for the Anthropic messages API
pub struct AnthropicAdapter {
    slug: String,
    base_url: String,
    api_key: SecretString,
    timeout: Duration,
    client: reqwest::Client,
}

impl AnthropicAdapter {
    /// Create an adapter.
    ///
    /// # Errors
    /// Returns an error when the HTTP client cannot be constructed.
    pub fn new(
        slug: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(100)
            .build()
            .map_err(|e| GatewayError::internal(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            slug: slug.into(),
            base_url: base_url.into(),
            api_key: SecretString::new(api_key.into()),
            timeout,
            client,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }

    fn build_body(&self, request: &GatewayRequest, model: &str, stream: bool) -> AnthropicRequest {
        let mut system = Vec::new();
        let mut messages = Vec::new();

        for message in &request.messages {
            let text = message.text_content();
            match message.role {
                // Anthropic takes system text out-of-band
                MessageRole::System | MessageRole::Developer => system.push(text),
                MessageRole::Assistant => messages.push(AnthropicMessage {
                    role: "assistant".to_string(),
                    content: text,
                }),
                _ => messages.push(AnthropicMessage {
                    role: "user".to_string(),
                    content: text,
                }),
            }
        }

        AnthropicRequest {
            model: model.to_string(),
            system: if system.is_empty() {
                None
            } else {
                Some(system.join("\n"))
            },
            messages,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences: request.stop.clone(),
            stream,
        }
    }

    fn headers(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("x-api-key", self.api_key.expose_secret().as_str())
            .header("anthropic-version", ANTHROPIC_VERSION)
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn slug(&self) -> &str {
        &self.slug
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn request(
        &self,
        request: &GatewayRequest,
        model: &str,
    ) -> GatewayResult<ChatCompletion> {
        let body = self.build_body(request, model, false);

        debug!(provider = %self.slug, model = %model, "Sending messages request");

        let response = self
            .headers(self.client.post(self.endpoint()))
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport(&self.slug, &e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| map_transport(&self.slug, &e))?;

        if !status.is_success() {
            return Err(map_status(&self.slug, status.as_u16(), &text));
        }

        let upstream: AnthropicResponse = serde_json::from_str(&text).map_err(|e| {
            GatewayError::upstream(
                &self.slug,
                format!("invalid response JSON: {e}"),
                relay_core::ErrorKind::Upstream5xx,
                Some(status.as_u16()),
            )
        })?;

        let content: String = upstream
            .content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect();

        Ok(ChatCompletion {
            id: upstream.id,
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage::assistant(content),
                finish_reason: upstream
                    .stop_reason
                    .as_deref()
                    .map(FinishReason::normalize),
            }],
            usage: Usage::new(upstream.usage.input_tokens, upstream.usage.output_tokens),
            gateway_usage: None,
        })
    }

    async fn request_stream(
        &self,
        request: &GatewayRequest,
        model: &str,
    ) -> GatewayResult<BoxStream<'static, ChunkEvent>> {
        let body = self.build_body(request, model, true);

        debug!(provider = %self.slug, model = %model, "Opening messages stream");

        let response = self
            .headers(self.client.post(self.endpoint()))
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport(&self.slug, &e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_status(&self.slug, status.as_u16(), &text));
        }

        let slug = self.slug.clone();
        let stream = stream! {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut input_tokens: u32 = 0;

            while let Some(chunk) = byte_stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        yield ChunkEvent::Error {
                            message: format!("{slug} stream error: {e}"),
                        };
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(pos) = buffer.find("\n\n") {
                    let event = buffer[..pos].to_string();
                    buffer = buffer[pos + 2..].to_string();

                    for line in event.lines() {
                        let Some(data) = line.strip_prefix("data:").map(str::trim_start) else {
                            continue;
                        };
                        match serde_json::from_str::<serde_json::Value>(data) {
                            Ok(value) => {
                                for decoded in decode_anthropic_event(&value, &mut input_tokens) {
                                    yield decoded;
                                }
                                if value.get("type").and_then(|t| t.as_str())
                                    == Some("message_stop")
                                {
                                    return;
                                }
                            }
                            Err(e) => {
                                trace!(provider = %slug, error = %e, "Skipping undecodable event");
                            }
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Decode one Anthropic typed event into canonical chunk events.
///
/// `input_tokens` carries the prompt count from `message_start` forward to
/// the `message_delta` that closes the stream with output usage.
#[must_use]
pub fn decode_anthropic_event(value: &serde_json::Value, input_tokens: &mut u32) -> Vec<ChunkEvent> {
    let mut events = Vec::new();
    let event_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");

    match event_type {
        "message_start" => {
            if let Some(tokens) = value
                .pointer("/message/usage/input_tokens")
                .and_then(|v| v.as_u64())
            {
                *input_tokens = tokens as u32;
            }
            events.push(ChunkEvent::Role {
                index: 0,
                role: MessageRole::Assistant,
            });
        }
        "content_block_delta" => {
            if let Some(delta) = value.get("delta") {
                if let Some(text) = delta.get("text").and_then(|t| t.as_str()) {
                    if !text.is_empty() {
                        events.push(ChunkEvent::Content {
                            index: 0,
                            text: text.to_string(),
                        });
                    }
                }
                if let Some(thinking) = delta.get("thinking").and_then(|t| t.as_str()) {
                    if !thinking.is_empty() {
                        events.push(ChunkEvent::Reasoning {
                            index: 0,
                            text: thinking.to_string(),
                        });
                    }
                }
            }
        }
        "message_delta" => {
            if let Some(reason) = value
                .pointer("/delta/stop_reason")
                .and_then(|r| r.as_str())
            {
                events.push(ChunkEvent::Finish {
                    index: 0,
                    reason: FinishReason::normalize(reason),
                });
            }
            if let Some(output) = value
                .pointer("/usage/output_tokens")
                .and_then(|v| v.as_u64())
            {
                events.push(ChunkEvent::Usage(Usage::new(
                    *input_tokens,
                    output as u32,
                )));
            }
        }
        "error" => {
            let message = value
                .pointer("/error/message")
                .and_then(|m| m.as_str())
                .unwrap_or("upstream error");
            events.push(ChunkEvent::Error {
                message: message.to_string(),
            });
        }
        // ping, content_block_start, content_block_stop, message_stop
        _ => {}
    }

    events
}

// Anthropic wire types

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    id: String,
    #[serde(default)]
    content: Vec<AnthropicContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_start_captures_input_tokens() {
        let mut input = 0;
        let events = decode_anthropic_event(
            &serde_json::json!({
                "type": "message_start",
                "message": {"usage": {"input_tokens": 12}}
            }),
            &mut input,
        );
        assert_eq!(input, 12);
        assert!(matches!(events[0], ChunkEvent::Role { .. }));
    }

    #[test]
    fn content_block_delta_decodes_text_and_thinking() {
        let mut input = 0;
        let events = decode_anthropic_event(
            &serde_json::json!({
                "type": "content_block_delta",
                "delta": {"type": "text_delta", "text": "Hello"}
            }),
            &mut input,
        );
        assert!(matches!(&events[0], ChunkEvent::Content { text, .. } if text == "Hello"));

        let events = decode_anthropic_event(
            &serde_json::json!({
                "type": "content_block_delta",
                "delta": {"type": "thinking_delta", "thinking": "consider..."}
            }),
            &mut input,
        );
        assert!(matches!(&events[0], ChunkEvent::Reasoning { text, .. } if text == "consider..."));
    }

    #[test]
    fn message_delta_yields_finish_and_usage() {
        let mut input = 12;
        let events = decode_anthropic_event(
            &serde_json::json!({
                "type": "message_delta",
                "delta": {"stop_reason": "end_turn"},
                "usage": {"output_tokens": 40}
            }),
            &mut input,
        );
        assert!(matches!(
            events[0],
            ChunkEvent::Finish {
                reason: FinishReason::Stop,
                ..
            }
        ));
        assert!(matches!(
            events[1],
            ChunkEvent::Usage(u) if u.prompt_tokens == 12 && u.completion_tokens == 40
        ));
    }

    #[test]
    fn max_tokens_stop_reason_maps_to_length() {
        let mut input = 0;
        let events = decode_anthropic_event(
            &serde_json::json!({
                "type": "message_delta",
                "delta": {"stop_reason": "max_tokens"}
            }),
            &mut input,
        );
        assert!(matches!(
            events[0],
            ChunkEvent::Finish {
                reason: FinishReason::Length,
                ..
            }
        ));
    }

    #[test]
    fn ping_events_are_ignored() {
        let mut input = 0;
        assert!(decode_anthropic_event(&serde_json::json!({"type": "ping"}), &mut input).is_empty());
    }
}
