//! Generic adapter for OpenAI-compatible providers.
//!
//! Most upstream providers speak the OpenAI chat-completion dialect with a
//! different base URL and credential; they differ in details small enough
//! to parameterize. One instance of this adapter per provider slug covers
//! all of them.

use async_stream::stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures_util::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, trace};

use relay_core::{
    ChatCompletion, Choice, ChunkEvent, FinishReason, GatewayError, GatewayRequest, GatewayResult,
    MessageRole, ResponseMessage, Usage,
};

use crate::adapter::ProviderAdapter;
use crate::error::{map_status, map_transport};

/// Field names providers use for chain-of-thought deltas
const REASONING_FIELDS: &[&str] = &[
    "reasoning",
    "reasoning_content",
    "thinking",
    "analysis",
    "inner_thought",
    "thoughts",
    "thought",
    "chain_of_thought",
    "cot",
];

/// Configuration for one OpenAI-compatible provider
#[derive(Debug, Clone)]
pub struct OpenAiCompatConfig {
    /// Provider slug
    pub slug: String,
    /// API base URL (e.g. `https://openrouter.ai/api/v1`)
    pub base_url: String,
    /// Bearer credential, when the provider requires one
    pub api_key: Option<SecretString>,
    /// Call deadline
    pub timeout: Duration,
}

impl OpenAiCompatConfig {
    /// Create a config with the default timeout
    #[must_use]
    pub fn new(slug: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            base_url: base_url.into(),
            api_key: None,
            timeout: Duration::from_secs(30),
        }
    }

    /// Set the credential
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::new(api_key.into()));
        self
    }

    /// Set the timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Adapter for any OpenAI-compatible provider
pub struct OpenAiCompatAdapter {
    config: OpenAiCompatConfig,
    client: reqwest::Client,
}

impl OpenAiCompatAdapter {
    /// Create an adapter.
    ///
    /// # Errors
    /// Returns an error when the HTTP client cannot be constructed.
    pub fn new(config: OpenAiCompatConfig) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(100)
            .build()
            .map_err(|e| GatewayError::internal(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    /// Build the upstream body: the gateway request with the rewritten
    /// model id, minus gateway-internal fields.
    fn build_body(&self, request: &GatewayRequest, model: &str, stream: bool) -> serde_json::Value {
        let mut body = serde_json::to_value(request).unwrap_or_else(|_| serde_json::json!({}));
        if let Some(map) = body.as_object_mut() {
            map.insert("model".to_string(), serde_json::json!(model));
            map.insert("stream".to_string(), serde_json::json!(stream));
            map.remove("provider");
            if stream {
                map.insert(
                    "stream_options".to_string(),
                    serde_json::json!({"include_usage": true}),
                );
            } else {
                map.remove("stream_options");
            }
        }
        body
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => builder.bearer_auth(key.expose_secret()),
            None => builder,
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatAdapter {
    fn slug(&self) -> &str {
        &self.config.slug
    }

    fn timeout(&self) -> Duration {
        self.config.timeout
    }

    async fn request(
        &self,
        request: &GatewayRequest,
        model: &str,
    ) -> GatewayResult<ChatCompletion> {
        let url = self.endpoint();
        let body = self.build_body(request, model, false);

        debug!(provider = %self.config.slug, model = %model, "Sending chat completion request");

        let response = self
            .authorize(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport(&self.config.slug, &e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| map_transport(&self.config.slug, &e))?;

        trace!(provider = %self.config.slug, status = %status, "Received upstream response");

        if !status.is_success() {
            return Err(map_status(&self.config.slug, status.as_u16(), &text));
        }

        let upstream: UpstreamCompletion = serde_json::from_str(&text).map_err(|e| {
            GatewayError::upstream(
                &self.config.slug,
                format!("invalid response JSON: {e}"),
                relay_core::ErrorKind::Upstream5xx,
                Some(status.as_u16()),
            )
        })?;

        Ok(upstream.into_completion(model))
    }

    async fn request_stream(
        &self,
        request: &GatewayRequest,
        model: &str,
    ) -> GatewayResult<BoxStream<'static, ChunkEvent>> {
        let url = self.endpoint();
        let body = self.build_body(request, model, true);

        debug!(provider = %self.config.slug, model = %model, "Opening chat completion stream");

        let response = self
            .authorize(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport(&self.config.slug, &e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_status(&self.config.slug, status.as_u16(), &text));
        }

        let slug = self.config.slug.clone();
        let stream = stream! {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();

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
                        if data == "[DONE]" {
                            return;
                        }
                        match serde_json::from_str::<serde_json::Value>(data) {
                            Ok(value) => {
                                for decoded in decode_openai_chunk(&value) {
                                    yield decoded;
                                }
                            }
                            Err(e) => {
                                trace!(provider = %slug, error = %e, "Skipping undecodable chunk");
                            }
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Decode one OpenAI-shape chunk JSON into canonical events.
///
/// Handles the `choices[].delta` family plus the flat `text` fallback some
/// providers use, and surfaces reasoning under any of the common field
/// names as its own event.
#[must_use]
pub fn decode_openai_chunk(value: &serde_json::Value) -> Vec<ChunkEvent> {
    let mut events = Vec::new();

    if let Some(choices) = value.get("choices").and_then(|c| c.as_array()) {
        for choice in choices {
            let index = choice.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as u32;
            let delta = choice.get("delta").filter(|d| d.is_object());

            if let Some(role) = delta
                .and_then(|d| d.get("role"))
                .and_then(|r| r.as_str())
                .and_then(parse_role)
            {
                events.push(ChunkEvent::Role { index, role });
            }

            let content = delta
                .and_then(|d| d.get("content"))
                .and_then(|c| c.as_str())
                .filter(|c| !c.is_empty())
                // Flat `text` fallback used by a few providers
                .or_else(|| {
                    choice
                        .get("text")
                        .and_then(|t| t.as_str())
                        .filter(|t| !t.is_empty())
                });
            if let Some(text) = content {
                events.push(ChunkEvent::Content {
                    index,
                    text: text.to_string(),
                });
            }

            let reasoning = delta
                .and_then(extract_reasoning)
                .or_else(|| extract_reasoning(choice));
            if let Some(text) = reasoning {
                events.push(ChunkEvent::Reasoning { index, text });
            }

            if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
                events.push(ChunkEvent::Finish {
                    index,
                    reason: FinishReason::normalize(reason),
                });
            }
        }
    }

    if let Some(usage) = value.get("usage").and_then(decode_usage) {
        events.push(ChunkEvent::Usage(usage));
    }

    events
}

fn extract_reasoning(value: &serde_json::Value) -> Option<String> {
    REASONING_FIELDS.iter().find_map(|field| {
        value
            .get(field)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(String::from)
    })
}

fn decode_usage(value: &serde_json::Value) -> Option<Usage> {
    let prompt = value.get("prompt_tokens")?.as_u64()? as u32;
    let completion = value
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as u32;
    Some(Usage::new(prompt, completion))
}

fn parse_role(role: &str) -> Option<MessageRole> {
    match role {
        "system" => Some(MessageRole::System),
        "user" => Some(MessageRole::User),
        "assistant" => Some(MessageRole::Assistant),
        "tool" => Some(MessageRole::Tool),
        _ => None,
    }
}

// Upstream wire types

#[derive(Debug, Deserialize)]
struct UpstreamCompletion {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    choices: Vec<UpstreamChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct UpstreamChoice {
    #[serde(default)]
    index: u32,
    message: UpstreamMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpstreamMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<serde_json::Value>>,
}

impl UpstreamCompletion {
    fn into_completion(self, model: &str) -> ChatCompletion {
        ChatCompletion {
            id: self
                .id
                .unwrap_or_else(|| format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())),
            object: "chat.completion".to_string(),
            created: self.created.unwrap_or_else(|| chrono::Utc::now().timestamp()),
            model: model.to_string(),
            choices: self
                .choices
                .into_iter()
                .map(|choice| Choice {
                    index: choice.index,
                    message: ResponseMessage {
                        role: MessageRole::Assistant,
                        content: choice.message.content,
                        reasoning_content: choice
                            .message
                            .reasoning_content
                            .or(choice.message.reasoning),
                        tool_calls: choice.message.tool_calls,
                    },
                    finish_reason: choice
                        .finish_reason
                        .as_deref()
                        .map(FinishReason::normalize),
                })
                .collect(),
            usage: self.usage.unwrap_or_default(),
            gateway_usage: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::ChatMessage;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> GatewayRequest {
        GatewayRequest::new("gpt-4", vec![ChatMessage::user("Hi")])
    }

    #[test]
    fn decode_content_and_finish() {
        let chunk = serde_json::json!({
            "choices": [
                {"index": 0, "delta": {"role": "assistant", "content": "Hel"}, "finish_reason": null},
            ]
        });
        let events = decode_openai_chunk(&chunk);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ChunkEvent::Role { index: 0, .. }));
        assert!(
            matches!(&events[1], ChunkEvent::Content { index: 0, text } if text == "Hel")
        );

        let last = serde_json::json!({
            "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 7, "total_tokens": 12}
        });
        let events = decode_openai_chunk(&last);
        assert!(matches!(
            events[0],
            ChunkEvent::Finish {
                reason: FinishReason::Stop,
                ..
            }
        ));
        assert!(matches!(events[1], ChunkEvent::Usage(u) if u.prompt_tokens == 5));
    }

    #[test]
    fn decode_reasoning_field_variants() {
        for field in ["reasoning", "reasoning_content", "thinking"] {
            let chunk = serde_json::json!({
                "choices": [{"index": 0, "delta": {field: "hmm"}}]
            });
            let events = decode_openai_chunk(&chunk);
            assert!(
                matches!(&events[0], ChunkEvent::Reasoning { text, .. } if text == "hmm"),
                "field {field} not decoded"
            );
        }
    }

    #[test]
    fn decode_flat_text_fallback() {
        let chunk = serde_json::json!({
            "choices": [{"index": 0, "text": "fragment"}]
        });
        let events = decode_openai_chunk(&chunk);
        assert!(matches!(&events[0], ChunkEvent::Content { text, .. } if text == "fragment"));
    }

    #[test]
    fn decode_preserves_choice_indices() {
        let chunk = serde_json::json!({
            "choices": [
                {"index": 0, "delta": {"content": "a"}},
                {"index": 1, "delta": {"content": "b"}},
            ]
        });
        let events = decode_openai_chunk(&chunk);
        assert!(matches!(events[0], ChunkEvent::Content { index: 0, .. }));
        assert!(matches!(events[1], ChunkEvent::Content { index: 1, .. }));
    }

    #[tokio::test]
    async fn non_streaming_roundtrip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(
                serde_json::json!({"model": "provider/gpt-4", "stream": false}),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "chatcmpl-abc",
                "created": 1_700_000_000,
                "model": "provider/gpt-4",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "Hello!"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
            })))
            .mount(&server)
            .await;

        let adapter = OpenAiCompatAdapter::new(
            OpenAiCompatConfig::new("test", server.uri()).with_api_key("sk-test"),
        )
        .expect("adapter");

        let completion = adapter
            .request(&request(), "provider/gpt-4")
            .await
            .expect("completion");
        assert_eq!(completion.first_content(), Some("Hello!"));
        assert_eq!(completion.usage.total_tokens, 5);
        // Canonical id restored on the way out
        assert_eq!(completion.model, "provider/gpt-4");
    }

    #[tokio::test]
    async fn upstream_503_maps_to_5xx_kind() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(503)
                    .set_body_json(serde_json::json!({"error": {"message": "overloaded"}})),
            )
            .mount(&server)
            .await;

        let adapter =
            OpenAiCompatAdapter::new(OpenAiCompatConfig::new("test", server.uri())).expect("adapter");

        let err = adapter.request(&request(), "gpt-4").await.expect_err("error");
        assert_eq!(err.kind(), relay_core::ErrorKind::Upstream5xx);
        assert!(err.kind().is_failover());
    }

    #[tokio::test]
    async fn streaming_decodes_sse() {
        let server = MockServer::start().await;
        let sse_body = concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hi\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\" there\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}],",
            "\"usage\":{\"prompt_tokens\":2,\"completion_tokens\":3,\"total_tokens\":5}}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw(sse_body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let adapter =
            OpenAiCompatAdapter::new(OpenAiCompatConfig::new("test", server.uri())).expect("adapter");

        let stream = adapter
            .request_stream(&request(), "gpt-4")
            .await
            .expect("stream");
        let events: Vec<ChunkEvent> = stream.collect().await;

        let content: String = events
            .iter()
            .filter_map(|e| match e {
                ChunkEvent::Content { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(content, "Hi there");
        assert!(events
            .iter()
            .any(|e| matches!(e, ChunkEvent::Usage(u) if u.total_tokens == 5)));
    }

    #[tokio::test]
    async fn empty_upstream_stream_yields_no_events() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw("data: [DONE]\n\n", "text/event-stream"),
            )
            .mount(&server)
            .await;

        let adapter =
            OpenAiCompatAdapter::new(OpenAiCompatConfig::new("test", server.uri())).expect("adapter");

        let stream = adapter
            .request_stream(&request(), "m-empty")
            .await
            .expect("stream");
        let events: Vec<ChunkEvent> = stream.collect().await;
        assert!(events.is_empty());
    }
}
