//! Google Gemini adapter.
//!
//! Gemini returns a candidates array with nested content parts instead of
//! choices, takes the system prompt as `systemInstruction`, and streams
//! over SSE when `alt=sse` is requested.

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

/// Adapter for the Gemini generateContent API
pub struct GeminiAdapter {
    slug: String,
    base_url: String,
    api_key: SecretString,
    timeout: Duration,
    client: reqwest::Client,
}

impl GeminiAdapter {
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

    fn endpoint(&self, model: &str, streaming: bool) -> String {
        let action = if streaming {
            "streamGenerateContent?alt=sse&key="
        } else {
            "generateContent?key="
        };
        format!(
            "{}/models/{}:{}{}",
            self.base_url.trim_end_matches('/'),
            model,
            action,
            self.api_key.expose_secret()
        )
    }

    fn build_body(&self, request: &GatewayRequest) -> GeminiRequest {
        let mut contents = Vec::new();
        let mut system_parts = Vec::new();

        for message in &request.messages {
            let text = message.text_content();
            match message.role {
                MessageRole::System | MessageRole::Developer => {
                    system_parts.push(GeminiPart { text });
                }
                MessageRole::Assistant => contents.push(GeminiContent {
                    role: Some("model".to_string()),
                    parts: vec![GeminiPart { text }],
                }),
                _ => contents.push(GeminiContent {
                    role: Some("user".to_string()),
                    parts: vec![GeminiPart { text }],
                }),
            }
        }

        GeminiRequest {
            contents,
            system_instruction: if system_parts.is_empty() {
                None
            } else {
                Some(GeminiContent {
                    role: None,
                    parts: system_parts,
                })
            },
            generation_config: Some(GeminiGenerationConfig {
                temperature: request.temperature,
                top_p: request.top_p,
                max_output_tokens: request.max_tokens,
                stop_sequences: request.stop.clone(),
            }),
        }
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
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
        let url = self.endpoint(model, false);
        let body = self.build_body(request);

        debug!(provider = %self.slug, model = %model, "Sending generateContent request");

        let response = self
            .client
            .post(&url)
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

        let upstream: GeminiResponse = serde_json::from_str(&text).map_err(|e| {
            GatewayError::upstream(
                &self.slug,
                format!("invalid response JSON: {e}"),
                relay_core::ErrorKind::Upstream5xx,
                Some(status.as_u16()),
            )
        })?;

        let candidate = upstream.candidates.into_iter().next().ok_or_else(|| {
            GatewayError::upstream(
                &self.slug,
                "no candidates in response",
                relay_core::ErrorKind::Upstream5xx,
                Some(status.as_u16()),
            )
        })?;

        let content: String = candidate
            .content
            .map(|c| c.parts.into_iter().map(|p| p.text).collect())
            .unwrap_or_default();

        let usage = upstream
            .usage_metadata
            .map(|u| Usage::new(u.prompt_token_count, u.candidates_token_count))
            .unwrap_or_default();

        Ok(ChatCompletion {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage::assistant(content),
                finish_reason: candidate
                    .finish_reason
                    .as_deref()
                    .map(FinishReason::normalize),
            }],
            usage,
            gateway_usage: None,
        })
    }

    async fn request_stream(
        &self,
        request: &GatewayRequest,
        model: &str,
    ) -> GatewayResult<BoxStream<'static, ChunkEvent>> {
        let url = self.endpoint(model, true);
        let body = self.build_body(request);

        debug!(provider = %self.slug, model = %model, "Opening streamGenerateContent stream");

        let response = self
            .client
            .post(&url)
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
                                for decoded in decode_gemini_chunk(&value) {
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

/// Decode one Gemini stream chunk into canonical events.
///
/// Text is gathered from each candidate's nested parts; the candidate
/// index keys the choice accumulator so n-best outputs survive.
#[must_use]
pub fn decode_gemini_chunk(value: &serde_json::Value) -> Vec<ChunkEvent> {
    let mut events = Vec::new();

    if let Some(candidates) = value.get("candidates").and_then(|c| c.as_array()) {
        for (position, candidate) in candidates.iter().enumerate() {
            let index = candidate
                .get("index")
                .and_then(|i| i.as_u64())
                .unwrap_or(position as u64) as u32;

            let text: String = candidate
                .pointer("/content/parts")
                .and_then(|parts| parts.as_array())
                .map(|parts| {
                    parts
                        .iter()
                        .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
                        .collect()
                })
                .unwrap_or_default();
            if !text.is_empty() {
                events.push(ChunkEvent::Content { index, text });
            }

            if let Some(reason) = candidate.get("finishReason").and_then(|r| r.as_str()) {
                events.push(ChunkEvent::Finish {
                    index,
                    reason: normalize_gemini_finish(reason),
                });
            }
        }
    }

    if let Some(usage) = value.get("usageMetadata") {
        if let Some(prompt) = usage.get("promptTokenCount").and_then(|v| v.as_u64()) {
            let completion = usage
                .get("candidatesTokenCount")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            events.push(ChunkEvent::Usage(Usage::new(
                prompt as u32,
                completion as u32,
            )));
        }
    }

    events
}

fn normalize_gemini_finish(reason: &str) -> FinishReason {
    match reason {
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" => FinishReason::Error,
        // STOP, OTHER, unknown
        _ => FinishReason::Stop,
    }
}

// Gemini wire types

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_parts_concatenated() {
        let chunk = serde_json::json!({
            "candidates": [{
                "content": {"parts": [{"text": "Hel"}, {"text": "lo"}]},
            }]
        });
        let events = decode_gemini_chunk(&chunk);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ChunkEvent::Content { index: 0, text } if text == "Hello"));
    }

    #[test]
    fn candidate_index_preserved() {
        let chunk = serde_json::json!({
            "candidates": [
                {"index": 0, "content": {"parts": [{"text": "a"}]}},
                {"index": 1, "content": {"parts": [{"text": "b"}]}},
            ]
        });
        let events = decode_gemini_chunk(&chunk);
        assert!(matches!(events[0], ChunkEvent::Content { index: 0, .. }));
        assert!(matches!(events[1], ChunkEvent::Content { index: 1, .. }));
    }

    #[test]
    fn finish_reasons_normalized() {
        let chunk = serde_json::json!({
            "candidates": [{"finishReason": "MAX_TOKENS"}]
        });
        let events = decode_gemini_chunk(&chunk);
        assert!(matches!(
            events[0],
            ChunkEvent::Finish {
                reason: FinishReason::Length,
                ..
            }
        ));

        let chunk = serde_json::json!({
            "candidates": [{"finishReason": "SAFETY"}]
        });
        let events = decode_gemini_chunk(&chunk);
        assert!(matches!(
            events[0],
            ChunkEvent::Finish {
                reason: FinishReason::Error,
                ..
            }
        ));
    }

    #[test]
    fn usage_metadata_decoded() {
        let chunk = serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": "x"}]}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 9}
        });
        let events = decode_gemini_chunk(&chunk);
        assert!(events
            .iter()
            .any(|e| matches!(e, ChunkEvent::Usage(u) if u.prompt_tokens == 7 && u.completion_tokens == 9)));
    }
}
