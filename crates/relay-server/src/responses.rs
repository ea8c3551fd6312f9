//! The `/v1/responses` endpoint.
//!
//! Same lifecycle as `/v1/chat/completions` with a different surface:
//! `input` instead of `messages` on the way in, `output` items instead of
//! `choices` on the way out, and a typed event stream
//! (`response.created` ... `response.completed`) where every event carries
//! a monotonically increasing `sequence_number`.

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::info;

use relay_core::{
    ChatMessage, ChunkEvent, GatewayError, GatewayRequest, MessageContent, MessageRole, RequestId,
    ResponseFormat,
};
use relay_streaming::{sse, StreamNormalizer};

use crate::admission::admit;
use crate::chat::{
    apply_rate_headers, open_stream, prepare, run_non_streaming, ChatQuery, StreamEnd, StreamGuard,
};
use crate::error::ApiError;
use crate::extractors::{ApiKey, ClientIp};
use crate::state::AppState;

/// Request body for `/v1/responses`
#[derive(Debug, Deserialize)]
pub struct ResponsesRequest {
    /// Canonical model id
    pub model: String,
    /// Input: a bare string or a list of input messages
    pub input: ResponsesInput,
    /// Maximum output tokens
    #[serde(default, alias = "max_tokens")]
    pub max_output_tokens: Option<u32>,
    /// Sampling temperature
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Nucleus sampling parameter
    #[serde(default)]
    pub top_p: Option<f32>,
    /// Structured output configuration
    #[serde(default)]
    pub response_format: Option<ResponseFormat>,
    /// Enable streaming
    #[serde(default)]
    pub stream: bool,
    /// Gateway provider hint
    #[serde(default)]
    pub provider: Option<String>,
}

/// Input shape: plain text or structured messages
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ResponsesInput {
    /// A single user turn
    Text(String),
    /// Structured input messages
    Messages(Vec<InputMessage>),
}

/// One structured input message
#[derive(Debug, Deserialize)]
pub struct InputMessage {
    /// Author role
    pub role: MessageRole,
    /// Text or typed parts
    pub content: InputContent,
}

/// Structured input content
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum InputContent {
    /// Plain text
    Text(String),
    /// Typed parts (`input_text` and friends)
    Parts(Vec<InputPart>),
}

/// One typed input part
#[derive(Debug, Deserialize)]
pub struct InputPart {
    /// Part type, e.g. "input_text"
    #[serde(rename = "type")]
    pub part_type: String,
    /// Text payload for text parts
    #[serde(default)]
    pub text: Option<String>,
}

impl ResponsesRequest {
    /// Lower the responses surface onto the chat-completion request the
    /// rest of the lifecycle speaks.
    ///
    /// # Errors
    /// Returns a validation error for input shapes with no usable text.
    pub fn into_gateway_request(self) -> Result<GatewayRequest, GatewayError> {
        let messages = match self.input {
            ResponsesInput::Text(text) => vec![ChatMessage::user(text)],
            ResponsesInput::Messages(input) => input
                .into_iter()
                .map(|message| {
                    let text = match message.content {
                        InputContent::Text(text) => text,
                        InputContent::Parts(parts) => parts
                            .into_iter()
                            .filter(|part| part.part_type == "input_text")
                            .filter_map(|part| part.text)
                            .collect::<Vec<_>>()
                            .join(" "),
                    };
                    ChatMessage {
                        role: message.role,
                        content: MessageContent::Text(text),
                        name: None,
                        tool_calls: None,
                        tool_call_id: None,
                    }
                })
                .collect(),
        };

        let mut request = GatewayRequest::new(self.model, messages);
        request.max_tokens = self.max_output_tokens;
        request.temperature = self.temperature;
        request.top_p = self.top_p;
        request.response_format = self.response_format;
        request.stream = self.stream;
        request.provider = self.provider;
        request.validate()?;
        Ok(request)
    }
}

/// POST /v1/responses
pub async fn unified_responses(
    State(state): State<AppState>,
    ApiKey(api_key): ApiKey,
    ClientIp(ip): ClientIp,
    Query(query): Query<ChatQuery>,
    payload: Result<Json<ResponsesRequest>, JsonRejection>,
) -> Response {
    let request_id = RequestId::generate();

    let Json(body) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return ApiError::new(
                GatewayError::validation(
                    format!("invalid request body: {rejection}"),
                    None,
                    "invalid_json",
                ),
                request_id,
            )
            .into_response();
        }
    };

    let request = match body.into_gateway_request() {
        Ok(request) => request,
        Err(error) => return ApiError::new(error, request_id).into_response(),
    };

    match handle_responses(state, api_key, ip, query.session_id, request, request_id).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    }
}

async fn handle_responses(
    state: AppState,
    api_key: Option<String>,
    ip: String,
    session_id: Option<i64>,
    request: GatewayRequest,
    request_id: RequestId,
) -> Result<Response, ApiError> {
    info!(
        request_id = %request_id,
        model = %request.model,
        stream = request.stream,
        "Responses request started"
    );

    let admission = admit(&state, api_key, ip, &request, &request_id).await?;
    let plan = prepare(&state, request, &admission, session_id, &request_id).await?;

    if plan.request.stream {
        let (job, upstream, decision) = open_stream(&state, plan, admission, request_id).await?;
        Ok(build_responses_stream(job, upstream, decision))
    } else {
        let (completion, decision) =
            run_non_streaming(state, plan, admission, request_id.clone()).await?;

        let text = completion.first_content().unwrap_or_default().to_string();
        let body = json!({
            "id": format!("resp_{}", uuid::Uuid::new_v4().simple()),
            "object": "response",
            "created_at": completion.created,
            "status": "completed",
            "model": completion.model,
            "output": [output_item(&format!("msg_{}", uuid::Uuid::new_v4().simple()), &text)],
            "usage": {
                "input_tokens": completion.usage.prompt_tokens,
                "output_tokens": completion.usage.completion_tokens,
                "total_tokens": completion.usage.total_tokens,
            },
            "gateway_usage": completion.gateway_usage,
        });

        let mut response = Json(body).into_response();
        apply_rate_headers(&mut response, decision.as_ref());
        Ok(response)
    }
}

fn output_item(item_id: &str, text: &str) -> serde_json::Value {
    json!({
        "type": "message",
        "id": item_id,
        "role": "assistant",
        "status": "completed",
        "content": [{"type": "output_text", "text": text}],
    })
}

fn build_responses_stream(
    job: crate::chat::StreamJob,
    upstream: futures::stream::BoxStream<'static, ChunkEvent>,
    decision: Option<relay_limits::Decision>,
) -> Response {
    let provider = job.provider.clone();
    let model = job.canonical_model.clone();
    let caller = job.caller.clone();
    let prompt_chars = job.prompt_chars;
    let store = job.state.store().clone();

    let normalizer = Arc::new(Mutex::new(Some(StreamNormalizer::new(
        provider.clone(),
        model.clone(),
    ))));
    let mut guard = StreamGuard::new(job, Arc::clone(&normalizer));

    let response_id = format!("resp_{}", uuid::Uuid::new_v4().simple());
    let item_id = format!("msg_{}", uuid::Uuid::new_v4().simple());
    let created_at = chrono::Utc::now().timestamp();

    let body_stream = async_stream::stream! {
        let mut upstream = upstream;
        let mut seq: u64 = 0;
        fn next(seq: &mut u64) -> u64 {
            let current = *seq;
            *seq += 1;
            current
        }

        yield Ok::<_, Infallible>(Bytes::from(sse::typed_event_frame(
            "response.created",
            &json!({
                "type": "response.created",
                "sequence_number": next(&mut seq),
                "response": {
                    "id": response_id,
                    "object": "response",
                    "created_at": created_at,
                    "status": "in_progress",
                    "model": model,
                },
            }),
        )));
        yield Ok(Bytes::from(sse::typed_event_frame(
            "response.output_item.added",
            &json!({
                "type": "response.output_item.added",
                "sequence_number": next(&mut seq),
                "output_index": 0,
                "item": {
                    "type": "message",
                    "id": item_id,
                    "role": "assistant",
                    "status": "in_progress",
                    "content": [],
                },
            }),
        )));

        let mut upstream_error = false;
        while let Some(event) = upstream.next().await {
            if let ChunkEvent::Error { message } = &event {
                yield Ok(Bytes::from(sse::typed_event_frame(
                    "error",
                    &json!({
                        "type": "error",
                        "sequence_number": next(&mut seq),
                        "message": message,
                        "provider": provider,
                    }),
                )));
                upstream_error = true;
                break;
            }

            let delta = match &event {
                ChunkEvent::Content { index: 0, text } => Some(text.clone()),
                _ => None,
            };
            {
                let mut lock = normalizer.lock();
                if let Some(n) = lock.as_mut() {
                    n.on_event(event);
                }
            }
            if let Some(delta) = delta {
                yield Ok(Bytes::from(sse::typed_event_frame(
                    "response.output_text.delta",
                    &json!({
                        "type": "response.output_text.delta",
                        "sequence_number": next(&mut seq),
                        "item_id": item_id,
                        "output_index": 0,
                        "content_index": 0,
                        "delta": delta,
                    }),
                )));
            }
        }

        let (chunk_count, text, usage_now) = {
            let lock = normalizer.lock();
            lock.as_ref().map_or((0, String::new(), relay_core::Usage::default()), |n| {
                (
                    n.chunk_count(),
                    n.accumulated_content().to_string(),
                    n.current_usage(prompt_chars),
                )
            })
        };

        if chunk_count == 0 && !upstream_error {
            yield Ok(Bytes::from(sse::typed_event_frame(
                "error",
                &json!({
                    "type": "error",
                    "sequence_number": next(&mut seq),
                    "message": format!("Provider returned empty stream for model {model}"),
                    "error_type": "empty_stream_error",
                    "provider": provider,
                }),
            )));
            yield Ok(Bytes::from(sse::typed_event_frame(
                "response.completed",
                &json!({
                    "type": "response.completed",
                    "sequence_number": next(&mut seq),
                    "response": {"id": response_id, "status": "failed"},
                }),
            )));
            guard.finish(StreamEnd::Empty);
            return;
        }

        if upstream_error {
            yield Ok(Bytes::from(sse::typed_event_frame(
                "response.completed",
                &json!({
                    "type": "response.completed",
                    "sequence_number": next(&mut seq),
                    "response": {"id": response_id, "status": "failed"},
                }),
            )));
            guard.finish(StreamEnd::UpstreamError);
            return;
        }

        // Plan re-check with the real token count before completion
        if let crate::admission::Caller::User { user } = &caller {
            if let Ok(plan_check) = store.check_plan_limits(user.id, usage_now.total_tokens).await {
                if !plan_check.allowed {
                    yield Ok(Bytes::from(sse::typed_event_frame(
                        "error",
                        &json!({
                            "type": "error",
                            "sequence_number": next(&mut seq),
                            "message": format!(
                                "Plan limit exceeded: {}",
                                plan_check.reason.unwrap_or_else(|| "unknown".to_string())
                            ),
                            "error_type": "plan_limit_exceeded",
                        }),
                    )));
                    guard.discard();
                    return;
                }
            }
        }

        yield Ok(Bytes::from(sse::typed_event_frame(
            "response.output_text.done",
            &json!({
                "type": "response.output_text.done",
                "sequence_number": next(&mut seq),
                "item_id": item_id,
                "output_index": 0,
                "content_index": 0,
                "text": text,
            }),
        )));
        yield Ok(Bytes::from(sse::typed_event_frame(
            "response.output_item.done",
            &json!({
                "type": "response.output_item.done",
                "sequence_number": next(&mut seq),
                "output_index": 0,
                "item": output_item(&item_id, &text),
            }),
        )));
        yield Ok(Bytes::from(sse::typed_event_frame(
            "response.completed",
            &json!({
                "type": "response.completed",
                "sequence_number": next(&mut seq),
                "response": {
                    "id": response_id,
                    "object": "response",
                    "status": "completed",
                    "model": model,
                    "usage": {
                        "input_tokens": usage_now.prompt_tokens,
                        "output_tokens": usage_now.completion_tokens,
                        "total_tokens": usage_now.total_tokens,
                    },
                },
            }),
        )));
        guard.finish(StreamEnd::Complete);
    };

    let mut response = Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| Response::new(Body::empty()));
    apply_rate_headers(&mut response, decision.as_ref());
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_input_becomes_user_message() {
        let body: ResponsesRequest = serde_json::from_value(json!({
            "model": "gpt-4",
            "input": "Hello there",
        }))
        .expect("deserialize");

        let request = body.into_gateway_request().expect("convert");
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.messages[0].role, MessageRole::User);
        assert_eq!(request.messages[0].text_content(), "Hello there");
    }

    #[test]
    fn structured_input_parts_flattened() {
        let body: ResponsesRequest = serde_json::from_value(json!({
            "model": "gpt-4",
            "input": [
                {"role": "system", "content": "Be terse"},
                {"role": "user", "content": [
                    {"type": "input_text", "text": "What"},
                    {"type": "input_text", "text": "time?"},
                ]},
            ],
            "max_output_tokens": 64,
        }))
        .expect("deserialize");

        let request = body.into_gateway_request().expect("convert");
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[1].text_content(), "What time?");
        assert_eq!(request.max_tokens, Some(64));
    }

    #[test]
    fn empty_input_rejected() {
        let body: ResponsesRequest = serde_json::from_value(json!({
            "model": "gpt-4",
            "input": [],
        }))
        .expect("deserialize");
        assert!(body.into_gateway_request().is_err());
    }

    #[test]
    fn json_schema_response_format_accepted() {
        let body: ResponsesRequest = serde_json::from_value(json!({
            "model": "gpt-4",
            "input": "extract",
            "response_format": {"type": "json_schema", "json_schema": {"name": "x"}},
        }))
        .expect("deserialize");
        let request = body.into_gateway_request().expect("convert");
        assert_eq!(
            request.response_format.map(|f| f.format_type),
            Some("json_schema".to_string())
        );
    }
}
