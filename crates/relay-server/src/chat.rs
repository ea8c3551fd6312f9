//! Chat completion lifecycle.
//!
//! One handler, two exits: a JSON body or an SSE stream. Both share the
//! same admission, chain construction, and failover loop; they differ in
//! when post-flight runs. The non-streaming path commits accounting before
//! responding; the streaming path sends `[DONE]` first and commits in a
//! detached task so the client never waits on the datastore.

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::{header, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use relay_accounting::{compute_cost, PostFlight, SessionAppend};
use relay_core::{
    ChatMessage, ChunkEvent, ErrorKind, GatewayError, GatewayRequest, GatewayUsage, MessageRole,
    RequestId, Usage, UsageEvent,
};
use relay_limits::{rate_limit_headers, ConcurrencyPermit, Decision};
use relay_routing::ProviderStep;
use relay_streaming::{sse, StreamNormalizer, StreamSummary};
use relay_telemetry::RequestMetrics;

use crate::admission::{admit, Admission, Caller};
use crate::error::ApiError;
use crate::extractors::{ApiKey, ClientIp};
use crate::state::AppState;

/// Query parameters for chat completion
#[derive(Debug, Deserialize)]
pub struct ChatQuery {
    /// Chat session to read history from and append this turn to
    pub session_id: Option<i64>,
}

/// POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    ApiKey(api_key): ApiKey,
    ClientIp(ip): ClientIp,
    Query(query): Query<ChatQuery>,
    payload: Result<Json<GatewayRequest>, JsonRejection>,
) -> Response {
    let request_id = RequestId::generate();

    let Json(request) = match payload {
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

    match handle_chat(state, api_key, ip, query.session_id, request, request_id).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    }
}

/// The full lifecycle for one chat completion
pub(crate) async fn handle_chat(
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
        anonymous = api_key.is_none(),
        "Chat completion started"
    );

    let admission = admit(&state, api_key, ip, &request, &request_id).await?;
    let plan = prepare(&state, request, &admission, session_id, &request_id).await?;

    if plan.request.stream {
        handle_streaming(state, plan, admission, request_id).await
    } else {
        handle_non_streaming(state, plan, admission, request_id).await
    }
}

/// A request after PREPARE: history merged, chain built and filtered
pub(crate) struct RequestPlan {
    pub request: GatewayRequest,
    pub canonical_model: String,
    pub chain: Vec<ProviderStep>,
    pub prompt_chars: usize,
    pub session_id: Option<i64>,
    pub last_user_text: Option<String>,
}

/// PREPARE: merge session history, build and filter the failover chain.
pub(crate) async fn prepare(
    state: &AppState,
    mut request: GatewayRequest,
    admission: &Admission,
    session_id: Option<i64>,
    request_id: &RequestId,
) -> Result<RequestPlan, ApiError> {
    let canonical_model = request.model.clone();

    // History is only available to authenticated callers; it is prepended
    // verbatim ahead of the incoming messages
    if let (Some(session_id), Caller::User { user }) = (session_id, &admission.caller) {
        match state.store().get_session(session_id, user.id).await {
            Ok(Some(session)) if !session.messages.is_empty() => {
                let history: Vec<ChatMessage> = session
                    .messages
                    .iter()
                    .map(|m| ChatMessage {
                        role: m.role,
                        content: relay_core::request::MessageContent::Text(m.content.clone()),
                        name: None,
                        tool_calls: None,
                        tool_call_id: None,
                    })
                    .collect();
                debug!(
                    request_id = %request_id,
                    session_id = session_id,
                    injected = history.len(),
                    "Injected session history"
                );
                let mut merged = history;
                merged.append(&mut request.messages);
                request.messages = merged;
            }
            Ok(_) => {}
            Err(e) => {
                // History is best-effort; the request proceeds without it
                warn!(
                    request_id = %request_id,
                    session_id = session_id,
                    error = %e,
                    "Failed to fetch session history"
                );
            }
        }
    }

    let mut chain = state
        .router()
        .build_chain(&canonical_model, request.provider.as_deref());
    chain.retain(|step| state.breakers().is_available(&step.provider, &canonical_model));

    if chain.is_empty() {
        return Err(ApiError::new(
            GatewayError::NoProvider {
                model: canonical_model,
            },
            request_id.clone(),
        ));
    }

    let prompt_chars: usize = request.messages.iter().map(|m| m.content.text_len()).sum();
    let last_user_text = request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::User)
        .map(ChatMessage::text_content);

    Ok(RequestPlan {
        request,
        canonical_model,
        chain,
        prompt_chars,
        session_id,
        last_user_text,
    })
}

fn concurrency_key(admission: &Admission) -> Option<&str> {
    // Trial users bypass concurrency limits; they are metered separately
    if admission.caller.is_trial() {
        None
    } else {
        admission.caller.api_key()
    }
}

fn acquire_permit(
    state: &AppState,
    admission: &Admission,
    request_id: &RequestId,
) -> Result<Option<ConcurrencyPermit>, ApiError> {
    match concurrency_key(admission) {
        Some(key) => state
            .concurrency()
            .acquire(key)
            .map(Some)
            // Saturation fails the request fast; it is not a failover signal
            .map_err(|e| ApiError::new(e, request_id.clone())),
        None => Ok(None),
    }
}

async fn record_attempt_failure(
    state: &AppState,
    step: &ProviderStep,
    canonical_model: &str,
    error: &GatewayError,
    elapsed_ms: u64,
) {
    let kind = error.kind();
    state
        .breakers()
        .record_outcome(&step.provider, canonical_model, false, Some(kind))
        .await;
    state.metrics().record(&RequestMetrics {
        provider: step.provider.clone(),
        model: canonical_model.to_string(),
        latency_ms: elapsed_ms,
        success: false,
        cost: 0.0,
        tokens_input: 0,
        tokens_output: 0,
        error_message: Some(error.to_string()),
    });
}

// =========================================================================
// Non-streaming path
// =========================================================================

async fn handle_non_streaming(
    state: AppState,
    plan: RequestPlan,
    admission: Admission,
    request_id: RequestId,
) -> Result<Response, ApiError> {
    let (completion, decision) = run_non_streaming(state, plan, admission, request_id).await?;
    let mut response = Json(completion).into_response();
    apply_rate_headers(&mut response, decision.as_ref());
    Ok(response)
}

/// DISPATCH + POST-FLIGHT for the non-streaming path. Returns the final
/// completion (canonical model id, gateway usage attached) so each endpoint
/// can shape its own body.
pub(crate) async fn run_non_streaming(
    state: AppState,
    plan: RequestPlan,
    admission: Admission,
    request_id: RequestId,
) -> Result<(relay_core::ChatCompletion, Option<Decision>), ApiError> {
    let started = Instant::now();
    let (completion, provider) = dispatch_chain(&state, &plan, &admission, &request_id).await?;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    finalize_non_streaming(
        state, plan, admission, request_id, completion, provider, elapsed_ms,
    )
    .await
}

/// The failover loop: walk the chain in order, gated by the breaker, one
/// concurrency slot per attempt. Non-failover errors surface immediately.
async fn dispatch_chain(
    state: &AppState,
    plan: &RequestPlan,
    admission: &Admission,
    request_id: &RequestId,
) -> Result<(relay_core::ChatCompletion, String), ApiError> {
    let mut last_error: Option<GatewayError> = None;

    for step in &plan.chain {
        if state
            .breakers()
            .before_call(&step.provider, &plan.canonical_model)
            .is_err()
        {
            debug!(
                request_id = %request_id,
                provider = %step.provider,
                "Circuit open, skipping provider"
            );
            continue;
        }

        let permit = acquire_permit(state, admission, request_id)?;
        let attempt_start = Instant::now();

        let result = state
            .adapters()
            .call(&step.provider, &plan.request, &step.model)
            .await;
        drop(permit);

        match result {
            Ok(completion) => {
                return Ok((completion, step.provider.clone()));
            }
            Err(error) => {
                let elapsed_ms = attempt_start.elapsed().as_millis() as u64;
                record_attempt_failure(state, step, &plan.canonical_model, &error, elapsed_ms)
                    .await;

                if !error.kind().is_failover() {
                    return Err(ApiError::new(error, request_id.clone()));
                }
                warn!(
                    request_id = %request_id,
                    provider = %step.provider,
                    error = %error,
                    "Provider failed, trying next in chain"
                );
                last_error = Some(error);
            }
        }
    }

    Err(ApiError::new(
        last_error.unwrap_or_else(|| GatewayError::NoProvider {
            model: plan.canonical_model.clone(),
        }),
        request_id.clone(),
    ))
}

#[allow(clippy::too_many_arguments)]
async fn finalize_non_streaming(
    state: AppState,
    plan: RequestPlan,
    admission: Admission,
    request_id: RequestId,
    mut completion: relay_core::ChatCompletion,
    provider: String,
    elapsed_ms: u64,
) -> Result<(relay_core::ChatCompletion, Option<Decision>), ApiError> {
    // Providers that report no usage get the character-count estimate
    let usage = if completion.usage.total_tokens > 0 {
        completion.usage
    } else {
        let content_len = completion.first_content().map_or(0, str::len);
        Usage::new(
            plan.prompt_chars.div_ceil(4).max(1) as u32,
            content_len.div_ceil(4).max(1) as u32,
        )
    };

    // Plan re-check with the real token count
    if let Caller::User { user } = &admission.caller {
        match state
            .store()
            .check_plan_limits(user.id, usage.total_tokens)
            .await
        {
            Ok(plan_check) if !plan_check.allowed => {
                return Err(ApiError::new(
                    GatewayError::rate_limited(
                        format!(
                            "plan limit exceeded: {}",
                            plan_check.reason.unwrap_or_else(|| "unknown".to_string())
                        ),
                        None,
                    ),
                    request_id,
                ));
            }
            _ => {}
        }
    }

    let (input_rate, output_rate) = state
        .catalog()
        .load()
        .pricing(&provider, &plan.canonical_model)
        .unwrap_or((0.0, 0.0));
    let cost = compute_cost(
        input_rate,
        output_rate,
        usage.prompt_tokens,
        usage.completion_tokens,
    );

    let is_trial = admission.caller.is_trial();

    match &admission.caller {
        Caller::User { user } => {
            let event = UsageEvent {
                request_id: request_id.clone(),
                user_id: user.id,
                api_key: user.api_key.clone(),
                provider: provider.clone(),
                model: plan.canonical_model.clone(),
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                elapsed_ms,
                cost,
                success: true,
                error_kind: None,
                finish_reason: completion.choices.first().and_then(|c| c.finish_reason),
                timestamp: chrono::Utc::now(),
            };
            let session = plan.session_id.map(|session_id| SessionAppend {
                session_id,
                user_message: plan.last_user_text.clone(),
                assistant_content: completion
                    .first_content()
                    .unwrap_or_default()
                    .to_string(),
            });
            state
                .accounting()
                .commit(PostFlight {
                    event,
                    is_trial,
                    session,
                })
                .await;
        }
        Caller::Anonymous { ip } => {
            state.anonymous().record(ip, &plan.canonical_model).await;
        }
    }

    state.metrics().record(&RequestMetrics {
        provider: provider.clone(),
        model: plan.canonical_model.clone(),
        latency_ms: elapsed_ms,
        success: true,
        cost,
        tokens_input: usage.prompt_tokens,
        tokens_output: usage.completion_tokens,
        error_message: None,
    });
    state
        .breakers()
        .record_outcome(&provider, &plan.canonical_model, true, None)
        .await;

    info!(
        request_id = %request_id,
        provider = %provider,
        duration_ms = elapsed_ms,
        tokens = usage.total_tokens,
        "Chat completion successful"
    );

    // Canonical id on the way out, regardless of what the provider echoed
    completion.model = plan.canonical_model;
    completion.usage = usage;
    completion.gateway_usage = Some(GatewayUsage {
        tokens_charged: usage.total_tokens,
        request_ms: elapsed_ms,
        cost_usd: (!is_trial).then_some((cost * 1e6).round() / 1e6),
    });

    Ok((completion, admission.decision))
}

pub(crate) fn apply_rate_headers(response: &mut Response, decision: Option<&Decision>) {
    if let Some(decision) = decision {
        for (name, value) in rate_limit_headers(decision) {
            if let Ok(value) = HeaderValue::from_str(&value) {
                response.headers_mut().insert(name, value);
            }
        }
    }
}

// =========================================================================
// Streaming path
// =========================================================================

/// How one stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamEnd {
    /// Upstream signalled end-of-stream normally
    Complete,
    /// Upstream delivered zero chunks
    Empty,
    /// Upstream connection dropped mid-stream
    UpstreamError,
    /// Client went away; partial output was delivered
    Cancelled,
}

/// Everything post-flight needs, captured before the stream starts
pub(crate) struct StreamJob {
    pub state: AppState,
    pub request_id: RequestId,
    pub caller: Caller,
    pub canonical_model: String,
    pub provider: String,
    pub session_id: Option<i64>,
    pub last_user_text: Option<String>,
    pub prompt_chars: usize,
    pub started: Instant,
    pub permit: Option<ConcurrencyPermit>,
}

/// Drop guard tying stream termination to post-flight.
///
/// The generator settles it explicitly on every normal exit; if the client
/// disconnects and the body stream is dropped mid-flight, `Drop` settles it
/// as cancelled, so the concurrency slot is released and partial usage is
/// accounted on every path.
pub(crate) struct StreamGuard {
    job: Option<StreamJob>,
    normalizer: Arc<Mutex<Option<StreamNormalizer>>>,
}

impl StreamGuard {
    pub(crate) fn new(job: StreamJob, normalizer: Arc<Mutex<Option<StreamNormalizer>>>) -> Self {
        Self {
            job: Some(job),
            normalizer,
        }
    }

    fn settle(&mut self, end: StreamEnd) {
        let Some(job) = self.job.take() else { return };
        let Some(normalizer) = self.normalizer.lock().take() else {
            return;
        };
        let summary = normalizer.finalize(job.prompt_chars);
        settle_stream(job, &summary, end);
    }

    /// Settle explicitly with the given terminal state
    pub(crate) fn finish(&mut self, end: StreamEnd) {
        self.settle(end);
    }

    /// Drop the job without accounting (plan denial emitted in-stream)
    pub(crate) fn discard(&mut self) {
        self.job.take();
        self.normalizer.lock().take();
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.settle(StreamEnd::Cancelled);
    }
}

fn settle_stream(mut job: StreamJob, summary: &StreamSummary, end: StreamEnd) {
    // Release the slot the moment the stream is over; accounting must not
    // extend the key's concurrency occupancy
    drop(job.permit.take());

    let elapsed_ms = job.started.elapsed().as_millis() as u64;
    let (usage, success, error_kind) = match end {
        StreamEnd::Complete => (summary.usage, true, None),
        StreamEnd::Cancelled => (summary.usage, true, Some(ErrorKind::Cancelled)),
        StreamEnd::UpstreamError => (summary.usage, false, Some(ErrorKind::Network)),
        // Zero chunks means zero delivery; nothing to bill
        StreamEnd::Empty => (Usage::default(), false, Some(ErrorKind::EmptyStream)),
    };

    let (input_rate, output_rate) = job
        .state
        .catalog()
        .load()
        .pricing(&job.provider, &job.canonical_model)
        .unwrap_or((0.0, 0.0));
    let cost = compute_cost(
        input_rate,
        output_rate,
        usage.prompt_tokens,
        usage.completion_tokens,
    );

    job.state.metrics().record(&RequestMetrics {
        provider: job.provider.clone(),
        model: job.canonical_model.clone(),
        latency_ms: elapsed_ms,
        success,
        cost,
        tokens_input: usage.prompt_tokens,
        tokens_output: usage.completion_tokens,
        error_message: match end {
            StreamEnd::Empty => Some("provider returned empty stream".to_string()),
            StreamEnd::UpstreamError => Some("upstream connection dropped".to_string()),
            _ => None,
        },
    });

    if end == StreamEnd::Cancelled {
        debug!(
            request_id = %job.request_id,
            provider = %job.provider,
            tokens = usage.total_tokens,
            "Client disconnected mid-stream, accounting partial usage"
        );
    }

    let finish_reason = summary.finish_reason;
    let assistant_content = summary.content.clone();
    let state = job.state.clone();
    let is_trial = job.caller.is_trial();

    // Post-flight runs detached; the client has its final frame already
    let spawner = state.clone();
    spawner.accounting().tasks().spawn(async move {
        let breaker_success = matches!(end, StreamEnd::Complete | StreamEnd::Cancelled);
        state
            .breakers()
            .record_outcome(
                &job.provider,
                &job.canonical_model,
                breaker_success,
                error_kind,
            )
            .await;

        match &job.caller {
            Caller::Anonymous { ip } => {
                if end == StreamEnd::Complete {
                    state.anonymous().record(ip, &job.canonical_model).await;
                }
            }
            Caller::User { user } => {
                let event = UsageEvent {
                    request_id: job.request_id.clone(),
                    user_id: user.id,
                    api_key: user.api_key.clone(),
                    provider: job.provider.clone(),
                    model: job.canonical_model.clone(),
                    prompt_tokens: usage.prompt_tokens,
                    completion_tokens: usage.completion_tokens,
                    elapsed_ms,
                    cost,
                    success,
                    error_kind,
                    finish_reason,
                    timestamp: chrono::Utc::now(),
                };
                let session = (end == StreamEnd::Complete)
                    .then(|| {
                        job.session_id.map(|session_id| SessionAppend {
                            session_id,
                            user_message: job.last_user_text.clone(),
                            assistant_content: assistant_content.clone(),
                        })
                    })
                    .flatten();
                state
                    .accounting()
                    .commit(PostFlight {
                        event,
                        is_trial,
                        session,
                    })
                    .await;
            }
        }
    });
}

async fn handle_streaming(
    state: AppState,
    plan: RequestPlan,
    admission: Admission,
    request_id: RequestId,
) -> Result<Response, ApiError> {
    let (job, upstream, decision) = open_stream(&state, plan, admission, request_id).await?;
    Ok(build_stream_response(state, job, upstream, decision))
}

/// Walk the chain until a stream is established. Returns the post-flight
/// job (permit attached), the upstream event stream, and the rate-limit
/// decision for response headers.
pub(crate) async fn open_stream(
    state: &AppState,
    plan: RequestPlan,
    admission: Admission,
    request_id: RequestId,
) -> Result<
    (
        StreamJob,
        futures::stream::BoxStream<'static, ChunkEvent>,
        Option<Decision>,
    ),
    ApiError,
> {
    let mut last_error: Option<GatewayError> = None;

    for step in &plan.chain {
        if state
            .breakers()
            .before_call(&step.provider, &plan.canonical_model)
            .is_err()
        {
            continue;
        }

        let permit = acquire_permit(&state, &admission, &request_id)?;
        let attempt_start = Instant::now();

        match state
            .adapters()
            .call_stream(&step.provider, &plan.request, &step.model)
            .await
        {
            Ok(upstream) => {
                let job = StreamJob {
                    state: state.clone(),
                    request_id: request_id.clone(),
                    caller: admission.caller.clone(),
                    canonical_model: plan.canonical_model.clone(),
                    provider: step.provider.clone(),
                    session_id: plan.session_id,
                    last_user_text: plan.last_user_text.clone(),
                    prompt_chars: plan.prompt_chars,
                    started: attempt_start,
                    permit,
                };
                return Ok((job, upstream, admission.decision));
            }
            Err(error) => {
                drop(permit);
                let elapsed_ms = attempt_start.elapsed().as_millis() as u64;
                record_attempt_failure(&state, step, &plan.canonical_model, &error, elapsed_ms)
                    .await;

                if !error.kind().is_failover() {
                    return Err(ApiError::new(error, request_id));
                }
                warn!(
                    request_id = %request_id,
                    provider = %step.provider,
                    error = %error,
                    "Stream open failed, trying next in chain"
                );
                last_error = Some(error);
            }
        }
    }

    Err(ApiError::new(
        last_error.unwrap_or(GatewayError::NoProvider {
            model: plan.canonical_model,
        }),
        request_id,
    ))
}

fn build_stream_response(
    state: AppState,
    job: StreamJob,
    upstream: futures::stream::BoxStream<'static, ChunkEvent>,
    decision: Option<Decision>,
) -> Response {
    let provider = job.provider.clone();
    let model = job.canonical_model.clone();
    let caller = job.caller.clone();
    let prompt_chars = job.prompt_chars;

    let normalizer = Arc::new(Mutex::new(Some(StreamNormalizer::new(
        provider.clone(),
        model.clone(),
    ))));
    let mut guard = StreamGuard::new(job, Arc::clone(&normalizer));
    let store = state.store().clone();

    let body_stream = async_stream::stream! {
        let mut upstream = upstream;
        let mut upstream_error = false;

        while let Some(event) = upstream.next().await {
            if let ChunkEvent::Error { message } = &event {
                yield Ok::<_, Infallible>(Bytes::from(sse::error_frame(
                    message,
                    "stream_error",
                    Some(&provider),
                    Some(&model),
                )));
                upstream_error = true;
                break;
            }

            let chunk = {
                let mut lock = normalizer.lock();
                lock.as_mut().and_then(|n| n.on_event(event))
            };
            if let Some(chunk) = chunk {
                yield Ok(Bytes::from(sse::data_frame(&chunk)));
            }
        }

        let (chunk_count, usage_now) = {
            let lock = normalizer.lock();
            lock.as_ref().map_or((0, Usage::default()), |n| {
                (n.chunk_count(), n.current_usage(prompt_chars))
            })
        };

        if upstream_error {
            yield Ok(Bytes::from(sse::done_frame()));
            guard.finish(StreamEnd::UpstreamError);
            return;
        }

        if chunk_count == 0 {
            yield Ok(Bytes::from(sse::error_frame(
                &format!(
                    "Provider returned empty stream for model {model}. \
                     Please try again or contact support."
                ),
                "empty_stream_error",
                Some(&provider),
                Some(&model),
            )));
            yield Ok(Bytes::from(sse::done_frame()));
            guard.finish(StreamEnd::Empty);
            return;
        }

        // Plan re-check with the real token count, before [DONE]
        if let Caller::User { user } = &caller {
            if let Ok(plan_check) = store.check_plan_limits(user.id, usage_now.total_tokens).await {
                if !plan_check.allowed {
                    yield Ok(Bytes::from(sse::error_frame(
                        &format!(
                            "Plan limit exceeded: {}",
                            plan_check.reason.unwrap_or_else(|| "unknown".to_string())
                        ),
                        "plan_limit_exceeded",
                        None,
                        None,
                    )));
                    yield Ok(Bytes::from(sse::done_frame()));
                    guard.discard();
                    return;
                }
            }
        }

        // [DONE] goes out before accounting starts
        yield Ok(Bytes::from(sse::done_frame()));
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
