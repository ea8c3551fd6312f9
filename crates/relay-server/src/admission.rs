//! Request admission.
//!
//! The pre-dispatch sequence for one request: auth, trial, plan, rate,
//! credits. Runs entirely before any upstream call; every denial maps to
//! its own status code. An API key that fails lookup is a 401, never a
//! downgrade to the anonymous path.

use tracing::{debug, info, warn};

use relay_core::{mask_key, GatewayError, GatewayRequest, RequestId, User};
use relay_limits::Decision;

use crate::error::ApiError;
use crate::state::AppState;

/// Who is making the request
#[derive(Debug, Clone)]
pub enum Caller {
    /// No API key; admitted under the per-IP anonymous policy
    Anonymous {
        /// Client IP as observed at ingress
        ip: String,
    },
    /// Authenticated key holder
    User {
        /// The cached user record
        user: User,
    },
}

impl Caller {
    /// API key, when authenticated
    #[must_use]
    pub fn api_key(&self) -> Option<&str> {
        match self {
            Self::Anonymous { .. } => None,
            Self::User { user } => Some(&user.api_key),
        }
    }

    /// Whether the caller is on an active trial
    #[must_use]
    pub fn is_trial(&self) -> bool {
        match self {
            Self::Anonymous { .. } => false,
            Self::User { user } => user.is_active_trial(),
        }
    }
}

/// Outcome of a successful admission
pub struct Admission {
    /// The admitted caller
    pub caller: Caller,
    /// Rate-limit decision, present for authenticated non-trial callers
    pub decision: Option<Decision>,
}

/// Run the admission sequence. Returns the admitted caller or the denial.
pub async fn admit(
    state: &AppState,
    api_key: Option<String>,
    ip: String,
    request: &GatewayRequest,
    request_id: &RequestId,
) -> Result<Admission, ApiError> {
    request
        .validate()
        .map_err(|e| ApiError::new(e, request_id.clone()))?;

    let Some(key) = api_key else {
        return admit_anonymous(state, ip, request, request_id).await;
    };

    let user = match state.auth().lookup(&key).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            warn!(
                request_id = %request_id,
                key = %mask_key(&key),
                "Invalid API key"
            );
            return Err(ApiError::new(
                GatewayError::authentication("Invalid API key"),
                request_id.clone(),
            ));
        }
        Err(e) => {
            return Err(ApiError::new(
                GatewayError::internal(format!("user lookup failed: {e}")),
                request_id.clone(),
            ));
        }
    };

    // Trial state gates before anything is spent
    if user.trial.is_trial {
        if user.trial.expired {
            let end_date = user
                .trial
                .end_date
                .map(|d| d.to_rfc3339())
                .unwrap_or_default();
            return Err(ApiError::new(
                GatewayError::forbidden("Trial has expired. Please upgrade to continue."),
                request_id.clone(),
            )
            .with_header("x-trial-expired", "true".to_string())
            .with_header("x-trial-end-date", end_date));
        }
        if !user.trial.has_allowance() {
            return Err(ApiError::new(
                GatewayError::rate_limited("trial allowance exhausted", None),
                request_id.clone(),
            )
            .with_header(
                "x-trial-remaining-tokens",
                user.trial.remaining_tokens.max(0).to_string(),
            )
            .with_header(
                "x-trial-remaining-requests",
                user.trial.remaining_requests.max(0).to_string(),
            ));
        }
    }

    // Plan precheck with zero tokens; the post-flight re-checks with the
    // real count
    match state.store().check_plan_limits(user.id, 0).await {
        Ok(plan) if !plan.allowed => {
            return Err(ApiError::new(
                GatewayError::rate_limited(
                    format!(
                        "plan limit exceeded: {}",
                        plan.reason.unwrap_or_else(|| "unknown".to_string())
                    ),
                    None,
                ),
                request_id.clone(),
            ));
        }
        Ok(_) => {}
        Err(e) => {
            debug!(request_id = %request_id, error = %e, "Plan precheck unavailable, admitting");
        }
    }

    let trial_active = user.is_active_trial();
    let decision = if trial_active {
        // Trial users are metered by trial counters, not the sliding window
        None
    } else {
        let decision = state.rate_limits().check_and_reserve(&user.api_key, 0);
        if !decision.allowed {
            let reason = decision
                .reason
                .clone()
                .unwrap_or_else(|| "rate limit exceeded".to_string());
            info!(
                request_id = %request_id,
                key = %mask_key(&user.api_key),
                reason = %reason,
                "Rate limited"
            );
            return Err(ApiError::new(
                GatewayError::rate_limited(reason, decision.retry_after),
                request_id.clone(),
            ));
        }
        Some(decision)
    };

    if !trial_active && user.credits <= 0.0 {
        return Err(ApiError::new(
            GatewayError::InsufficientCredits,
            request_id.clone(),
        ));
    }

    Ok(Admission {
        caller: Caller::User { user },
        decision,
    })
}

async fn admit_anonymous(
    state: &AppState,
    ip: String,
    request: &GatewayRequest,
    request_id: &RequestId,
) -> Result<Admission, ApiError> {
    let anonymous = state.anonymous();

    if !anonymous.is_model_allowed(&request.model) {
        return Err(ApiError::new(
            GatewayError::forbidden(anonymous.model_denied_reason(&request.model)),
            request_id.clone(),
        ));
    }

    let quota = anonymous.check(&ip).await;
    if !quota.allowed {
        return Err(ApiError::new(
            GatewayError::rate_limited(
                quota
                    .reason
                    .unwrap_or_else(|| "anonymous daily limit exceeded".to_string()),
                None,
            ),
            request_id.clone(),
        ));
    }

    info!(
        request_id = %request_id,
        model = %request.model,
        remaining = quota.remaining,
        "Anonymous request admitted"
    );

    Ok(Admission {
        caller: Caller::Anonymous { ip },
        decision: None,
    })
}
