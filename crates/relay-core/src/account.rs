//! Account and usage types.
//!
//! [`User`] records are owned by the external datastore; the gateway holds
//! short-lived copies through the auth cache and never mutates them in
//! place. [`UsageEvent`] is produced exactly once per completed request by
//! the orchestrator and consumed by accounting and metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::response::FinishReason;
use crate::types::RequestId;

/// Deployment environment a key belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentTag {
    /// Production traffic
    #[default]
    Live,
    /// Test traffic
    Test,
}

/// User record as cached from the datastore
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// User id
    pub id: i64,
    /// Primary API key
    pub api_key: String,
    /// Environment the key is scoped to
    #[serde(default)]
    pub environment_tag: EnvironmentTag,
    /// Credit balance in USD; never negative at commit time
    pub credits: f64,
    /// Plan reference, when subscribed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    /// Trial state
    #[serde(default)]
    pub trial: TrialDescriptor,
}

impl User {
    /// Whether this user is on an active (non-expired) trial
    #[must_use]
    pub fn is_active_trial(&self) -> bool {
        self.trial.is_trial && !self.trial.expired
    }
}

/// Trial state for a key
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrialDescriptor {
    /// Whether the key is a trial key
    pub is_trial: bool,
    /// Whether the trial has ended
    pub expired: bool,
    /// Trial tokens left
    #[serde(default)]
    pub remaining_tokens: i64,
    /// Trial requests left
    #[serde(default)]
    pub remaining_requests: i64,
    /// Trial credits left
    #[serde(default)]
    pub remaining_credits: f64,
    /// When the trial ends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
}

impl TrialDescriptor {
    /// Whether the trial still has token and request allowance
    #[must_use]
    pub fn has_allowance(&self) -> bool {
        self.remaining_tokens > 0 && self.remaining_requests > 0
    }
}

/// Accounting record for one completed request.
///
/// Produced once per request after the response (or the final stream frame)
/// is known; consumed by accounting and the metrics recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    /// Correlation id
    pub request_id: RequestId,
    /// Owning user
    pub user_id: i64,
    /// API key the request was made with
    pub api_key: String,
    /// Provider that served (or failed) the request
    pub provider: String,
    /// Canonical model id
    pub model: String,
    /// Prompt tokens (reported or estimated)
    pub prompt_tokens: u32,
    /// Completion tokens (reported or estimated)
    pub completion_tokens: u32,
    /// Wall-clock duration in milliseconds
    pub elapsed_ms: u64,
    /// Cost in USD (zero for trial users)
    pub cost: f64,
    /// Whether the request succeeded
    pub success: bool,
    /// Failure classification when it did not
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Finish reason of the first choice
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    /// When the request completed
    pub timestamp: DateTime<Utc>,
}

impl UsageEvent {
    /// Total billable tokens
    #[must_use]
    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}
