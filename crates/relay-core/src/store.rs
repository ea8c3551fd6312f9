//! External datastore interface.
//!
//! The persistent datastore (users, keys, plans, sessions, usage rows) is
//! owned outside the gateway; this module names the operations the request
//! lifecycle needs from it. The bundled [`MemoryUserStore`] backs tests and
//! standalone runs.
//!
//! `deduct_credits` is the one operation with a hard contract: it must be a
//! single conditional update (deduct X if balance >= X, else fail) so that
//! credit deduction is at-most-once even under concurrent requests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::account::{UsageEvent, User};
use crate::request::MessageRole;

/// Datastore error type
#[derive(Debug, Error)]
pub enum StoreError {
    /// Atomic deduction failed: balance below the requested amount
    #[error("insufficient funds: balance below {amount}")]
    InsufficientFunds {
        /// Amount that was requested
        amount: f64,
    },

    /// Row not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Datastore unreachable or erroring
    #[error("datastore unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of a plan-limit check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanDecision {
    /// Whether the request fits the plan
    pub allowed: bool,
    /// Which plan limit tripped, when denied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PlanDecision {
    /// An allowing decision
    #[must_use]
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }
}

/// Stored chat session with its message history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Session id
    pub id: i64,
    /// Owning user
    pub user_id: i64,
    /// Messages in insertion order
    pub messages: Vec<SessionMessage>,
}

/// One stored session message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    /// Author role
    pub role: MessageRole,
    /// Text content
    pub content: String,
    /// Model that produced it (assistant turns)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Tokens attributed to this message
    #[serde(default)]
    pub tokens: u32,
}

/// Activity row for the user-facing activity feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    /// Owning user
    pub user_id: i64,
    /// Canonical model id
    pub model: String,
    /// Provider that served the request
    pub provider: String,
    /// Total tokens
    pub tokens: u32,
    /// Cost in USD
    pub cost: f64,
    /// Tokens per second
    pub speed: f64,
    /// Finish reason string
    pub finish_reason: String,
    /// Arbitrary metadata (endpoint, session, stream flag)
    pub metadata: serde_json::Value,
    /// When the activity happened
    pub timestamp: DateTime<Utc>,
}

/// Operations the request lifecycle needs from the datastore.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Look up a user by API key. `Ok(None)` means the key is unknown.
    async fn get_user_by_key(&self, api_key: &str) -> Result<Option<User>, StoreError>;

    /// Atomically deduct credits: single conditional update, fails with
    /// [`StoreError::InsufficientFunds`] when the balance cannot cover it.
    async fn deduct_credits(
        &self,
        api_key: &str,
        amount: f64,
        description: &str,
    ) -> Result<(), StoreError>;

    /// Insert a usage row
    async fn record_usage(&self, event: &UsageEvent) -> Result<(), StoreError>;

    /// Update durable rate counters with the real token count
    async fn update_rate_counters(&self, api_key: &str, tokens: u32) -> Result<(), StoreError>;

    /// Consume trial allowance
    async fn track_trial_usage(
        &self,
        api_key: &str,
        tokens: u32,
        requests: u32,
    ) -> Result<(), StoreError>;

    /// Bump the per-key request counter
    async fn increment_key_usage(&self, api_key: &str) -> Result<(), StoreError>;

    /// Check plan limits for the given token count
    async fn check_plan_limits(&self, user_id: i64, tokens: u32) -> Result<PlanDecision, StoreError>;

    /// Append an activity row
    async fn log_activity(&self, record: ActivityRecord) -> Result<(), StoreError>;

    /// Fetch a chat session owned by the user
    async fn get_session(&self, session_id: i64, user_id: i64)
        -> Result<Option<Session>, StoreError>;

    /// Append a message to a session
    async fn append_message(
        &self,
        session_id: i64,
        user_id: i64,
        message: SessionMessage,
    ) -> Result<(), StoreError>;

    /// Durable error sink for failed post-stream deductions. These are
    /// revenue-loss incidents and must survive process restarts.
    async fn log_credit_failure(&self, event: &UsageEvent, error: &str) -> Result<(), StoreError>;
}

/// In-memory datastore for tests and standalone runs.
#[derive(Default)]
pub struct MemoryUserStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    users: HashMap<String, User>,
    usage: Vec<UsageEvent>,
    activity: Vec<ActivityRecord>,
    sessions: HashMap<i64, Session>,
    credit_failures: Vec<(UsageEvent, String)>,
    key_usage: HashMap<String, u64>,
    rate_counters: HashMap<String, u64>,
}

impl MemoryUserStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a user, keyed by API key
    pub fn put_user(&self, user: User) {
        self.inner.lock().users.insert(user.api_key.clone(), user);
    }

    /// Insert a session
    pub fn put_session(&self, session: Session) {
        self.inner.lock().sessions.insert(session.id, session);
    }

    /// Current credit balance for a key
    #[must_use]
    pub fn credits(&self, api_key: &str) -> Option<f64> {
        self.inner.lock().users.get(api_key).map(|u| u.credits)
    }

    /// Number of usage rows recorded
    #[must_use]
    pub fn usage_count(&self) -> usize {
        self.inner.lock().usage.len()
    }

    /// Number of credit-failure incidents logged
    #[must_use]
    pub fn credit_failure_count(&self) -> usize {
        self.inner.lock().credit_failures.len()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn get_user_by_key(&self, api_key: &str) -> Result<Option<User>, StoreError> {
        Ok(self.inner.lock().users.get(api_key).cloned())
    }

    async fn deduct_credits(
        &self,
        api_key: &str,
        amount: f64,
        _description: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let user = inner
            .users
            .get_mut(api_key)
            .ok_or_else(|| StoreError::NotFound(format!("user for key {api_key}")))?;
        if user.credits < amount {
            return Err(StoreError::InsufficientFunds { amount });
        }
        user.credits -= amount;
        Ok(())
    }

    async fn record_usage(&self, event: &UsageEvent) -> Result<(), StoreError> {
        self.inner.lock().usage.push(event.clone());
        Ok(())
    }

    async fn update_rate_counters(&self, api_key: &str, tokens: u32) -> Result<(), StoreError> {
        *self
            .inner
            .lock()
            .rate_counters
            .entry(api_key.to_string())
            .or_default() += u64::from(tokens);
        Ok(())
    }

    async fn track_trial_usage(
        &self,
        api_key: &str,
        tokens: u32,
        requests: u32,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(user) = inner.users.get_mut(api_key) {
            user.trial.remaining_tokens -= i64::from(tokens);
            user.trial.remaining_requests -= i64::from(requests);
        }
        Ok(())
    }

    async fn increment_key_usage(&self, api_key: &str) -> Result<(), StoreError> {
        *self
            .inner
            .lock()
            .key_usage
            .entry(api_key.to_string())
            .or_default() += 1;
        Ok(())
    }

    async fn check_plan_limits(
        &self,
        _user_id: i64,
        _tokens: u32,
    ) -> Result<PlanDecision, StoreError> {
        Ok(PlanDecision::allow())
    }

    async fn log_activity(&self, record: ActivityRecord) -> Result<(), StoreError> {
        self.inner.lock().activity.push(record);
        Ok(())
    }

    async fn get_session(
        &self,
        session_id: i64,
        user_id: i64,
    ) -> Result<Option<Session>, StoreError> {
        Ok(self
            .inner
            .lock()
            .sessions
            .get(&session_id)
            .filter(|s| s.user_id == user_id)
            .cloned())
    }

    async fn append_message(
        &self,
        session_id: i64,
        user_id: i64,
        message: SessionMessage,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let session = inner
            .sessions
            .get_mut(&session_id)
            .filter(|s| s.user_id == user_id)
            .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
        session.messages.push(message);
        Ok(())
    }

    async fn log_credit_failure(&self, event: &UsageEvent, error: &str) -> Result<(), StoreError> {
        self.inner
            .lock()
            .credit_failures
            .push((event.clone(), error.to_string()));
        Ok(())
    }
}
