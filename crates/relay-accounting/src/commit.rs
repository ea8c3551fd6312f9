//! Post-flight accounting commit.
//!
//! One call per completed request. Ordering within the commit is load
//! bearing: credit deduction comes before the usage-row insert so a crash
//! between the two leaves at most one unbilled row, never a double bill.
//! Trial users get a zero-cost usage row and trial counters; their credit
//! balance is never touched.
//!
//! A failed deduction after a stream has already been delivered is revenue
//! loss, not a client error: the incident goes to the durable error sink
//! and the response is unaffected.

use std::sync::Arc;
use tracing::{debug, error, warn};

use relay_cache::AuthCache;
use relay_core::{mask_key, ActivityRecord, StoreError, UsageEvent, UserStore};
use relay_core::store::SessionMessage;
use relay_limits::RateLimitManager;
use relay_core::MessageRole;

use crate::tasks::TaskGroup;

/// Session history update attached to a post-flight
#[derive(Debug, Clone)]
pub struct SessionAppend {
    /// Session to append to
    pub session_id: i64,
    /// The user turn from this request, flattened to text
    pub user_message: Option<String>,
    /// The assistant's accumulated content
    pub assistant_content: String,
}

/// Everything accounting needs after a request completes
#[derive(Debug, Clone)]
pub struct PostFlight {
    /// The usage event, with cost already computed
    pub event: UsageEvent,
    /// Whether the user is on an active trial
    pub is_trial: bool,
    /// Session history update, when a session id was supplied
    pub session: Option<SessionAppend>,
}

/// Accounting component
pub struct Accounting {
    store: Arc<dyn UserStore>,
    auth_cache: Arc<AuthCache>,
    rate_limits: Arc<RateLimitManager>,
    tasks: TaskGroup,
}

impl Accounting {
    /// Create the accounting component
    #[must_use]
    pub fn new(
        store: Arc<dyn UserStore>,
        auth_cache: Arc<AuthCache>,
        rate_limits: Arc<RateLimitManager>,
        tasks: TaskGroup,
    ) -> Self {
        Self {
            store,
            auth_cache,
            rate_limits,
            tasks,
        }
    }

    /// The background task group, for shutdown draining
    #[must_use]
    pub fn tasks(&self) -> &TaskGroup {
        &self.tasks
    }

    /// Commit a usage event synchronously (non-streaming path).
    pub async fn commit(&self, post: PostFlight) {
        let event = &post.event;
        let total_tokens = event.total_tokens();

        if post.is_trial {
            if let Err(e) = self
                .store
                .track_trial_usage(&event.api_key, total_tokens, 1)
                .await
            {
                warn!(
                    request_id = %event.request_id,
                    error = %e,
                    "Failed to track trial usage"
                );
            }
            // Trial rows are recorded at zero cost; credits untouched
            let mut trial_event = event.clone();
            trial_event.cost = 0.0;
            if let Err(e) = self.store.record_usage(&trial_event).await {
                error!(
                    request_id = %event.request_id,
                    error = %e,
                    "Failed to record trial usage row"
                );
            }
        } else {
            match self
                .store
                .deduct_credits(
                    &event.api_key,
                    event.cost,
                    &format!("API usage - {}", event.model),
                )
                .await
            {
                Ok(()) => {}
                Err(StoreError::InsufficientFunds { amount }) => {
                    // Pre-check passed but the atomic deduction lost the
                    // race. Bytes are already on the wire; log and count.
                    error!(
                        request_id = %event.request_id,
                        key = %mask_key(&event.api_key),
                        amount = amount,
                        "Post-flight credit deduction failed: insufficient funds"
                    );
                    let _ = self
                        .store
                        .log_credit_failure(event, "insufficient_funds")
                        .await;
                }
                Err(e) => {
                    error!(
                        request_id = %event.request_id,
                        key = %mask_key(&event.api_key),
                        error = %e,
                        "Post-flight credit deduction failed"
                    );
                    let _ = self.store.log_credit_failure(event, &e.to_string()).await;
                }
            }

            if let Err(e) = self.store.record_usage(event).await {
                error!(
                    request_id = %event.request_id,
                    error = %e,
                    "Failed to record usage row"
                );
            }
            if let Err(e) = self
                .store
                .update_rate_counters(&event.api_key, total_tokens)
                .await
            {
                warn!(
                    request_id = %event.request_id,
                    error = %e,
                    "Failed to update durable rate counters"
                );
            }
            self.rate_limits
                .record_tokens(&event.api_key, u64::from(total_tokens));
        }

        if let Err(e) = self.store.increment_key_usage(&event.api_key).await {
            debug!(request_id = %event.request_id, error = %e, "Key usage bump failed");
        }

        // The user record changed; stale cached credits must not admit the
        // next request
        self.auth_cache.invalidate(&event.api_key).await;

        let elapsed_secs = (event.elapsed_ms as f64 / 1_000.0).max(0.001);
        let activity = ActivityRecord {
            user_id: event.user_id,
            model: event.model.clone(),
            provider: event.provider.clone(),
            tokens: total_tokens,
            cost: if post.is_trial { 0.0 } else { event.cost },
            speed: f64::from(total_tokens) / elapsed_secs,
            finish_reason: event
                .finish_reason
                .map_or("stop", |reason| reason.as_str())
                .to_string(),
            metadata: serde_json::json!({
                "prompt_tokens": event.prompt_tokens,
                "completion_tokens": event.completion_tokens,
                "request_id": event.request_id,
                "session_id": post.session.as_ref().map(|s| s.session_id),
            }),
            timestamp: event.timestamp,
        };
        if let Err(e) = self.store.log_activity(activity).await {
            warn!(request_id = %event.request_id, error = %e, "Failed to log activity");
        }

        if let Some(session) = post.session {
            self.append_history(event, session).await;
        }
    }

    async fn append_history(&self, event: &UsageEvent, session: SessionAppend) {
        match self
            .store
            .get_session(session.session_id, event.user_id)
            .await
        {
            Ok(Some(_)) => {
                if let Some(user_message) = session.user_message {
                    let message = SessionMessage {
                        role: MessageRole::User,
                        content: user_message,
                        model: Some(event.model.clone()),
                        tokens: 0,
                    };
                    if let Err(e) = self
                        .store
                        .append_message(session.session_id, event.user_id, message)
                        .await
                    {
                        error!(
                            session_id = session.session_id,
                            error = %e,
                            "Failed to save user turn"
                        );
                    }
                }
                if !session.assistant_content.is_empty() {
                    let message = SessionMessage {
                        role: MessageRole::Assistant,
                        content: session.assistant_content,
                        model: Some(event.model.clone()),
                        tokens: event.total_tokens(),
                    };
                    if let Err(e) = self
                        .store
                        .append_message(session.session_id, event.user_id, message)
                        .await
                    {
                        error!(
                            session_id = session.session_id,
                            error = %e,
                            "Failed to save assistant turn"
                        );
                    }
                }
            }
            Ok(None) => {
                warn!(
                    session_id = session.session_id,
                    user_id = event.user_id,
                    "Session not found, history not saved"
                );
            }
            Err(e) => {
                error!(
                    session_id = session.session_id,
                    error = %e,
                    "Failed to fetch session for history"
                );
            }
        }
    }

    /// Commit in the background (streaming path). The client has its
    /// `[DONE]` already; nothing here may delay or fail the response.
    pub fn commit_background(self: &Arc<Self>, post: PostFlight) {
        let accounting = Arc::clone(self);
        self.tasks.spawn(async move {
            accounting.commit(post).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_cache::CacheStore;
    use relay_config::RateLimitConfig;
    use relay_core::store::{MemoryUserStore, Session};
    use relay_core::{EnvironmentTag, RequestId, TrialDescriptor, User};
    use std::time::Duration;

    fn user(key: &str, credits: f64, trial: bool) -> User {
        User {
            id: 1,
            api_key: key.to_string(),
            environment_tag: EnvironmentTag::Live,
            credits,
            plan_id: None,
            trial: TrialDescriptor {
                is_trial: trial,
                expired: false,
                remaining_tokens: 1_000,
                remaining_requests: 10,
                remaining_credits: 1.0,
                end_date: None,
            },
        }
    }

    fn event(key: &str, cost: f64) -> UsageEvent {
        UsageEvent {
            request_id: RequestId::generate(),
            user_id: 1,
            api_key: key.to_string(),
            provider: "openrouter".to_string(),
            model: "gpt-4".to_string(),
            prompt_tokens: 10,
            completion_tokens: 20,
            elapsed_ms: 150,
            cost,
            success: true,
            error_kind: None,
            finish_reason: None,
            timestamp: chrono::Utc::now(),
        }
    }

    fn accounting(store: Arc<MemoryUserStore>) -> Arc<Accounting> {
        let cache = Arc::new(CacheStore::in_memory());
        let auth = Arc::new(AuthCache::new(
            cache,
            Arc::clone(&store) as Arc<dyn UserStore>,
            Duration::from_secs(300),
            Duration::from_secs(60),
        ));
        Arc::new(Accounting::new(
            store,
            auth,
            Arc::new(RateLimitManager::new(RateLimitConfig::default())),
            TaskGroup::new(8),
        ))
    }

    #[tokio::test]
    async fn paid_commit_deducts_once_and_records() {
        let store = Arc::new(MemoryUserStore::new());
        store.put_user(user("k", 1.0, false));
        let accounting = accounting(Arc::clone(&store));

        accounting
            .commit(PostFlight {
                event: event("k", 0.25),
                is_trial: false,
                session: None,
            })
            .await;

        assert!((store.credits("k").expect("user") - 0.75).abs() < 1e-9);
        assert_eq!(store.usage_count(), 1);
        assert_eq!(store.credit_failure_count(), 0);
    }

    #[tokio::test]
    async fn trial_commit_never_touches_credits() {
        let store = Arc::new(MemoryUserStore::new());
        store.put_user(user("k", 5.0, true));
        let accounting = accounting(Arc::clone(&store));

        accounting
            .commit(PostFlight {
                event: event("k", 0.25),
                is_trial: true,
                session: None,
            })
            .await;

        assert!((store.credits("k").expect("user") - 5.0).abs() < f64::EPSILON);
        assert_eq!(store.usage_count(), 1);
    }

    #[tokio::test]
    async fn failed_deduction_goes_to_durable_sink() {
        let store = Arc::new(MemoryUserStore::new());
        store.put_user(user("k", 0.01, false));
        let accounting = accounting(Arc::clone(&store));

        accounting
            .commit(PostFlight {
                event: event("k", 0.50),
                is_trial: false,
                session: None,
            })
            .await;

        assert_eq!(store.credit_failure_count(), 1);
        // Usage row still written so the incident is reconcilable
        assert_eq!(store.usage_count(), 1);
        // Balance unchanged by the failed conditional update
        assert!((store.credits("k").expect("user") - 0.01).abs() < 1e-9);
    }

    #[tokio::test]
    async fn history_appended_for_owned_session() {
        let store = Arc::new(MemoryUserStore::new());
        store.put_user(user("k", 1.0, false));
        store.put_session(Session {
            id: 9,
            user_id: 1,
            messages: vec![],
        });
        let accounting = accounting(Arc::clone(&store));

        accounting
            .commit(PostFlight {
                event: event("k", 0.01),
                is_trial: false,
                session: Some(SessionAppend {
                    session_id: 9,
                    user_message: Some("Hi".to_string()),
                    assistant_content: "Hello!".to_string(),
                }),
            })
            .await;

        let session = store.get_session(9, 1).await.expect("query").expect("session");
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].role, MessageRole::User);
        assert_eq!(session.messages[1].content, "Hello!");
    }

    #[tokio::test]
    async fn background_commit_completes_on_drain() {
        let store = Arc::new(MemoryUserStore::new());
        store.put_user(user("k", 1.0, false));
        let accounting = accounting(Arc::clone(&store));

        accounting.commit_background(PostFlight {
            event: event("k", 0.10),
            is_trial: false,
            session: None,
        });

        assert!(accounting.tasks().drain(Duration::from_secs(1)).await);
        assert!((store.credits("k").expect("user") - 0.90).abs() < 1e-9);
    }
}
