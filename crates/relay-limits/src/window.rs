//! Sliding-window rate limiting.
//!
//! Each API key is limited on two axes (requests, tokens) over three
//! windows (minute, hour, day). Windows are approximated by two fixed
//! buckets, current and previous, weighted by the elapsed fraction of the
//! current bucket; this avoids the edge spikes of pure fixed windows
//! without retaining per-request timestamps.
//!
//! Per-key state lives under lock striping: a fixed array of 256 mutexes
//! indexed by key hash. Memory stays bounded and a hot key contends on one
//! stripe instead of a global lock.

use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

use relay_config::RateLimitConfig;

const STRIPES: usize = 256;

const MINUTE: u64 = 60;
const HOUR: u64 = 3_600;
const DAY: u64 = 86_400;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Two-bucket sliding window counter
#[derive(Debug, Clone, Copy, Default)]
struct Window {
    bucket: u64,
    current: u64,
    previous: u64,
}

impl Window {
    fn roll(&mut self, now: u64, width: u64) {
        let bucket = now / width;
        if bucket == self.bucket {
            return;
        }
        self.previous = if bucket == self.bucket + 1 {
            self.current
        } else {
            0
        };
        self.current = 0;
        self.bucket = bucket;
    }

    /// Weighted count: the previous bucket decays linearly as the current
    /// bucket fills.
    fn count(&self, now: u64, width: u64) -> u64 {
        let elapsed = now - self.bucket * width;
        let previous_weight = (width - elapsed.min(width)) as f64 / width as f64;
        self.current + (self.previous as f64 * previous_weight) as u64
    }

    fn add(&mut self, amount: u64) {
        self.current += amount;
    }

    /// Unix second at which the current bucket ends
    fn reset_at(&self, width: u64) -> u64 {
        (self.bucket + 1) * width
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct KeyState {
    requests: [Window; 3],
    tokens: [Window; 3],
}

impl KeyState {
    fn roll(&mut self, now: u64) {
        for (window, width) in self.requests.iter_mut().zip([MINUTE, HOUR, DAY]) {
            window.roll(now, width);
        }
        for (window, width) in self.tokens.iter_mut().zip([MINUTE, HOUR, DAY]) {
            window.roll(now, width);
        }
    }
}

/// Outcome of a rate-limit check.
///
/// Remaining/limit/reset figures report the minute window, the one clients
/// can act on; the hour and day windows still gate internally.
#[derive(Debug, Clone)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Which limit tripped, when denied
    pub reason: Option<String>,
    /// Seconds until a retry could succeed
    pub retry_after: Option<u64>,
    /// Request limit for the reported window
    pub limit_requests: u64,
    /// Requests remaining in the reported window
    pub remaining_requests: u64,
    /// Unix second the request window resets at
    pub reset_requests: u64,
    /// Token limit for the reported window
    pub limit_tokens: u64,
    /// Tokens remaining in the reported window
    pub remaining_tokens: u64,
    /// Unix second the token window resets at
    pub reset_tokens: u64,
}

/// Per-key sliding-window rate limiter
pub struct RateLimitManager {
    config: RateLimitConfig,
    stripes: Vec<Mutex<HashMap<String, KeyState>>>,
}

impl RateLimitManager {
    /// Create a manager with the given limits
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            stripes: (0..STRIPES).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn stripe(&self, key: &str) -> &Mutex<HashMap<String, KeyState>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % STRIPES]
    }

    fn request_limits(&self) -> [u64; 3] {
        [
            self.config.requests_per_minute,
            self.config.requests_per_hour,
            self.config.requests_per_day,
        ]
    }

    fn token_limits(&self) -> [u64; 3] {
        [
            self.config.tokens_per_minute,
            self.config.tokens_per_hour,
            self.config.tokens_per_day,
        ]
    }

    /// Check the key against all windows and, when allowed, reserve one
    /// request slot plus `tokens` tokens.
    pub fn check_and_reserve(&self, key: &str, tokens: u64) -> Decision {
        let now = unix_now();
        let stripe = self.stripe(key);
        let mut map = stripe.lock();
        let state = map.entry(key.to_string()).or_default();
        state.roll(now);

        let window_names = ["minute", "hour", "day"];
        let widths = [MINUTE, HOUR, DAY];

        for ((window, limit), (name, width)) in state
            .requests
            .iter()
            .zip(self.request_limits())
            .zip(window_names.iter().zip(widths))
        {
            if window.count(now, width) + 1 > limit {
                return Self::denied(
                    state,
                    now,
                    &self.config,
                    format!("request limit {limit}/{name} exceeded"),
                    window.reset_at(width).saturating_sub(now),
                );
            }
        }

        for ((window, limit), (name, width)) in state
            .tokens
            .iter()
            .zip(self.token_limits())
            .zip(window_names.iter().zip(widths))
        {
            if window.count(now, width) + tokens > limit {
                return Self::denied(
                    state,
                    now,
                    &self.config,
                    format!("token limit {limit}/{name} exceeded"),
                    window.reset_at(width).saturating_sub(now),
                );
            }
        }

        for window in &mut state.requests {
            window.add(1);
        }
        if tokens > 0 {
            for window in &mut state.tokens {
                window.add(tokens);
            }
        }

        Self::snapshot(state, now, &self.config, true, None, None)
    }

    /// Record the real token count after the response is known.
    pub fn record_tokens(&self, key: &str, tokens: u64) {
        if tokens == 0 {
            return;
        }
        let now = unix_now();
        let stripe = self.stripe(key);
        let mut map = stripe.lock();
        let state = map.entry(key.to_string()).or_default();
        state.roll(now);
        for window in &mut state.tokens {
            window.add(tokens);
        }
    }

    fn denied(
        state: &KeyState,
        now: u64,
        config: &RateLimitConfig,
        reason: String,
        retry_after: u64,
    ) -> Decision {
        Self::snapshot(
            state,
            now,
            config,
            false,
            Some(reason),
            Some(retry_after.max(1)),
        )
    }

    fn snapshot(
        state: &KeyState,
        now: u64,
        config: &RateLimitConfig,
        allowed: bool,
        reason: Option<String>,
        retry_after: Option<u64>,
    ) -> Decision {
        let minute_requests = state.requests[0].count(now, MINUTE);
        let minute_tokens = state.tokens[0].count(now, MINUTE);
        Decision {
            allowed,
            reason,
            retry_after,
            limit_requests: config.requests_per_minute,
            remaining_requests: config.requests_per_minute.saturating_sub(minute_requests),
            reset_requests: state.requests[0].reset_at(MINUTE),
            limit_tokens: config.tokens_per_minute,
            remaining_tokens: config.tokens_per_minute.saturating_sub(minute_tokens),
            reset_tokens: state.tokens[0].reset_at(MINUTE),
        }
    }
}
