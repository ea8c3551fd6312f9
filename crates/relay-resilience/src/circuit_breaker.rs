//! Circuit breaker state machine.
//!
//! The breaker stops requests to a failing (provider, model) pair and
//! allows it time to recover:
//! - CLOSED: requests pass; consecutive failures or a failure rate over a
//!   minimum sample count trips the breaker
//! - OPEN: all requests short-circuited until the open window lapses
//! - HALF_OPEN: one probe admitted at a time; consecutive successes close
//!   the circuit, any failure reopens it and restarts the window

use parking_lot::RwLock;
use relay_config::BreakerConfig;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use relay_core::GatewayError;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed = 0,
    /// Circuit is open, requests are rejected
    Open = 1,
    /// Circuit is half-open, probing for recovery
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

impl CircuitState {
    /// Wire name used in the replicated snapshot
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Circuit breaker for a single (provider, model) pair
pub struct CircuitBreaker {
    provider: String,
    model: String,
    config: BreakerConfig,
    /// Current state (atomic for lock-free reads)
    state: AtomicU8,
    /// Failures since the last success
    consecutive_failures: AtomicU32,
    /// Failure count in the current sample window
    failure_count: AtomicU32,
    /// Request count in the current sample window
    request_count: AtomicU32,
    /// Consecutive successes while half-open
    half_open_successes: AtomicU32,
    /// Whether a half-open probe is in flight
    probe_in_flight: AtomicBool,
    /// When the circuit opened (milliseconds since epoch)
    opened_at: AtomicU64,
    /// Lock for state transitions
    transition_lock: RwLock<()>,
}

impl CircuitBreaker {
    /// Create a breaker for the given pair
    #[must_use]
    pub fn new(provider: impl Into<String>, model: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU32::new(0),
            failure_count: AtomicU32::new(0),
            request_count: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            probe_in_flight: AtomicBool::new(false),
            opened_at: AtomicU64::new(0),
            transition_lock: RwLock::new(()),
        }
    }

    /// The provider slug this breaker guards
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// The model this breaker guards
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Consecutive failure count
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Gate a call. Returns Ok when the call may proceed.
    ///
    /// While OPEN, every call is denied until the open window lapses; then
    /// the breaker turns HALF_OPEN and admits a single probe at a time.
    ///
    /// # Errors
    /// Returns `GatewayError::CircuitOpen` when the call is denied.
    pub fn before_call(&self) -> Result<(), GatewayError> {
        match self.state() {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => self.try_take_probe(),
            CircuitState::Open => {
                if self.open_window_elapsed() {
                    self.transition_to_half_open();
                    self.try_take_probe()
                } else {
                    Err(self.open_error())
                }
            }
        }
    }

    /// Non-mutating admission peek, used when filtering failover chains.
    /// Unlike [`Self::before_call`] it neither starts the half-open
    /// transition nor takes the probe token.
    #[must_use]
    pub fn would_admit(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !self.probe_in_flight.load(Ordering::Acquire),
            CircuitState::Open => self.open_window_elapsed(),
        }
    }

    /// Record the outcome of an admitted call.
    ///
    /// Callers must filter out client-caused failures before calling this;
    /// only outcomes that say something about provider health belong here.
    pub fn record_outcome(&self, success: bool) {
        if success {
            self.record_success();
        } else {
            self.record_failure();
        }
    }

    fn record_success(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);

        match self.state() {
            CircuitState::Closed => {}
            CircuitState::HalfOpen => {
                self.probe_in_flight.store(false, Ordering::Release);
                let successes = self.half_open_successes.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(
                    provider = %self.provider,
                    model = %self.model,
                    successes = successes,
                    threshold = self.config.success_threshold,
                    "Circuit breaker half-open success"
                );
                if successes >= self.config.success_threshold {
                    self.transition_to_closed();
                }
            }
            CircuitState::Open => {
                // Stale outcome from before the trip; ignore
            }
        }
    }

    fn record_failure(&self) {
        let requests = self.request_count.fetch_add(1, Ordering::Relaxed) + 1;
        let failures = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
        let consecutive = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;

        match self.state() {
            CircuitState::Closed => {
                let rate_tripped = requests >= self.config.min_samples
                    && f64::from(failures) / f64::from(requests) >= self.config.failure_rate;

                if consecutive >= self.config.failure_threshold || rate_tripped {
                    debug!(
                        provider = %self.provider,
                        model = %self.model,
                        consecutive = consecutive,
                        failures = failures,
                        requests = requests,
                        "Circuit breaker trip threshold reached"
                    );
                    self.transition_to_open();
                }
            }
            CircuitState::HalfOpen => {
                // Any failure while probing reopens and restarts the window
                self.probe_in_flight.store(false, Ordering::Release);
                debug!(
                    provider = %self.provider,
                    model = %self.model,
                    "Circuit breaker half-open failure, reopening"
                );
                self.transition_to_open();
            }
            CircuitState::Open => {}
        }
    }

    fn try_take_probe(&self) -> Result<(), GatewayError> {
        if self
            .probe_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Ok(())
        } else {
            Err(self.open_error())
        }
    }

    fn open_error(&self) -> GatewayError {
        GatewayError::CircuitOpen {
            provider: self.provider.clone(),
            model: self.model.clone(),
        }
    }

    fn open_window_elapsed(&self) -> bool {
        let opened_at = self.opened_at.load(Ordering::Acquire);
        if opened_at == 0 {
            return false;
        }
        now_millis().saturating_sub(opened_at) >= self.config.open_duration.as_millis() as u64
    }

    fn transition_to_open(&self) {
        let _guard = self.transition_lock.write();
        let prev = self.state.swap(CircuitState::Open as u8, Ordering::Release);

        // Restart the window even when re-opening from HALF_OPEN
        self.opened_at.store(now_millis(), Ordering::Release);
        self.half_open_successes.store(0, Ordering::Relaxed);
        self.probe_in_flight.store(false, Ordering::Release);

        if prev != CircuitState::Open as u8 {
            warn!(
                provider = %self.provider,
                model = %self.model,
                open_for = ?self.config.open_duration,
                "Circuit breaker opened"
            );
        }
    }

    fn transition_to_half_open(&self) {
        let _guard = self.transition_lock.write();
        let prev = self.state.swap(CircuitState::HalfOpen as u8, Ordering::Release);

        if prev == CircuitState::Open as u8 {
            self.half_open_successes.store(0, Ordering::Relaxed);
            self.probe_in_flight.store(false, Ordering::Release);
            info!(
                provider = %self.provider,
                model = %self.model,
                "Circuit breaker half-open, probing"
            );
        }
    }

    fn transition_to_closed(&self) {
        let _guard = self.transition_lock.write();
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.failure_count.store(0, Ordering::Relaxed);
        self.request_count.store(0, Ordering::Relaxed);
        self.half_open_successes.store(0, Ordering::Relaxed);
        self.probe_in_flight.store(false, Ordering::Release);
        self.opened_at.store(0, Ordering::Release);

        info!(
            provider = %self.provider,
            model = %self.model,
            "Circuit breaker closed"
        );
    }

    /// Force the breaker back to CLOSED (manual intervention)
    pub fn reset(&self) {
        self.transition_to_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32, open_ms: u64) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            failure_rate: 0.5,
            min_samples: 10,
            open_duration: Duration::from_millis(open_ms),
            success_threshold: 2,
        }
    }

    #[test]
    fn initial_state_is_closed() {
        let cb = CircuitBreaker::new("p", "m", BreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.before_call().is_ok());
    }

    #[test]
    fn opens_on_consecutive_failures() {
        let cb = CircuitBreaker::new("p", "m", config(3, 60_000));

        cb.record_outcome(false);
        cb.record_outcome(false);
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_outcome(false);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.before_call().is_err());
    }

    #[test]
    fn success_resets_consecutive_count() {
        let cb = CircuitBreaker::new("p", "m", config(3, 60_000));
        cb.record_outcome(false);
        cb.record_outcome(false);
        cb.record_outcome(true);
        cb.record_outcome(false);
        cb.record_outcome(false);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn opens_on_failure_rate() {
        let cb = CircuitBreaker::new("p", "m", config(100, 60_000));

        // 5 failures / 10 samples = 0.5, at the min-sample boundary
        for _ in 0..5 {
            cb.record_outcome(true);
            if cb.state() == CircuitState::Closed {
                cb.record_outcome(false);
            }
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn open_rejects_until_window_elapses() {
        let cb = CircuitBreaker::new("p", "m", config(2, 40));
        cb.record_outcome(false);
        cb.record_outcome(false);
        assert_eq!(cb.state(), CircuitState::Open);

        // Everything rejected inside the window
        for _ in 0..10 {
            assert!(cb.before_call().is_err());
        }

        std::thread::sleep(Duration::from_millis(60));
        assert!(cb.before_call().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_admits_one_probe_at_a_time() {
        let cb = CircuitBreaker::new("p", "m", config(2, 10));
        cb.record_outcome(false);
        cb.record_outcome(false);
        std::thread::sleep(Duration::from_millis(30));

        assert!(cb.before_call().is_ok());
        // Second probe denied while the first is outstanding
        assert!(cb.before_call().is_err());

        cb.record_outcome(true);
        assert!(cb.before_call().is_ok());
    }

    #[test]
    fn half_open_success_path_closes() {
        let cb = CircuitBreaker::new("p", "m", config(2, 10));
        cb.record_outcome(false);
        cb.record_outcome(false);
        std::thread::sleep(Duration::from_millis(30));

        assert!(cb.before_call().is_ok());
        cb.record_outcome(true);
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert!(cb.before_call().is_ok());
        cb.record_outcome(true);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_and_restarts_window() {
        let cb = CircuitBreaker::new("p", "m", config(2, 40));
        cb.record_outcome(false);
        cb.record_outcome(false);
        std::thread::sleep(Duration::from_millis(60));

        assert!(cb.before_call().is_ok());
        cb.record_outcome(false);
        assert_eq!(cb.state(), CircuitState::Open);

        // Window restarted: still rejecting right away
        assert!(cb.before_call().is_err());
    }

    #[test]
    fn reset_closes() {
        let cb = CircuitBreaker::new("p", "m", config(2, 60_000));
        cb.record_outcome(false);
        cb.record_outcome(false);
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.before_call().is_ok());
    }
}
