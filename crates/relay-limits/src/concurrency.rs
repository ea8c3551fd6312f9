//! Per-key in-flight concurrency control.
//!
//! Each API key gets a bounded semaphore; permits are RAII so a slot is
//! released exactly once on every exit path, including failover retries,
//! cancellation, and panics unwinding the request task. At capacity the
//! caller fails fast with a retryable error instead of queueing.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use relay_core::{mask_key, GatewayError};

/// Per-key concurrency limiter
pub struct ConcurrencyLimiter {
    max_per_key: u32,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ConcurrencyLimiter {
    /// Create a limiter allowing `max_per_key` in-flight requests per key
    #[must_use]
    pub fn new(max_per_key: u32) -> Self {
        Self {
            max_per_key,
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    fn semaphore(&self, key: &str) -> Arc<Semaphore> {
        let mut map = self.semaphores.lock();
        Arc::clone(
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_key as usize))),
        )
    }

    /// Acquire a slot for the key, failing fast when at capacity.
    ///
    /// # Errors
    /// Returns a retryable `RateLimited` error when the key has
    /// `max_per_key` requests already in flight.
    pub fn acquire(&self, key: &str) -> Result<ConcurrencyPermit, GatewayError> {
        match self.semaphore(key).try_acquire_owned() {
            Ok(permit) => {
                debug!(key = %mask_key(key), "Concurrency slot acquired");
                Ok(ConcurrencyPermit {
                    _permit: permit,
                    key_masked: mask_key(key),
                })
            }
            Err(_) => Err(GatewayError::rate_limited(
                format!("too many concurrent requests (max {})", self.max_per_key),
                Some(1),
            )),
        }
    }

    /// Slots currently in use for a key
    #[must_use]
    pub fn in_flight(&self, key: &str) -> u32 {
        let map = self.semaphores.lock();
        map.get(key).map_or(0, |sem| {
            self.max_per_key - sem.available_permits() as u32
        })
    }
}

/// RAII concurrency slot; released on drop.
#[derive(Debug)]
pub struct ConcurrencyPermit {
    _permit: OwnedSemaphorePermit,
    key_masked: String,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        debug!(key = %self.key_masked, "Concurrency slot released");
    }
}
