//! Rate-limit response headers.
//!
//! Emits both the IETF draft headers (`RateLimit-*`, with `RateLimit-Reset`
//! in delta seconds) and the legacy vendor headers (`X-RateLimit-*`, with
//! absolute Unix reset timestamps) so clients can rely on either
//! convention.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::window::Decision;

/// Build rate-limit headers for a response from a limiter decision.
///
/// Returned as name/value pairs; the server layers them onto the response.
#[must_use]
pub fn rate_limit_headers(decision: &Decision) -> Vec<(&'static str, String)> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut headers = Vec::with_capacity(9);

    // IETF draft standard headers; the requests dimension maps onto the
    // single-dimension IETF model.
    headers.push(("RateLimit-Limit", decision.limit_requests.to_string()));
    headers.push(("RateLimit-Remaining", decision.remaining_requests.to_string()));
    // RateLimit-Reset is seconds-until-reset, not a Unix timestamp
    headers.push((
        "RateLimit-Reset",
        decision.reset_requests.saturating_sub(now).to_string(),
    ));

    // Legacy X-RateLimit-* headers, absolute Unix reset timestamps
    headers.push((
        "X-RateLimit-Limit-Requests",
        decision.limit_requests.to_string(),
    ));
    headers.push((
        "X-RateLimit-Remaining-Requests",
        decision.remaining_requests.to_string(),
    ));
    headers.push((
        "X-RateLimit-Reset-Requests",
        decision.reset_requests.to_string(),
    ));
    headers.push(("X-RateLimit-Limit-Tokens", decision.limit_tokens.to_string()));
    headers.push((
        "X-RateLimit-Remaining-Tokens",
        decision.remaining_tokens.to_string(),
    ));
    headers.push(("X-RateLimit-Reset-Tokens", decision.reset_tokens.to_string()));

    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision() -> Decision {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Decision {
            allowed: true,
            reason: None,
            retry_after: None,
            limit_requests: 250,
            remaining_requests: 249,
            reset_requests: now + 42,
            limit_tokens: 10_000,
            remaining_tokens: 9_900,
            reset_tokens: now + 42,
        }
    }

    fn value<'a>(headers: &'a [(&'static str, String)], name: &str) -> &'a str {
        headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
            .unwrap_or_default()
    }

    #[test]
    fn ietf_reset_is_delta_seconds() {
        let headers = rate_limit_headers(&decision());
        let reset: u64 = value(&headers, "RateLimit-Reset").parse().expect("number");
        assert!(reset <= 42, "expected delta seconds, got {reset}");
    }

    #[test]
    fn legacy_reset_is_absolute() {
        let headers = rate_limit_headers(&decision());
        let reset: u64 = value(&headers, "X-RateLimit-Reset-Requests")
            .parse()
            .expect("number");
        // Absolute Unix timestamps are far larger than any delta
        assert!(reset > 1_600_000_000);
    }

    #[test]
    fn both_families_present() {
        let headers = rate_limit_headers(&decision());
        assert_eq!(value(&headers, "RateLimit-Limit"), "250");
        assert_eq!(value(&headers, "RateLimit-Remaining"), "249");
        assert_eq!(value(&headers, "X-RateLimit-Limit-Requests"), "250");
        assert_eq!(value(&headers, "X-RateLimit-Limit-Tokens"), "10000");
        assert_eq!(value(&headers, "X-RateLimit-Remaining-Tokens"), "9900");
    }
}
