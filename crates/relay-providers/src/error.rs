//! Upstream error translation.
//!
//! Maps provider HTTP responses and transport failures into the canonical
//! [`ErrorKind`] taxonomy. This mapping is what the orchestrator's failover
//! decision and the circuit breaker's outcome recording run on.

use relay_core::{ErrorKind, GatewayError};

/// Phrases that mark a policy refusal regardless of status code
const POLICY_MARKERS: &[&str] = &[
    "content_policy",
    "content policy",
    "content management policy",
    "flagged",
    "safety system",
];

/// Translate an upstream HTTP status + body into a gateway error.
#[must_use]
pub fn map_status(provider: &str, status: u16, body: &str) -> GatewayError {
    let message = extract_message(body).unwrap_or_else(|| format!("HTTP {status}"));

    let kind = if is_policy_refusal(&message) || is_policy_refusal(body) {
        ErrorKind::ContentPolicy
    } else {
        match status {
            401 | 403 => ErrorKind::Upstream4xxAuth,
            408 => ErrorKind::Timeout,
            429 => ErrorKind::UpstreamRateLimited,
            400..=499 => ErrorKind::Upstream4xxClient,
            500..=599 => ErrorKind::Upstream5xx,
            _ => ErrorKind::Internal,
        }
    };

    GatewayError::upstream(provider, message, kind, Some(status))
}

/// Translate a reqwest transport error into a gateway error.
#[must_use]
pub fn map_transport(provider: &str, error: &reqwest::Error) -> GatewayError {
    let kind = if error.is_timeout() {
        ErrorKind::Timeout
    } else {
        ErrorKind::Network
    };
    GatewayError::upstream(provider, error.to_string(), kind, None)
}

fn is_policy_refusal(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    POLICY_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Pull the human message out of an OpenAI-style error body, when present.
fn extract_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("error")
        .and_then(|e| e.get("message"))
        .or_else(|| value.get("message"))
        .and_then(|m| m.as_str())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind_of(status: u16, body: &str) -> ErrorKind {
        map_status("test", status, body).kind()
    }

    #[test]
    fn status_mapping() {
        assert_eq!(kind_of(400, "{}"), ErrorKind::Upstream4xxClient);
        assert_eq!(kind_of(401, "{}"), ErrorKind::Upstream4xxAuth);
        assert_eq!(kind_of(403, "{}"), ErrorKind::Upstream4xxAuth);
        assert_eq!(kind_of(404, "{}"), ErrorKind::Upstream4xxClient);
        assert_eq!(kind_of(408, "{}"), ErrorKind::Timeout);
        assert_eq!(kind_of(429, "{}"), ErrorKind::UpstreamRateLimited);
        assert_eq!(kind_of(500, "{}"), ErrorKind::Upstream5xx);
        assert_eq!(kind_of(503, "{}"), ErrorKind::Upstream5xx);
    }

    #[test]
    fn policy_refusal_detected_from_body() {
        let body = r#"{"error": {"message": "Your request was flagged by our safety system"}}"#;
        assert_eq!(kind_of(400, body), ErrorKind::ContentPolicy);
    }

    #[test]
    fn message_extracted_from_openai_shape() {
        let body = r#"{"error": {"message": "model not found", "type": "invalid_request_error"}}"#;
        let err = map_status("openrouter", 404, body);
        assert!(err.to_string().contains("model not found"));
    }

    #[test]
    fn unparseable_body_falls_back_to_status() {
        let err = map_status("openrouter", 502, "<html>bad gateway</html>");
        assert!(err.to_string().contains("HTTP 502"));
        assert_eq!(err.kind(), ErrorKind::Upstream5xx);
    }
}
