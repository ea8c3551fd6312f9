//! Error types for the gateway.
//!
//! Every upstream failure is mapped into a canonical [`ErrorKind`]; the
//! orchestrator and the circuit breaker base their failover and outcome
//! decisions on that kind, never on provider-specific error strings.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical classification of request failures.
///
/// The kind decides three independent questions:
/// - which HTTP status the client sees,
/// - whether the orchestrator may advance to the next provider in the chain,
/// - whether the circuit breaker counts the outcome as a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Request failed validation before any upstream call
    InvalidRequest,
    /// Missing or unknown API key
    AuthInvalid,
    /// Credit balance cannot cover the request
    InsufficientCredits,
    /// Trial expired or model not allowed for this caller
    Forbidden,
    /// Rate, plan, or trial limit exceeded
    RateLimited,
    /// Failover chain empty after filtering
    NoProvider,
    /// Upstream call exceeded its deadline
    Timeout,
    /// Connect or read error talking to the upstream
    Network,
    /// Upstream returned a 5xx
    Upstream5xx,
    /// Upstream rejected the request as malformed (client must fix)
    Upstream4xxClient,
    /// Upstream rejected our credentials
    Upstream4xxAuth,
    /// Upstream rate-limited the gateway
    UpstreamRateLimited,
    /// Provider refused the content on policy grounds
    ContentPolicy,
    /// Upstream stream delivered zero chunks
    EmptyStream,
    /// Client disconnected mid-request
    Cancelled,
    /// Anything else
    Internal,
}

impl ErrorKind {
    /// Whether the orchestrator may try the next provider in the chain.
    #[must_use]
    pub fn is_failover(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Network | Self::Upstream5xx | Self::UpstreamRateLimited
        )
    }

    /// Whether the circuit breaker counts this as a provider failure.
    ///
    /// Client-caused failures (bad request, cancellation, content policy)
    /// say nothing about provider health and must not trip the breaker.
    #[must_use]
    pub fn counts_for_breaker(self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::Network
                | Self::Upstream5xx
                | Self::Upstream4xxAuth
                | Self::UpstreamRateLimited
                | Self::EmptyStream
        )
    }

    /// HTTP status code surfaced to the client for this kind.
    #[must_use]
    pub fn status_code(self) -> u16 {
        match self {
            Self::InvalidRequest | Self::Upstream4xxClient => 400,
            Self::AuthInvalid => 401,
            Self::InsufficientCredits => 402,
            Self::Forbidden | Self::ContentPolicy => 403,
            Self::RateLimited => 429,
            Self::NoProvider => 503,
            Self::Timeout
            | Self::Network
            | Self::Upstream5xx
            | Self::Upstream4xxAuth
            | Self::UpstreamRateLimited
            | Self::EmptyStream => 502,
            Self::Cancelled | Self::Internal => 500,
        }
    }

    /// Machine-readable error type string for response bodies.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::AuthInvalid => "auth_invalid",
            Self::InsufficientCredits => "insufficient_credits",
            Self::Forbidden => "forbidden",
            Self::RateLimited => "rate_limited",
            Self::NoProvider => "no_provider",
            Self::Timeout => "upstream_timeout",
            Self::Network => "upstream_network",
            Self::Upstream5xx => "upstream_5xx",
            Self::Upstream4xxClient => "upstream_4xx_client",
            Self::Upstream4xxAuth => "upstream_4xx_auth",
            Self::UpstreamRateLimited => "upstream_rate_limited",
            Self::ContentPolicy => "content_policy",
            Self::EmptyStream => "empty_stream_error",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal_error",
        }
    }
}

/// Gateway error type
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Request validation failure
    #[error("{message}")]
    Validation {
        /// Human-readable message
        message: String,
        /// Offending field, when known
        field: Option<String>,
        /// Stable machine-readable code
        code: &'static str,
    },

    /// Authentication failure
    #[error("{message}")]
    Authentication {
        /// Human-readable message
        message: String,
    },

    /// Credit balance too low to admit the request
    #[error("insufficient credits")]
    InsufficientCredits,

    /// Trial or model-access restriction
    #[error("{message}")]
    Forbidden {
        /// Human-readable message
        message: String,
    },

    /// Rate, plan, or trial limit exceeded
    #[error("rate limit exceeded: {message}")]
    RateLimited {
        /// Which limit tripped
        message: String,
        /// Seconds until the caller may retry, when known
        retry_after: Option<u64>,
    },

    /// No provider is currently eligible for the requested model
    #[error("no eligible provider for model '{model}'")]
    NoProvider {
        /// Requested canonical model id
        model: String,
    },

    /// Circuit breaker is open for this (provider, model)
    #[error("circuit open for {provider}/{model}")]
    CircuitOpen {
        /// Provider slug
        provider: String,
        /// Canonical model id
        model: String,
    },

    /// Upstream provider failure, already classified
    #[error("{provider}: {message}")]
    Upstream {
        /// Provider slug
        provider: String,
        /// Human-readable message
        message: String,
        /// Canonical classification
        kind: ErrorKind,
        /// Upstream HTTP status, when one was received
        status: Option<u16>,
    },

    /// Configuration problem detected at startup or refresh
    #[error("configuration error: {message}")]
    Configuration {
        /// Human-readable message
        message: String,
    },

    /// Catch-all internal error
    #[error("internal error: {message}")]
    Internal {
        /// Human-readable message
        message: String,
    },
}

impl GatewayError {
    /// Create a validation error
    pub fn validation(
        message: impl Into<String>,
        field: Option<String>,
        code: &'static str,
    ) -> Self {
        Self::Validation {
            message: message.into(),
            field,
            code,
        }
    }

    /// Create an authentication error
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    /// Create a forbidden error
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    /// Create a rate-limited error
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<u64>) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after,
        }
    }

    /// Create an upstream error with its canonical classification
    pub fn upstream(
        provider: impl Into<String>,
        message: impl Into<String>,
        kind: ErrorKind,
        status: Option<u16>,
    ) -> Self {
        Self::Upstream {
            provider: provider.into(),
            message: message.into(),
            kind,
            status,
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Canonical classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::InvalidRequest,
            Self::Authentication { .. } => ErrorKind::AuthInvalid,
            Self::InsufficientCredits => ErrorKind::InsufficientCredits,
            Self::Forbidden { .. } => ErrorKind::Forbidden,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::NoProvider { .. } | Self::CircuitOpen { .. } => ErrorKind::NoProvider,
            Self::Upstream { kind, .. } => *kind,
            Self::Configuration { .. } | Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// HTTP status surfaced to the client.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            // An open circuit with no alternative reads as "no provider"
            Self::NoProvider { .. } | Self::CircuitOpen { .. } => 503,
            other => other.kind().status_code(),
        }
    }
}

/// Result alias used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failover_kinds() {
        assert!(ErrorKind::Timeout.is_failover());
        assert!(ErrorKind::Network.is_failover());
        assert!(ErrorKind::Upstream5xx.is_failover());
        assert!(!ErrorKind::Upstream4xxClient.is_failover());
        assert!(!ErrorKind::ContentPolicy.is_failover());
        assert!(!ErrorKind::Upstream4xxAuth.is_failover());
    }

    #[test]
    fn breaker_kinds() {
        assert!(ErrorKind::Upstream5xx.counts_for_breaker());
        assert!(ErrorKind::EmptyStream.counts_for_breaker());
        assert!(ErrorKind::Upstream4xxAuth.counts_for_breaker());
        assert!(!ErrorKind::Upstream4xxClient.counts_for_breaker());
        assert!(!ErrorKind::ContentPolicy.counts_for_breaker());
        assert!(!ErrorKind::Cancelled.counts_for_breaker());
    }

    #[test]
    fn status_codes() {
        assert_eq!(ErrorKind::InvalidRequest.status_code(), 400);
        assert_eq!(ErrorKind::AuthInvalid.status_code(), 401);
        assert_eq!(ErrorKind::InsufficientCredits.status_code(), 402);
        assert_eq!(ErrorKind::RateLimited.status_code(), 429);
        assert_eq!(ErrorKind::Upstream5xx.status_code(), 502);
        assert_eq!(ErrorKind::NoProvider.status_code(), 503);
    }

    #[test]
    fn circuit_open_maps_to_503() {
        let err = GatewayError::CircuitOpen {
            provider: "openrouter".to_string(),
            model: "gpt-4".to_string(),
        };
        assert_eq!(err.status_code(), 503);
    }
}
