//! API error responses.
//!
//! Every user-visible error body carries a short human message, a
//! machine-readable `type`, and the request id. Internal detail never
//! leaves the process; a 500 names only the request id for support.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use relay_core::{GatewayError, RequestId};

/// An error ready to be rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError {
    /// The underlying gateway error
    pub error: GatewayError,
    /// Correlation id for the failing request
    pub request_id: RequestId,
    /// Extra response headers (trial state, retry hints)
    pub headers: Vec<(&'static str, String)>,
}

impl ApiError {
    /// Wrap a gateway error with its request id
    #[must_use]
    pub fn new(error: GatewayError, request_id: RequestId) -> Self {
        Self {
            error,
            request_id,
            headers: Vec::new(),
        }
    }

    /// Attach a response header
    #[must_use]
    pub fn with_header(mut self, name: &'static str, value: String) -> Self {
        self.headers.push((name, value));
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(
                request_id = %self.request_id,
                error = %self.error,
                "Internal server error"
            );
            format!("Internal server error (request ID: {})", self.request_id)
        } else {
            self.error.to_string()
        };

        let body = json!({
            "error": {
                "message": message,
                "type": self.error.kind().as_str(),
                "request_id": self.request_id,
            }
        });

        let mut response = (status, Json(body)).into_response();

        if let GatewayError::RateLimited {
            retry_after: Some(seconds),
            ..
        } = &self.error
        {
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        for (name, value) in self.headers {
            if let Ok(value) = HeaderValue::from_str(&value) {
                response.headers_mut().insert(name, value);
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn error_body_shape() {
        let err = ApiError::new(
            GatewayError::authentication("Invalid API key"),
            RequestId::from("req-1".to_string()),
        );
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let bytes = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .expect("body");
        let body: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(body["error"]["type"], "auth_invalid");
        assert_eq!(body["error"]["request_id"], "req-1");
    }

    #[tokio::test]
    async fn internal_errors_hide_detail() {
        let err = ApiError::new(
            GatewayError::internal("connection pool exhausted at core.rs:42"),
            RequestId::from("req-2".to_string()),
        );
        let response = err.into_response();
        let bytes = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .expect("body");
        let body: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        let message = body["error"]["message"].as_str().expect("message");
        assert!(!message.contains("core.rs"));
        assert!(message.contains("req-2"));
    }

    #[tokio::test]
    async fn retry_after_header_on_429() {
        let err = ApiError::new(
            GatewayError::rate_limited("request limit exceeded", Some(42)),
            RequestId::generate(),
        );
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok()),
            Some("42")
        );
    }
}
