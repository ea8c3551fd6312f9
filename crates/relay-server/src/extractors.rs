//! Request extractors.

use async_trait::async_trait;
use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use std::convert::Infallible;
use std::net::SocketAddr;

/// Bearer API key from the `Authorization` header; `None` selects the
/// anonymous path.
pub struct ApiKey(pub Option<String>);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for ApiKey {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let key = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| {
                let (scheme, token) = value.split_once(' ')?;
                scheme
                    .eq_ignore_ascii_case("bearer")
                    .then(|| token.trim().to_string())
            })
            .filter(|token| !token.is_empty());
        Ok(Self(key))
    }
}

/// Best-effort client IP: first `x-forwarded-for` entry when present,
/// otherwise the peer address. Anonymous quotas hash whichever is found.
pub struct ClientIp(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(|ip| ip.trim().to_string())
            .filter(|ip| !ip.is_empty());

        if let Some(ip) = forwarded {
            return Ok(Self(ip));
        }

        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Ok(Self(peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract_key(request: Request<()>) -> Option<String> {
        let (mut parts, ()) = request.into_parts();
        let ApiKey(key) = ApiKey::from_request_parts(&mut parts, &())
            .await
            .expect("infallible");
        key
    }

    #[tokio::test]
    async fn bearer_key_extracted() {
        let request = Request::builder()
            .header("authorization", "Bearer k_test")
            .body(())
            .expect("request");
        assert_eq!(extract_key(request).await, Some("k_test".to_string()));
    }

    #[tokio::test]
    async fn missing_header_is_anonymous() {
        let request = Request::builder().body(()).expect("request");
        assert_eq!(extract_key(request).await, None);
    }

    #[tokio::test]
    async fn non_bearer_scheme_ignored() {
        let request = Request::builder()
            .header("authorization", "Basic dXNlcjpwYXNz")
            .body(())
            .expect("request");
        assert_eq!(extract_key(request).await, None);
    }

    #[tokio::test]
    async fn forwarded_for_takes_first_entry() {
        let request = Request::builder()
            .header("x-forwarded-for", "192.0.2.7, 10.0.0.1")
            .body(())
            .expect("request");
        let (mut parts, ()) = request.into_parts();
        let ClientIp(ip) = ClientIp::from_request_parts(&mut parts, &())
            .await
            .expect("infallible");
        assert_eq!(ip, "192.0.2.7");
    }
}
