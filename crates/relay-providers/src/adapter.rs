//! The provider adapter trait.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;
use tracing::warn;

use relay_core::{ChatCompletion, ChunkEvent, GatewayRequest, GatewayResult};

/// One upstream provider.
///
/// Implementations translate the gateway request into the provider's wire
/// format, execute it, and translate results (and errors) back. The model
/// id passed in is already provider-specific; routing owns the rewrite.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider slug this adapter serves
    fn slug(&self) -> &str;

    /// Deadline for one upstream call
    fn timeout(&self) -> Duration;

    /// Execute a non-streaming chat completion
    async fn request(
        &self,
        request: &GatewayRequest,
        model: &str,
    ) -> GatewayResult<ChatCompletion>;

    /// Open a streaming chat completion, decoded into canonical events.
    ///
    /// Transport failures after the stream is established surface as
    /// [`ChunkEvent::Error`] items; the call itself fails only when the
    /// stream cannot be opened.
    async fn request_stream(
        &self,
        request: &GatewayRequest,
        model: &str,
    ) -> GatewayResult<BoxStream<'static, ChunkEvent>>;
}

/// Raise provider-imposed parameter floors in place.
///
/// Gemini-family models reject `max_tokens` below 16; raising the floor
/// here keeps the upstream from failing a request the client reasonably
/// made.
pub fn apply_parameter_floors(request: &mut GatewayRequest, model: &str) {
    let lower = model.to_ascii_lowercase();
    if lower.contains("gemini") || lower.contains("google") {
        if let Some(max_tokens) = request.max_tokens {
            if max_tokens < 16 {
                warn!(
                    model = %model,
                    requested = max_tokens,
                    floor = 16,
                    "Raising max_tokens to the model's minimum"
                );
                request.max_tokens = Some(16);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::ChatMessage;

    fn request(max_tokens: Option<u32>) -> GatewayRequest {
        let mut request = GatewayRequest::new("x", vec![ChatMessage::user("hi")]);
        request.max_tokens = max_tokens;
        request
    }

    #[test]
    fn gemini_floor_raised() {
        let mut req = request(Some(5));
        apply_parameter_floors(&mut req, "gemini-1.5-flash");
        assert_eq!(req.max_tokens, Some(16));

        let mut req = request(Some(5));
        apply_parameter_floors(&mut req, "google/gemma-2-9b-it");
        assert_eq!(req.max_tokens, Some(16));
    }

    #[test]
    fn other_models_untouched() {
        let mut req = request(Some(5));
        apply_parameter_floors(&mut req, "gpt-4");
        assert_eq!(req.max_tokens, Some(5));
    }

    #[test]
    fn absent_max_tokens_untouched() {
        let mut req = request(None);
        apply_parameter_floors(&mut req, "gemini-1.5-flash");
        assert_eq!(req.max_tokens, None);
    }

    #[test]
    fn sufficient_values_untouched() {
        let mut req = request(Some(256));
        apply_parameter_floors(&mut req, "gemini-1.5-flash");
        assert_eq!(req.max_tokens, Some(256));
    }
}
