//! The adapter dispatch table.
//!
//! Slug-keyed registry of provider adapters plus the deadline-wrapped
//! dispatch entry points the orchestrator calls. A timeout surfaces as a
//! canonical `Timeout` error, which the orchestrator treats as a failover
//! signal.

use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use relay_core::{
    ChatCompletion, ChunkEvent, ErrorKind, GatewayError, GatewayRequest, GatewayResult,
};

use crate::adapter::{apply_parameter_floors, ProviderAdapter};

/// Slug-keyed adapter registry
#[derive(Default)]
pub struct AdapterTable {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl AdapterTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its slug. Last registration wins.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        let slug = adapter.slug().to_string();
        if self.adapters.insert(slug.clone(), adapter).is_some() {
            warn!(provider = %slug, "Replacing existing adapter registration");
        }
    }

    /// Adapter for a slug
    #[must_use]
    pub fn get(&self, slug: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(slug).cloned()
    }

    /// All registered slugs, sorted
    #[must_use]
    pub fn slugs(&self) -> Vec<String> {
        let mut slugs: Vec<String> = self.adapters.keys().cloned().collect();
        slugs.sort();
        slugs
    }

    /// Number of registered adapters
    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    fn adapter(&self, slug: &str) -> GatewayResult<Arc<dyn ProviderAdapter>> {
        self.get(slug).ok_or_else(|| {
            GatewayError::configuration(format!("no adapter registered for provider '{slug}'"))
        })
    }

    /// Execute a non-streaming call against a provider with its deadline.
    pub async fn call(
        &self,
        slug: &str,
        request: &GatewayRequest,
        model: &str,
    ) -> GatewayResult<ChatCompletion> {
        let adapter = self.adapter(slug)?;
        let mut request = request.clone();
        apply_parameter_floors(&mut request, model);

        debug!(provider = %slug, model = %model, timeout = ?adapter.timeout(), "Dispatching call");

        match tokio::time::timeout(adapter.timeout(), adapter.request(&request, model)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::upstream(
                slug,
                format!("deadline of {:?} exceeded", adapter.timeout()),
                ErrorKind::Timeout,
                None,
            )),
        }
    }

    /// Open a streaming call against a provider. The deadline covers
    /// stream establishment; chunk-to-chunk gaps are the client's to
    /// tolerate, as upstream generation pauses are normal.
    pub async fn call_stream(
        &self,
        slug: &str,
        request: &GatewayRequest,
        model: &str,
    ) -> GatewayResult<BoxStream<'static, ChunkEvent>> {
        let adapter = self.adapter(slug)?;
        let mut request = request.clone();
        apply_parameter_floors(&mut request, model);

        debug!(provider = %slug, model = %model, "Dispatching stream");

        match tokio::time::timeout(adapter.timeout(), adapter.request_stream(&request, model)).await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::upstream(
                slug,
                format!("deadline of {:?} exceeded opening stream", adapter.timeout()),
                ErrorKind::Timeout,
                None,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_stream::stream;
    use async_trait::async_trait;
    use relay_core::{ChatMessage, ResponseMessage};
    use std::time::Duration;

    /// Test adapter with scriptable latency
    struct SlowAdapter {
        slug: String,
        delay: Duration,
        timeout: Duration,
    }

    #[async_trait]
    impl ProviderAdapter for SlowAdapter {
        fn slug(&self) -> &str {
            &self.slug
        }

        fn timeout(&self) -> Duration {
            self.timeout
        }

        async fn request(
            &self,
            _request: &GatewayRequest,
            model: &str,
        ) -> GatewayResult<ChatCompletion> {
            tokio::time::sleep(self.delay).await;
            Ok(ChatCompletion::new(
                "chatcmpl-test",
                model,
                ResponseMessage::assistant("ok"),
            ))
        }

        async fn request_stream(
            &self,
            _request: &GatewayRequest,
            _model: &str,
        ) -> GatewayResult<BoxStream<'static, ChunkEvent>> {
            tokio::time::sleep(self.delay).await;
            Ok(Box::pin(stream! {
                yield ChunkEvent::Content {
                    index: 0,
                    text: "ok".to_string(),
                };
            }))
        }
    }

    fn table(delay_ms: u64, timeout_ms: u64) -> AdapterTable {
        let mut table = AdapterTable::new();
        table.register(Arc::new(SlowAdapter {
            slug: "test".to_string(),
            delay: Duration::from_millis(delay_ms),
            timeout: Duration::from_millis(timeout_ms),
        }));
        table
    }

    fn request() -> GatewayRequest {
        GatewayRequest::new("gpt-4", vec![ChatMessage::user("Hi")])
    }

    #[tokio::test]
    async fn call_within_deadline_succeeds() {
        let table = table(1, 1_000);
        let completion = table.call("test", &request(), "gpt-4").await.expect("ok");
        assert_eq!(completion.first_content(), Some("ok"));
    }

    #[tokio::test]
    async fn deadline_expiry_is_timeout_kind() {
        let table = table(200, 20);
        let err = table
            .call("test", &request(), "gpt-4")
            .await
            .expect_err("timeout");
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.kind().is_failover());
    }

    #[tokio::test]
    async fn unknown_slug_is_configuration_error() {
        let table = AdapterTable::new();
        let err = table
            .call("ghost", &request(), "gpt-4")
            .await
            .expect_err("missing");
        assert!(matches!(err, GatewayError::Configuration { .. }));
    }

    #[test]
    fn slugs_sorted() {
        let mut table = AdapterTable::new();
        for slug in ["zeta", "alpha", "mid"] {
            table.register(Arc::new(SlowAdapter {
                slug: slug.to_string(),
                delay: Duration::ZERO,
                timeout: Duration::from_secs(1),
            }));
        }
        assert_eq!(table.slugs(), vec!["alpha", "mid", "zeta"]);
        assert_eq!(table.len(), 3);
    }
}
