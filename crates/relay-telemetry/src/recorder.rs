//! In-process metrics recorder.
//!
//! For each completed request the recorder updates, per provider:
//! - hourly aggregates (requests, tokens, cost), retained ~2 hours
//! - a latency reservoir per (provider, model), trimmed to the last hour
//! - a bounded list of recent errors
//! - a rolling health score in [0, 100]
//!
//! plus the Prometheus counters exposed at `/metrics`. Recording never
//! fails and never blocks the request path; the worst case under lock
//! contention is a short critical section over in-process maps.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, warn};

use relay_config::MetricsConfig;

const HEALTH_SUCCESS_DELTA: f64 = 2.0;
const HEALTH_FAILURE_DELTA: f64 = -5.0;
const ERROR_MESSAGE_CAP: usize = 500;
const LATENCY_WINDOW: Duration = Duration::from_secs(3_600);

/// Metrics for a single completed request
#[derive(Debug, Clone)]
pub struct RequestMetrics {
    /// Provider that served (or failed) the request
    pub provider: String,
    /// Canonical model id
    pub model: String,
    /// Wall-clock latency in milliseconds
    pub latency_ms: u64,
    /// Whether the request succeeded
    pub success: bool,
    /// Cost in USD
    pub cost: f64,
    /// Input tokens
    pub tokens_input: u32,
    /// Output tokens
    pub tokens_output: u32,
    /// Error message when failed
    pub error_message: Option<String>,
}

/// Hourly aggregate for one provider
#[derive(Debug, Clone, Copy, Default)]
pub struct HourlyStats {
    /// All requests
    pub total_requests: u64,
    /// Successful requests
    pub successful_requests: u64,
    /// Failed requests
    pub failed_requests: u64,
    /// Input tokens
    pub input_tokens: u64,
    /// Output tokens
    pub output_tokens: u64,
    /// Cost in USD
    pub total_cost: f64,
}

#[derive(Debug, Clone)]
struct ErrorEntry {
    model: String,
    message: String,
    latency_ms: u64,
    timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct RecorderInner {
    /// (provider, "YYYY-MM-DD:HH") -> aggregate
    hourly: HashMap<(String, String), HourlyStats>,
    /// (provider, model) -> (unix seconds, latency ms)
    latency: HashMap<(String, String), VecDeque<(i64, u64)>>,
    /// provider -> recent errors, newest first
    errors: HashMap<String, VecDeque<ErrorEntry>>,
    /// provider -> health score
    health: HashMap<String, f64>,
}

struct PromMetrics {
    registry: Registry,
    requests: IntCounterVec,
    duration: HistogramVec,
    tokens: IntCounterVec,
    credits: CounterVec,
}

impl PromMetrics {
    fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("model_inference_requests", "Inference requests by outcome"),
            &["provider", "model", "status"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new("model_inference_duration_seconds", "Inference latency"),
            &["provider", "model"],
        )?;
        let tokens = IntCounterVec::new(
            Opts::new("tokens_used", "Tokens consumed"),
            &["provider", "model", "token_type"],
        )?;
        let credits = CounterVec::new(
            Opts::new("credits_used", "Credits consumed in USD"),
            &["provider", "model"],
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(tokens.clone()))?;
        registry.register(Box::new(credits.clone()))?;

        Ok(Self {
            registry,
            requests,
            duration,
            tokens,
            credits,
        })
    }
}

/// The metrics recorder
pub struct MetricsRecorder {
    config: MetricsConfig,
    inner: Mutex<RecorderInner>,
    prom: Option<PromMetrics>,
}

impl MetricsRecorder {
    /// Create a recorder
    #[must_use]
    pub fn new(config: MetricsConfig) -> Self {
        let prom = match PromMetrics::new() {
            Ok(prom) => Some(prom),
            Err(e) => {
                warn!(error = %e, "Prometheus registry setup failed, text metrics disabled");
                None
            }
        };
        Self {
            config,
            inner: Mutex::new(RecorderInner::default()),
            prom,
        }
    }

    fn hour_key(now: DateTime<Utc>) -> String {
        now.format("%Y-%m-%d:%H").to_string()
    }

    /// Record one completed request. Infallible by design.
    pub fn record(&self, metrics: &RequestMetrics) {
        let now = Utc::now();

        {
            let mut inner = self.inner.lock();

            let aggregate = inner
                .hourly
                .entry((metrics.provider.clone(), Self::hour_key(now)))
                .or_default();
            aggregate.total_requests += 1;
            if metrics.success {
                aggregate.successful_requests += 1;
            } else {
                aggregate.failed_requests += 1;
            }
            aggregate.input_tokens += u64::from(metrics.tokens_input);
            aggregate.output_tokens += u64::from(metrics.tokens_output);
            aggregate.total_cost += metrics.cost;

            let reservoir = inner
                .latency
                .entry((metrics.provider.clone(), metrics.model.clone()))
                .or_default();
            reservoir.push_back((now.timestamp(), metrics.latency_ms));
            let cutoff = now.timestamp() - LATENCY_WINDOW.as_secs() as i64;
            while reservoir.front().is_some_and(|(ts, _)| *ts < cutoff) {
                reservoir.pop_front();
            }

            if !metrics.success {
                if let Some(message) = &metrics.error_message {
                    let list = inner.errors.entry(metrics.provider.clone()).or_default();
                    list.push_front(ErrorEntry {
                        model: metrics.model.clone(),
                        message: message.chars().take(ERROR_MESSAGE_CAP).collect(),
                        latency_ms: metrics.latency_ms,
                        timestamp: now,
                    });
                    list.truncate(self.config.error_list_size);
                }
            }

            let delta = if metrics.success {
                HEALTH_SUCCESS_DELTA
            } else {
                HEALTH_FAILURE_DELTA
            };
            let score = inner
                .health
                .entry(metrics.provider.clone())
                .or_insert(100.0);
            *score = (*score + delta).clamp(0.0, 100.0);

            Self::prune_hourly(&mut inner, now, self.config.retention);
        }

        if let Some(prom) = &self.prom {
            let status = if metrics.success { "success" } else { "error" };
            prom.requests
                .with_label_values(&[&metrics.provider, &metrics.model, status])
                .inc();
            prom.duration
                .with_label_values(&[&metrics.provider, &metrics.model])
                .observe(metrics.latency_ms as f64 / 1_000.0);
            if metrics.tokens_input > 0 {
                prom.tokens
                    .with_label_values(&[&metrics.provider, &metrics.model, "input"])
                    .inc_by(u64::from(metrics.tokens_input));
            }
            if metrics.tokens_output > 0 {
                prom.tokens
                    .with_label_values(&[&metrics.provider, &metrics.model, "output"])
                    .inc_by(u64::from(metrics.tokens_output));
            }
            if metrics.cost > 0.0 {
                prom.credits
                    .with_label_values(&[&metrics.provider, &metrics.model])
                    .inc_by(metrics.cost);
            }
        }

        debug!(
            provider = %metrics.provider,
            model = %metrics.model,
            latency_ms = metrics.latency_ms,
            success = metrics.success,
            "Recorded request metrics"
        );
    }

    fn prune_hourly(inner: &mut RecorderInner, now: DateTime<Utc>, retention: Duration) {
        let cutoff = Self::hour_key(now - chrono::Duration::seconds(retention.as_secs() as i64));
        inner.hourly.retain(|(_, hour), _| *hour >= cutoff);
    }

    /// Current health score for a provider; 100 when unobserved
    #[must_use]
    pub fn health_score(&self, provider: &str) -> f64 {
        self.inner
            .lock()
            .health
            .get(provider)
            .copied()
            .unwrap_or(100.0)
    }

    /// Health scores for every observed provider
    #[must_use]
    pub fn all_health_scores(&self) -> HashMap<String, f64> {
        self.inner.lock().health.clone()
    }

    /// Aggregate for a provider in the current hour
    #[must_use]
    pub fn current_hour(&self, provider: &str) -> HourlyStats {
        let key = (provider.to_string(), Self::hour_key(Utc::now()));
        self.inner.lock().hourly.get(&key).copied().unwrap_or_default()
    }

    /// Latency percentiles over the last hour for a (provider, model)
    #[must_use]
    pub fn latency_percentiles(
        &self,
        provider: &str,
        model: &str,
        percentiles: &[u8],
    ) -> HashMap<String, f64> {
        let inner = self.inner.lock();
        let Some(reservoir) = inner
            .latency
            .get(&(provider.to_string(), model.to_string()))
        else {
            return HashMap::new();
        };
        if reservoir.is_empty() {
            return HashMap::new();
        }

        let mut values: Vec<u64> = reservoir.iter().map(|(_, latency)| *latency).collect();
        values.sort_unstable();
        let n = values.len();

        let mut result = HashMap::new();
        for p in percentiles {
            let idx = ((f64::from(*p) / 100.0) * n as f64) as usize;
            result.insert(format!("p{p}"), values[idx.min(n - 1)] as f64);
        }
        result.insert("count".to_string(), n as f64);
        result
    }

    /// Most recent error messages for a provider, newest first
    #[must_use]
    pub fn recent_errors(&self, provider: &str, limit: usize) -> Vec<String> {
        self.inner
            .lock()
            .errors
            .get(provider)
            .map(|list| {
                list.iter()
                    .take(limit)
                    .map(|e| {
                        format!(
                            "[{}] {} ({}ms): {}",
                            e.timestamp.format("%H:%M:%S"),
                            e.model,
                            e.latency_ms,
                            e.message
                        )
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Prometheus text exposition for the `/metrics` endpoint
    #[must_use]
    pub fn gather(&self) -> String {
        let Some(prom) = &self.prom else {
            return String::new();
        };
        let families = prom.registry.gather();
        let mut buffer = Vec::new();
        if TextEncoder::new().encode(&families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(success: bool) -> RequestMetrics {
        RequestMetrics {
            provider: "openrouter".to_string(),
            model: "gpt-4".to_string(),
            latency_ms: 250,
            success,
            cost: 0.01,
            tokens_input: 10,
            tokens_output: 20,
            error_message: if success {
                None
            } else {
                Some("upstream 503".to_string())
            },
        }
    }

    #[test]
    fn hourly_aggregates_accumulate() {
        let recorder = MetricsRecorder::default();
        recorder.record(&sample(true));
        recorder.record(&sample(true));
        recorder.record(&sample(false));

        let stats = recorder.current_hour("openrouter");
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.successful_requests, 2);
        assert_eq!(stats.failed_requests, 1);
        assert_eq!(stats.input_tokens, 30);
        assert_eq!(stats.output_tokens, 60);
        assert!((stats.total_cost - 0.03).abs() < 1e-9);
    }

    #[test]
    fn health_score_moves_and_clamps() {
        let recorder = MetricsRecorder::default();
        assert!((recorder.health_score("openrouter") - 100.0).abs() < f64::EPSILON);

        recorder.record(&sample(false));
        assert!((recorder.health_score("openrouter") - 95.0).abs() < f64::EPSILON);

        recorder.record(&sample(true));
        assert!((recorder.health_score("openrouter") - 97.0).abs() < f64::EPSILON);

        // Cannot exceed 100
        for _ in 0..10 {
            recorder.record(&sample(true));
        }
        assert!((recorder.health_score("openrouter") - 100.0).abs() < f64::EPSILON);

        // Cannot go below 0
        for _ in 0..30 {
            recorder.record(&sample(false));
        }
        assert!(recorder.health_score("openrouter") >= 0.0);
    }

    #[test]
    fn error_list_is_bounded() {
        let recorder = MetricsRecorder::new(MetricsConfig {
            error_list_size: 5,
            ..MetricsConfig::default()
        });
        for _ in 0..20 {
            recorder.record(&sample(false));
        }
        assert_eq!(recorder.recent_errors("openrouter", 100).len(), 5);
    }

    #[test]
    fn error_messages_truncated() {
        let recorder = MetricsRecorder::default();
        let mut metrics = sample(false);
        metrics.error_message = Some("x".repeat(2_000));
        recorder.record(&metrics);

        let errors = recorder.recent_errors("openrouter", 1);
        assert!(errors[0].len() < 600);
    }

    #[test]
    fn percentiles_from_reservoir() {
        let recorder = MetricsRecorder::default();
        for latency in [100u64, 200, 300, 400, 500] {
            recorder.record(&RequestMetrics {
                latency_ms: latency,
                ..sample(true)
            });
        }

        let stats = recorder.latency_percentiles("openrouter", "gpt-4", &[50, 99]);
        assert_eq!(stats["count"], 5.0);
        assert!(stats["p50"] >= 200.0 && stats["p50"] <= 400.0);
        assert_eq!(stats["p99"], 500.0);
    }

    #[test]
    fn gather_includes_counters() {
        let recorder = MetricsRecorder::default();
        recorder.record(&sample(true));
        let text = recorder.gather();
        assert!(text.contains("model_inference_requests"));
        assert!(text.contains("tokens_used"));
    }
}
