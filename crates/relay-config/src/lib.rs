//! # Relay Config
//!
//! Configuration management for the LLM Relay gateway.
//!
//! Configuration is read from an optional YAML file (`RELAY_CONFIG` path)
//! with environment-variable overrides for deployment-level settings.
//! Provider credentials are always sourced from the environment, never from
//! the file.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Configuration error type
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// File path
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// File could not be parsed
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A value failed validation
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Top-level gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// HTTP server settings
    pub server: ServerConfig,
    /// Cache layer settings
    pub cache: CacheConfig,
    /// Rate limiting defaults
    pub rate_limit: RateLimitConfig,
    /// Circuit breaker thresholds
    pub breaker: BreakerConfig,
    /// Anonymous access policy
    pub anonymous: AnonymousConfig,
    /// Metrics retention
    pub metrics: MetricsConfig,
    /// Provider endpoints and credentials
    pub providers: Vec<ProviderConfig>,
    /// Model catalog seed; refreshed from the datastore at runtime
    pub models: Vec<ModelConfig>,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Cache layer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Positive TTL for user lookups
    #[serde(with = "humantime_serde")]
    pub auth_positive_ttl: Duration,
    /// Negative TTL for unknown keys
    #[serde(with = "humantime_serde")]
    pub auth_negative_ttl: Duration,
    /// How long a successful availability probe is trusted
    #[serde(with = "humantime_serde")]
    pub probe_positive_ttl: Duration,
    /// How long a failed availability probe is trusted
    #[serde(with = "humantime_serde")]
    pub probe_negative_ttl: Duration,
    /// Entry cap for the in-process fallback map
    pub memory_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            auth_positive_ttl: Duration::from_secs(300),
            auth_negative_ttl: Duration::from_secs(60),
            probe_positive_ttl: Duration::from_secs(30),
            probe_negative_ttl: Duration::from_secs(5),
            memory_capacity: 10_000,
        }
    }
}

/// Rate limiting defaults, applied per API key
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests allowed per minute
    pub requests_per_minute: u64,
    /// Requests allowed per hour
    pub requests_per_hour: u64,
    /// Requests allowed per day
    pub requests_per_day: u64,
    /// Tokens allowed per minute
    pub tokens_per_minute: u64,
    /// Tokens allowed per hour
    pub tokens_per_hour: u64,
    /// Tokens allowed per day
    pub tokens_per_day: u64,
    /// In-flight requests allowed per key
    pub max_concurrency: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 250,
            requests_per_hour: 5_000,
            requests_per_day: 50_000,
            tokens_per_minute: 100_000,
            tokens_per_hour: 2_000_000,
            tokens_per_day: 20_000_000,
            max_concurrency: 20,
        }
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Failure rate that opens the circuit
    pub failure_rate: f64,
    /// Minimum samples before the rate applies
    pub min_samples: u32,
    /// How long the circuit stays open
    #[serde(with = "humantime_serde")]
    pub open_duration: Duration,
    /// Consecutive half-open successes required to close
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate: 0.5,
            min_samples: 10,
            open_duration: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

/// Anonymous access policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnonymousConfig {
    /// Requests allowed per IP per day
    pub daily_limit: u32,
    /// Models anonymous callers may use
    pub allowed_models: Vec<String>,
}

impl Default for AnonymousConfig {
    fn default() -> Self {
        Self {
            daily_limit: 3,
            allowed_models: vec![
                "google/gemini-2.0-flash-exp:free".to_string(),
                "google/gemma-2-9b-it:free".to_string(),
                "meta-llama/llama-3.2-3b-instruct:free".to_string(),
                "meta-llama/llama-3.1-8b-instruct:free".to_string(),
                "mistralai/mistral-7b-instruct:free".to_string(),
            ],
        }
    }
}

/// Metrics retention settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// How long hourly aggregates are kept in the fast tier
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
    /// Bounded error-list size per provider
    pub error_list_size: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(7_200),
            error_list_size: 100,
        }
    }
}

/// Wire protocol family a provider speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible chat completions
    #[default]
    Openai,
    /// Anthropic messages API (typed event stream)
    Anthropic,
    /// Google Gemini generateContent (candidates/parts)
    Gemini,
}

/// One configured upstream provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider slug, unique across the table
    pub slug: String,
    /// Wire protocol family
    #[serde(default)]
    pub kind: ProviderKind,
    /// Base URL of the provider API
    pub base_url: String,
    /// Environment variable holding the credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Whether the provider participates in routing
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Per-provider timeout override
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
}

fn default_true() -> bool {
    true
}

/// One model carried by one provider, as seeded from configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Canonical model id
    pub canonical_id: String,
    /// Provider slug carrying it
    pub provider: String,
    /// Provider-specific id when it differs from the canonical one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_model_id: Option<String>,
    /// USD per input token
    #[serde(default)]
    pub input_price_per_token: f64,
    /// USD per output token
    #[serde(default)]
    pub output_price_per_token: f64,
    /// Context window size
    #[serde(default)]
    pub context_length: u32,
}

/// Default upstream call deadline
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

impl RelayConfig {
    /// Load configuration: optional YAML file named by `RELAY_CONFIG`,
    /// then environment overrides.
    ///
    /// # Errors
    /// Returns an error when the named file is unreadable or malformed.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match env::var("RELAY_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    ///
    /// # Errors
    /// Returns an error when the file is unreadable or malformed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&raw)?;
        info!(path = %path.display(), "Configuration file loaded");
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = env::var("RELAY_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = env::var("RELAY_PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => warn!(value = %port, "Ignoring unparseable RELAY_PORT"),
            }
        }
        if let Ok(limit) = env::var("RELAY_ANONYMOUS_DAILY_LIMIT") {
            match limit.parse() {
                Ok(limit) => self.anonymous.daily_limit = limit,
                Err(_) => warn!(value = %limit, "Ignoring unparseable RELAY_ANONYMOUS_DAILY_LIMIT"),
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashMap::new();
        for provider in &self.providers {
            if provider.slug.trim().is_empty() {
                return Err(ConfigError::Invalid("provider slug cannot be empty".into()));
            }
            if seen.insert(provider.slug.clone(), ()).is_some() {
                return Err(ConfigError::Invalid(format!(
                    "duplicate provider slug '{}'",
                    provider.slug
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.breaker.failure_rate) {
            return Err(ConfigError::Invalid(format!(
                "breaker failure_rate must be in [0, 1], got {}",
                self.breaker.failure_rate
            )));
        }
        Ok(())
    }

    /// Resolve the credential for a provider from the environment.
    #[must_use]
    pub fn provider_credential(provider: &ProviderConfig) -> Option<String> {
        provider
            .api_key_env
            .as_ref()
            .and_then(|var| env::var(var).ok())
            .filter(|key| !key.is_empty())
    }

    /// Effective timeout for a provider slug.
    #[must_use]
    pub fn provider_timeout(&self, slug: &str) -> Duration {
        self.providers
            .iter()
            .find(|p| p.slug == slug)
            .and_then(|p| p.timeout)
            .unwrap_or(DEFAULT_PROVIDER_TIMEOUT)
    }
}
