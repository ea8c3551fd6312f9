//! Model-id transformation.
//!
//! Canonical model ids are gateway-internal; each provider wants its own
//! namespace on the wire. The transformer is a pure function over an exact
//! per-provider mapping table (fed from the catalog) plus prefix/suffix
//! rewrite rules, falling back to the canonical id unchanged.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

/// Normalize provider aliases used in request hints.
#[must_use]
pub fn normalize_provider_alias(provider: &str) -> String {
    let lower = provider.trim().to_ascii_lowercase();
    match lower.as_str() {
        "hug" | "hf" => "huggingface".to_string(),
        _ => lower,
    }
}

static DETECT_RULES: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        // OpenRouter's variant-suffixed catalog names
        (r":(free|nitro|extended)$", "openrouter"),
        // Fireworks account-scoped ids
        (r"^accounts/fireworks/", "fireworks"),
        (r"^huggingface/", "huggingface"),
        (r"^together/", "together"),
        (r"^(xai/|grok-)", "xai"),
        (r"^(google-vertex/|gemini-)", "google-vertex"),
    ]
    .into_iter()
    .filter_map(|(pattern, provider)| Regex::new(pattern).ok().map(|re| (re, provider)))
    .collect()
});

/// Detect the provider a canonical model id encodes, when it encodes one.
///
/// Conventions: a `vendor/` prefix or a `:variant` suffix that only one
/// provider understands.
#[must_use]
pub fn detect_provider_from_model_id(model: &str) -> Option<String> {
    let lower = model.to_ascii_lowercase();
    DETECT_RULES
        .iter()
        .find(|(re, _)| re.is_match(&lower))
        .map(|(_, provider)| (*provider).to_string())
}

/// Regex rewrite rule scoped to one provider
struct RewriteRule {
    provider: String,
    pattern: Regex,
    replacement: String,
}

/// Canonical to provider-specific model-id rewriter
pub struct Transformer {
    /// Exact (provider, canonical) -> provider id mappings
    exact: HashMap<(String, String), String>,
    rules: Vec<RewriteRule>,
}

impl Transformer {
    /// Create a transformer with the built-in prefix/suffix rules
    #[must_use]
    pub fn new() -> Self {
        let mut transformer = Self {
            exact: HashMap::new(),
            rules: Vec::new(),
        };

        // OpenRouter understands variant suffixes; nobody else does
        for provider in ["huggingface", "fireworks", "together", "google-vertex", "xai"] {
            transformer.add_rule(provider, r":(free|nitro|extended)$", "");
        }
        // Vertex wants bare Gemini names, not the vendor-prefixed ones
        transformer.add_rule("google-vertex", r"^google/", "");
        // Fireworks namespaces everything under its account prefix
        transformer.add_rule("fireworks", r"^(?P<rest>[^/]+/[^/]+)$", "accounts/fireworks/models/$rest");

        transformer
    }

    /// Add an exact mapping, as learned from the catalog
    pub fn add_exact(
        &mut self,
        provider: impl Into<String>,
        canonical: impl Into<String>,
        provider_id: impl Into<String>,
    ) {
        self.exact
            .insert((provider.into(), canonical.into()), provider_id.into());
    }

    /// Add a regex rewrite rule for a provider. Invalid patterns are
    /// dropped; rules come from config and the built-in table, not users.
    pub fn add_rule(&mut self, provider: impl Into<String>, pattern: &str, replacement: &str) {
        if let Ok(regex) = Regex::new(pattern) {
            self.rules.push(RewriteRule {
                provider: provider.into(),
                pattern: regex,
                replacement: replacement.to_string(),
            });
        }
    }

    /// Rewrite a canonical id for a provider. Pure; identity when no rule
    /// matches.
    #[must_use]
    pub fn rewrite(&self, canonical: &str, provider: &str) -> String {
        if let Some(exact) = self
            .exact
            .get(&(provider.to_string(), canonical.to_string()))
        {
            return exact.clone();
        }

        let mut id = canonical.to_string();
        for rule in self.rules.iter().filter(|r| r.provider == provider) {
            id = rule
                .pattern
                .replace(&id, rule.replacement.as_str())
                .into_owned();
        }
        id
    }
}

impl Default for Transformer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_normalization() {
        assert_eq!(normalize_provider_alias("hug"), "huggingface");
        assert_eq!(normalize_provider_alias("HF"), "huggingface");
        assert_eq!(normalize_provider_alias(" OpenRouter "), "openrouter");
    }

    #[test]
    fn detection_from_suffix_and_prefix() {
        assert_eq!(
            detect_provider_from_model_id("google/gemma-2-9b-it:free"),
            Some("openrouter".to_string())
        );
        assert_eq!(
            detect_provider_from_model_id("accounts/fireworks/models/llama-v3"),
            Some("fireworks".to_string())
        );
        assert_eq!(
            detect_provider_from_model_id("gemini-1.5-pro"),
            Some("google-vertex".to_string())
        );
        assert_eq!(detect_provider_from_model_id("gpt-4"), None);
    }

    #[test]
    fn exact_table_wins() {
        let mut transformer = Transformer::new();
        transformer.add_exact("huggingface", "llama-3-70b", "meta-llama/Meta-Llama-3-70B");
        assert_eq!(
            transformer.rewrite("llama-3-70b", "huggingface"),
            "meta-llama/Meta-Llama-3-70B"
        );
    }

    #[test]
    fn free_suffix_stripped_for_direct_providers() {
        let transformer = Transformer::new();
        assert_eq!(
            transformer.rewrite("google/gemma-2-9b-it:free", "huggingface"),
            "google/gemma-2-9b-it"
        );
        // OpenRouter keeps the suffix
        assert_eq!(
            transformer.rewrite("google/gemma-2-9b-it:free", "openrouter"),
            "google/gemma-2-9b-it:free"
        );
    }

    #[test]
    fn vertex_strips_vendor_prefix() {
        let transformer = Transformer::new();
        assert_eq!(
            transformer.rewrite("google/gemini-1.5-flash", "google-vertex"),
            "gemini-1.5-flash"
        );
    }

    #[test]
    fn unmatched_is_identity() {
        let transformer = Transformer::new();
        assert_eq!(transformer.rewrite("gpt-4", "openrouter"), "gpt-4");
        assert_eq!(transformer.rewrite("gpt-4", "unknown-provider"), "gpt-4");
    }

    #[test]
    fn rewrite_is_deterministic() {
        let transformer = Transformer::new();
        let a = transformer.rewrite("meta-llama/llama-3-70b", "fireworks");
        let b = transformer.rewrite("meta-llama/llama-3-70b", "fireworks");
        assert_eq!(a, b);
        assert_eq!(a, "accounts/fireworks/models/meta-llama/llama-3-70b");
    }
}
