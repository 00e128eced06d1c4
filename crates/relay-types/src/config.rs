//! Configuration types for the relay dispatch core.
//!
//! `RelayConfig` is the top-level `relay.toml` document: a list of provider
//! entries plus tuning sections for dispatch, balancing, health scoring and
//! rate limiting. Every section except `providers` has sensible defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub balancer: BalancerSettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl RelayConfig {
    pub fn with_providers(providers: Vec<ProviderConfig>) -> Self {
        Self {
            dispatch: DispatchSettings::default(),
            balancer: BalancerSettings::default(),
            health: HealthSettings::default(),
            rate_limit: RateLimitSettings::default(),
            providers,
        }
    }
}

/// Failover loop limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Wall-clock ceiling across all attempts of one request.
    #[serde(default = "default_total_timeout_ms")]
    pub total_timeout_ms: u64,
    /// Optional ceiling for a single attempt; a breach counts as a provider timeout.
    #[serde(default)]
    pub attempt_timeout_ms: Option<u64>,
    /// Optional cap on started attempts per request.
    #[serde(default)]
    pub max_attempts: Option<usize>,
    /// Upper bound accepted for `max_tokens` during request validation.
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

fn default_total_timeout_ms() -> u64 {
    30_000
}

fn default_max_output_tokens() -> u32 {
    8_192
}

impl DispatchSettings {
    pub fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.total_timeout_ms)
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            total_timeout_ms: default_total_timeout_ms(),
            attempt_timeout_ms: None,
            max_attempts: None,
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

/// Candidate ranking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerSettings {
    /// Step health scores are rounded to before ranking; equal steps tie.
    #[serde(default = "default_score_tolerance")]
    pub score_tolerance: f64,
}

fn default_score_tolerance() -> f64 {
    0.05
}

impl Default for BalancerSettings {
    fn default() -> Self {
        Self {
            score_tolerance: default_score_tolerance(),
        }
    }
}

/// Health scoring settings shared by all providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    /// EWMA smoothing factor in (0, 1]; higher reacts faster.
    #[serde(default = "default_ewma_alpha")]
    pub ewma_alpha: f64,
    /// Latency at which the score's latency factor halves.
    #[serde(default = "default_latency_reference_ms")]
    pub latency_reference_ms: u64,
}

fn default_ewma_alpha() -> f64 {
    0.3
}

fn default_latency_reference_ms() -> u64 {
    1_000
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            ewma_alpha: default_ewma_alpha(),
            latency_reference_ms: default_latency_reference_ms(),
        }
    }
}

/// How a committed reservation's token estimate is reconciled with actual usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStrategy {
    /// Replace the estimate with the reported usage.
    #[default]
    Actual,
    /// Charge whichever of estimate and actual is larger.
    Conservative,
    /// Keep the estimate and ignore reported usage.
    Estimate,
}

/// Rate-limit window settings shared by all providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Length of the short (per-minute) budget window; at most one day.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default)]
    pub reconciliation: ReconciliationStrategy,
}

fn default_window_secs() -> u64 {
    60
}

impl RateLimitSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            reconciliation: ReconciliationStrategy::default(),
        }
    }
}

/// A model served by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub id: String,
    pub context_window: u32,
}

impl ModelSpec {
    pub fn new(id: impl Into<String>, context_window: u32) -> Self {
        Self {
            id: id.into(),
            context_window,
        }
    }
}

/// Sampling parameters a provider accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSupport {
    #[serde(default = "yes")]
    pub temperature: bool,
    #[serde(default = "yes")]
    pub top_p: bool,
    #[serde(default)]
    pub top_k: bool,
    #[serde(default = "yes")]
    pub stop_sequences: bool,
}

fn yes() -> bool {
    true
}

impl Default for ParameterSupport {
    fn default() -> Self {
        Self {
            temperature: true,
            top_p: true,
            top_k: false,
            stop_sequences: true,
        }
    }
}

/// Circuit-breaker thresholds for one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_initial_cooldown_ms")]
    pub initial_cooldown_ms: u64,
    #[serde(default = "default_max_cooldown_ms")]
    pub max_cooldown_ms: u64,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_initial_cooldown_ms() -> u64 {
    30_000
}

fn default_max_cooldown_ms() -> u64 {
    300_000
}

impl CircuitBreakerSettings {
    pub fn initial_cooldown(&self) -> Duration {
        Duration::from_millis(self.initial_cooldown_ms)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_millis(self.max_cooldown_ms)
    }
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            initial_cooldown_ms: default_initial_cooldown_ms(),
            max_cooldown_ms: default_max_cooldown_ms(),
        }
    }
}

/// Configuration for a single upstream provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Stable identity (e.g., "groq", "cerebras").
    pub key: String,
    /// Human-readable name; defaults to the key.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Supported models in preference order; the first is the default.
    pub models: Vec<ModelSpec>,
    pub requests_per_minute: u32,
    pub tokens_per_minute: u64,
    #[serde(default)]
    pub requests_per_hour: Option<u32>,
    #[serde(default)]
    pub tokens_per_hour: Option<u64>,
    #[serde(default)]
    pub requests_per_day: Option<u32>,
    #[serde(default)]
    pub tokens_per_day: Option<u64>,
    /// Monthly budgets run over fixed 30-day windows.
    #[serde(default)]
    pub requests_per_month: Option<u32>,
    #[serde(default)]
    pub tokens_per_month: Option<u64>,
    /// Static tie-break weight; higher is preferred.
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "yes")]
    pub enabled: bool,
    #[serde(default)]
    pub parameters: ParameterSupport,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
}

fn default_weight() -> u32 {
    1
}

impl ProviderConfig {
    /// Minimal enabled provider with one model and per-minute budgets.
    pub fn new(
        key: impl Into<String>,
        model: ModelSpec,
        requests_per_minute: u32,
        tokens_per_minute: u64,
    ) -> Self {
        Self {
            key: key.into(),
            display_name: None,
            models: vec![model],
            requests_per_minute,
            tokens_per_minute,
            requests_per_hour: None,
            tokens_per_hour: None,
            requests_per_day: None,
            tokens_per_day: None,
            requests_per_month: None,
            tokens_per_month: None,
            weight: default_weight(),
            enabled: true,
            parameters: ParameterSupport::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_config_defaults_from_empty_document() {
        let config: RelayConfig = toml::from_str("").unwrap();
        assert!(config.providers.is_empty());
        assert_eq!(config.dispatch.total_timeout(), Duration::from_secs(30));
        assert_eq!(config.dispatch.max_output_tokens, 8_192);
        assert_eq!(config.rate_limit.window(), Duration::from_secs(60));
        assert_eq!(
            config.rate_limit.reconciliation,
            ReconciliationStrategy::Actual
        );
        assert!((config.health.ewma_alpha - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn test_provider_config_deserialize_with_defaults() {
        let toml_str = r#"
[[providers]]
key = "groq"
requests_per_minute = 30
tokens_per_minute = 12000
models = [{ id = "llama-3.3-70b-versatile", context_window = 131072 }]
"#;
        let config: RelayConfig = toml::from_str(toml_str).unwrap();
        let provider = &config.providers[0];
        assert_eq!(provider.key, "groq");
        assert_eq!(provider.weight, 1);
        assert!(provider.enabled);
        assert!(provider.parameters.temperature);
        assert!(!provider.parameters.top_k);
        assert_eq!(provider.circuit_breaker.failure_threshold, 3);
        assert_eq!(
            provider.circuit_breaker.initial_cooldown(),
            Duration::from_secs(30)
        );
        assert!(provider.requests_per_day.is_none());
    }

    #[test]
    fn test_full_document_with_overrides() {
        let toml_str = r#"
[dispatch]
total_timeout_ms = 5000
attempt_timeout_ms = 2000
max_attempts = 2

[balancer]
score_tolerance = 0.1

[rate_limit]
window_secs = 10
reconciliation = "conservative"

[[providers]]
key = "gemini"
display_name = "Google Gemini"
requests_per_minute = 15
tokens_per_minute = 1000000
requests_per_day = 1500
tokens_per_month = 50000000
weight = 3
models = [
    { id = "gemini-2.0-flash", context_window = 1000000 },
    { id = "gemini-1.5-flash", context_window = 1000000 },
]

[providers.parameters]
top_k = true

[providers.circuit_breaker]
failure_threshold = 5
max_cooldown_ms = 60000
"#;
        let config: RelayConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.dispatch.attempt_timeout(), Some(Duration::from_secs(2)));
        assert_eq!(config.dispatch.max_attempts, Some(2));
        assert_eq!(
            config.rate_limit.reconciliation,
            ReconciliationStrategy::Conservative
        );
        let provider = &config.providers[0];
        assert_eq!(provider.display_name.as_deref(), Some("Google Gemini"));
        assert_eq!(provider.models.len(), 2);
        assert_eq!(provider.requests_per_day, Some(1500));
        assert_eq!(provider.tokens_per_month, Some(50_000_000));
        assert!(provider.requests_per_hour.is_none());
        assert!(provider.parameters.top_k);
        assert!(provider.parameters.temperature);
        assert_eq!(provider.circuit_breaker.failure_threshold, 5);
        assert_eq!(provider.circuit_breaker.initial_cooldown_ms, 30_000);
    }

    #[test]
    fn test_missing_required_provider_field_fails() {
        let toml_str = r#"
[[providers]]
key = "groq"
models = []
"#;
        assert!(toml::from_str::<RelayConfig>(toml_str).is_err());
    }
}
