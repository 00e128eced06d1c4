//! Provider registry.
//!
//! Validated, immutable catalogue of the configured providers. Built once at
//! startup; every malformed entry is a startup-fatal `ConfigError`.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use relay_types::config::{CircuitBreakerSettings, ModelSpec, ParameterSupport, ProviderConfig};
use relay_types::error::ConfigError;
use relay_types::llm::CompletionRequest;

/// A configured upstream provider. Immutable after load.
#[derive(Debug, Clone)]
pub struct Provider {
    pub key: String,
    pub display_name: String,
    /// Supported models in preference order; never empty.
    pub models: Vec<ModelSpec>,
    pub requests_per_minute: u32,
    pub tokens_per_minute: u64,
    pub requests_per_hour: Option<u32>,
    pub tokens_per_hour: Option<u64>,
    pub requests_per_day: Option<u32>,
    pub tokens_per_day: Option<u64>,
    pub requests_per_month: Option<u32>,
    pub tokens_per_month: Option<u64>,
    pub weight: u32,
    pub parameters: ParameterSupport,
    pub circuit_breaker: CircuitBreakerSettings,
}

impl Provider {
    fn from_config(config: &ProviderConfig) -> Result<Self, ConfigError> {
        let key = config.key.trim();
        if key.is_empty() {
            return Err(ConfigError::MissingField {
                provider: config.display_name.clone().unwrap_or_default(),
                field: "key",
            });
        }
        let invalid = |reason: &str| ConfigError::Invalid {
            provider: key.to_string(),
            reason: reason.to_string(),
        };

        if config.models.is_empty() {
            return Err(ConfigError::MissingField {
                provider: key.to_string(),
                field: "models",
            });
        }
        for model in &config.models {
            if model.id.trim().is_empty() {
                return Err(ConfigError::MissingField {
                    provider: key.to_string(),
                    field: "models.id",
                });
            }
            if model.context_window == 0 {
                return Err(invalid(&format!(
                    "model '{}' has a zero context window",
                    model.id
                )));
            }
        }
        if config.requests_per_minute == 0 {
            return Err(invalid("requests_per_minute must be positive"));
        }
        if config.tokens_per_minute == 0 {
            return Err(invalid("tokens_per_minute must be positive"));
        }
        for (period, requests, tokens) in [
            ("hourly", config.requests_per_hour, config.tokens_per_hour),
            ("daily", config.requests_per_day, config.tokens_per_day),
            ("monthly", config.requests_per_month, config.tokens_per_month),
        ] {
            if requests == Some(0) || tokens == Some(0) {
                return Err(invalid(&format!("{period} budgets must be positive when set")));
            }
        }
        if config.weight == 0 {
            return Err(invalid("weight must be positive"));
        }
        let breaker = &config.circuit_breaker;
        if breaker.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold must be positive"));
        }
        if breaker.initial_cooldown_ms == 0 || breaker.initial_cooldown_ms > breaker.max_cooldown_ms
        {
            return Err(invalid(
                "circuit_breaker cooldowns must satisfy 0 < initial <= max",
            ));
        }

        Ok(Self {
            key: key.to_string(),
            display_name: config
                .display_name
                .clone()
                .unwrap_or_else(|| key.to_string()),
            models: config.models.clone(),
            requests_per_minute: config.requests_per_minute,
            tokens_per_minute: config.tokens_per_minute,
            requests_per_hour: config.requests_per_hour,
            tokens_per_hour: config.tokens_per_hour,
            requests_per_day: config.requests_per_day,
            tokens_per_day: config.tokens_per_day,
            requests_per_month: config.requests_per_month,
            tokens_per_month: config.tokens_per_month,
            weight: config.weight,
            parameters: config.parameters.clone(),
            circuit_breaker: breaker.clone(),
        })
    }

    /// The first configured model.
    pub fn default_model(&self) -> &ModelSpec {
        &self.models[0]
    }

    /// Model to use for a requested id or `family*` pattern.
    ///
    /// `None` resolves to the default model; an unmatched request resolves
    /// to `None`.
    pub fn resolve_model(&self, requested: Option<&str>) -> Option<&ModelSpec> {
        match requested {
            None => Some(self.default_model()),
            Some(pattern) => self.models.iter().find(|m| model_matches(pattern, &m.id)),
        }
    }

    /// Whether this provider can serve a request with the given requirement.
    pub fn satisfies(&self, requirement: &CapabilityRequirement) -> bool {
        let context_ok = match requirement.model.as_deref() {
            None => self
                .models
                .iter()
                .any(|m| m.context_window >= requirement.min_context_tokens),
            Some(pattern) => self.models.iter().any(|m| {
                model_matches(pattern, &m.id) && m.context_window >= requirement.min_context_tokens
            }),
        };
        context_ok && requirement.parameters.supported_by(&self.parameters)
    }
}

/// Match a model id against an exact id or a trailing-`*` family pattern.
pub fn model_matches(pattern: &str, model_id: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => model_id.starts_with(prefix),
        None => pattern == model_id,
    }
}

/// Sampling parameters a request actually uses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequiredParameters {
    pub temperature: bool,
    pub top_p: bool,
    pub top_k: bool,
    pub stop_sequences: bool,
}

impl RequiredParameters {
    fn supported_by(&self, support: &ParameterSupport) -> bool {
        (!self.temperature || support.temperature)
            && (!self.top_p || support.top_p)
            && (!self.top_k || support.top_k)
            && (!self.stop_sequences || support.stop_sequences)
    }
}

/// What a request needs from a provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityRequirement {
    /// Exact model id or `family*` pattern; `None` accepts any model.
    pub model: Option<String>,
    pub min_context_tokens: u32,
    pub parameters: RequiredParameters,
}

impl CapabilityRequirement {
    /// Derive the requirement from a request: its model, prompt estimate plus
    /// completion allowance, and whichever sampling parameters are set.
    pub fn from_request(request: &CompletionRequest) -> Self {
        Self {
            model: request.model.clone(),
            min_context_tokens: request
                .estimated_input_tokens()
                .saturating_add(request.max_tokens),
            parameters: RequiredParameters {
                temperature: request.temperature.is_some(),
                top_p: request.top_p.is_some(),
                top_k: request.top_k.is_some(),
                stop_sequences: request
                    .stop_sequences
                    .as_ref()
                    .is_some_and(|s| !s.is_empty()),
            },
        }
    }
}

/// Registry of enabled providers in configuration order, indexed by key.
#[derive(Debug)]
pub struct ProviderRegistry {
    providers: Vec<Arc<Provider>>,
    index: HashMap<String, usize>,
}

impl ProviderRegistry {
    /// Validate and load provider entries. Disabled entries are skipped.
    pub fn from_config(configs: &[ProviderConfig]) -> Result<Self, ConfigError> {
        let mut providers = Vec::new();
        let mut index = HashMap::new();

        for config in configs.iter().filter(|c| c.enabled) {
            let provider = Provider::from_config(config)?;
            if index.contains_key(&provider.key) {
                return Err(ConfigError::DuplicateKey(provider.key));
            }
            index.insert(provider.key.clone(), providers.len());
            providers.push(Arc::new(provider));
        }

        if providers.is_empty() {
            return Err(ConfigError::NoProviders);
        }

        tracing::info!(providers = providers.len(), "Provider registry loaded");
        Ok(Self { providers, index })
    }

    /// Providers able to serve the requirement, in configuration order.
    pub fn list_candidates(&self, requirement: &CapabilityRequirement) -> Vec<Arc<Provider>> {
        self.providers
            .iter()
            .filter(|p| p.satisfies(requirement))
            .cloned()
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<&Arc<Provider>> {
        self.index.get(key).map(|&i| &self.providers[i])
    }

    /// Configuration-order position of a provider.
    pub fn position(&self, key: &str) -> Option<usize> {
        self.index.get(key).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Provider>> {
        self.providers.iter()
    }

    pub fn keys(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.key.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Every model id served by at least one provider, sorted.
    pub fn supported_models(&self) -> Vec<String> {
        self.providers
            .iter()
            .flat_map(|p| p.models.iter().map(|m| m.id.clone()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Keys of providers serving an exact model id or `family*` pattern.
    pub fn providers_for_model(&self, model: &str) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.providers
            .iter()
            .filter(|p| p.models.iter().any(|m| model_matches(model, &m.id)))
            .filter(|p| seen.insert(p.key.as_str()))
            .map(|p| p.key.as_str())
            .collect()
    }
}
