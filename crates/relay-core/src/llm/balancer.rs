//! Candidate selection.
//!
//! Filters the registry's capable providers down to those with budget and a
//! healthy circuit, then ranks them. Ranking is health score first, then
//! static weight, then how many attempts each provider has already been given,
//! then config order.
//!
//! Scores are rounded to the nearest multiple of `score_tolerance` and tie
//! when they round to the same multiple. Two scores closer than the tolerance
//! can still straddle a half-step and land in adjacent buckets.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use relay_types::llm::CompletionRequest;

use super::health::HealthTracker;
use super::rate_limit::RateLimiter;
use super::registry::{CapabilityRequirement, ProviderRegistry};

/// Ordered provider keys for one request, best first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateList {
    keys: Vec<String>,
}

impl CandidateList {
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }

    pub fn first(&self) -> Option<&str> {
        self.keys.first().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

struct Ranked {
    key: String,
    bucket: f64,
    weight: u32,
    rotation: u64,
    position: usize,
}

impl Ranked {
    fn cmp_rank(&self, other: &Self) -> CmpOrdering {
        other
            .bucket
            .total_cmp(&self.bucket)
            .then_with(|| other.weight.cmp(&self.weight))
            .then_with(|| self.rotation.cmp(&other.rotation))
            .then_with(|| self.position.cmp(&other.position))
    }
}

#[derive(Debug)]
pub struct LoadBalancer {
    registry: Arc<ProviderRegistry>,
    limiter: Arc<RateLimiter>,
    health: Arc<HealthTracker>,
    /// Attempts started per provider; only the dispatcher advances it.
    rotation: HashMap<String, AtomicU64>,
    score_tolerance: f64,
}

impl LoadBalancer {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        limiter: Arc<RateLimiter>,
        health: Arc<HealthTracker>,
        score_tolerance: f64,
    ) -> Self {
        let rotation = registry
            .iter()
            .map(|p| (p.key.clone(), AtomicU64::new(0)))
            .collect();
        Self {
            registry,
            limiter,
            health,
            rotation,
            score_tolerance,
        }
    }

    /// Rank the providers that can currently serve `request`.
    ///
    /// Read-only: repeated calls with no attempts in between return the same
    /// order.
    pub fn select(&self, request: &CompletionRequest) -> CandidateList {
        let requirement = CapabilityRequirement::from_request(request);
        let estimate = u64::from(request.estimated_total_tokens());

        let mut ranked: Vec<Ranked> = self
            .registry
            .list_candidates(&requirement)
            .into_iter()
            .filter(|provider| {
                if !self.limiter.admit_estimate(&provider.key, estimate) {
                    tracing::debug!(provider = %provider.key, estimate, "Over budget, skipping");
                    return false;
                }
                if !self.health.is_eligible(&provider.key) {
                    tracing::debug!(provider = %provider.key, "Circuit not accepting calls, skipping");
                    return false;
                }
                true
            })
            .map(|provider| Ranked {
                bucket: self.bucket(self.health.score(&provider.key)),
                weight: provider.weight,
                rotation: self.rotation(&provider.key),
                position: self.registry.position(&provider.key).unwrap_or(usize::MAX),
                key: provider.key.clone(),
            })
            .collect();

        ranked.sort_by(Ranked::cmp_rank);

        CandidateList {
            keys: ranked.into_iter().map(|r| r.key).collect(),
        }
    }

    /// Nearest multiple of the tolerance, counted in tolerance steps.
    fn bucket(&self, score: f64) -> f64 {
        if self.score_tolerance > 0.0 {
            (score / self.score_tolerance).round()
        } else {
            score
        }
    }

    /// Count an attempt started against `key`.
    pub fn note_attempt(&self, key: &str) {
        if let Some(counter) = self.rotation.get(key) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn rotation(&self, key: &str) -> u64 {
        self.rotation
            .get(key)
            .map_or(0, |counter| counter.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use relay_types::config::{HealthSettings, ModelSpec, ProviderConfig, RateLimitSettings};

    use crate::llm::outcome::DispatchOutcome;

    fn config(key: &str, rpm: u32, tpm: u64) -> ProviderConfig {
        ProviderConfig::new(key, ModelSpec::new("llama-3.3-70b", 128_000), rpm, tpm)
    }

    fn balancer_with(configs: &[ProviderConfig], tolerance: f64) -> LoadBalancer {
        let registry = Arc::new(ProviderRegistry::from_config(configs).unwrap());
        let limiter = Arc::new(RateLimiter::from_registry(
            &registry,
            &RateLimitSettings::default(),
        ));
        let health = Arc::new(HealthTracker::from_registry(
            &registry,
            &HealthSettings::default(),
        ));
        LoadBalancer::new(registry, limiter, health, tolerance)
    }

    fn balancer(keys: &[&str]) -> LoadBalancer {
        let configs: Vec<_> = keys.iter().map(|k| config(k, 30, 100_000)).collect();
        balancer_with(&configs, 0.05)
    }

    fn keys(list: &CandidateList) -> Vec<&str> {
        list.iter().collect()
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new("Summarise this paragraph.", 256)
    }

    #[test]
    fn test_fresh_providers_keep_config_order() {
        let balancer = balancer(&["groq", "cerebras", "gemini"]);
        let list = balancer.select(&request());
        assert_eq!(keys(&list), vec!["groq", "cerebras", "gemini"]);
        assert_eq!(list.first(), Some("groq"));
    }

    #[test]
    fn test_select_is_deterministic() {
        let balancer = balancer(&["groq", "cerebras", "gemini"]);
        balancer.note_attempt("groq");
        let first = balancer.select(&request());
        for _ in 0..10 {
            assert_eq!(balancer.select(&request()), first);
        }
    }

    #[test]
    fn test_rotation_spreads_ties() {
        let balancer = balancer(&["groq", "cerebras", "gemini"]);
        balancer.note_attempt("groq");
        assert_eq!(
            keys(&balancer.select(&request())),
            vec!["cerebras", "gemini", "groq"]
        );
        balancer.note_attempt("cerebras");
        assert_eq!(
            keys(&balancer.select(&request())),
            vec!["gemini", "groq", "cerebras"]
        );
        assert_eq!(balancer.rotation("groq"), 1);
        assert_eq!(balancer.rotation("missing"), 0);
    }

    #[test]
    fn test_weight_beats_rotation() {
        let mut heavy = config("cerebras", 30, 100_000);
        heavy.weight = 5;
        let balancer = balancer_with(&[config("groq", 30, 100_000), heavy], 0.05);
        balancer.note_attempt("cerebras");
        balancer.note_attempt("cerebras");
        assert_eq!(keys(&balancer.select(&request())), vec!["cerebras", "groq"]);
    }

    #[test]
    fn test_health_score_ranks_first() {
        let mut heavy = config("groq", 30, 100_000);
        heavy.weight = 10;
        let balancer = balancer_with(&[heavy, config("gemini", 30, 100_000)], 0.05);
        balancer.health.record_outcome(
            "groq",
            &DispatchOutcome::TransientFailure {
                message: "503".to_string(),
            },
            Duration::from_millis(10),
        );
        assert_eq!(keys(&balancer.select(&request())), vec!["gemini", "groq"]);
    }

    #[test]
    fn test_near_equal_scores_tie() {
        let balancer = balancer(&["groq", "gemini"]);
        // 10ms against a 1000ms reference: score ~0.990, same bucket as 1.0.
        balancer.health.record_outcome(
            "groq",
            &DispatchOutcome::Success {
                usage: Default::default(),
            },
            Duration::from_millis(10),
        );
        balancer.note_attempt("groq");
        assert_eq!(keys(&balancer.select(&request())), vec!["gemini", "groq"]);
    }

    #[test]
    fn test_buckets_split_at_half_steps() {
        let balancer = balancer(&["groq"]);
        assert_eq!(balancer.bucket(1.0), 20.0);
        assert_eq!(balancer.bucket(0.976), balancer.bucket(1.0));
        assert_eq!(balancer.bucket(0.974), 19.0);
        assert_ne!(balancer.bucket(0.974), balancer.bucket(0.976));
    }

    #[test]
    fn test_zero_tolerance_uses_raw_score() {
        let configs = [config("groq", 30, 100_000), config("gemini", 30, 100_000)];
        let balancer = balancer_with(&configs, 0.0);
        balancer.health.record_outcome(
            "groq",
            &DispatchOutcome::Success {
                usage: Default::default(),
            },
            Duration::from_millis(10),
        );
        assert_eq!(keys(&balancer.select(&request())), vec!["gemini", "groq"]);
    }

    #[test]
    fn test_exhausted_budget_is_filtered() {
        let balancer = balancer_with(
            &[config("groq", 1, 100_000), config("gemini", 30, 100_000)],
            0.05,
        );
        let _held = balancer.limiter.reserve("groq", 10).unwrap();
        assert_eq!(keys(&balancer.select(&request())), vec!["gemini"]);
    }

    #[test]
    fn test_token_estimate_is_filtered() {
        let balancer = balancer_with(
            &[config("groq", 30, 200), config("gemini", 30, 100_000)],
            0.05,
        );
        assert_eq!(keys(&balancer.select(&request())), vec!["gemini"]);
    }

    #[test]
    fn test_open_circuit_is_filtered() {
        let balancer = balancer(&["groq", "gemini"]);
        for _ in 0..3 {
            balancer.health.record_outcome(
                "groq",
                &DispatchOutcome::Timeout,
                Duration::from_millis(10),
            );
        }
        assert_eq!(keys(&balancer.select(&request())), vec!["gemini"]);
    }

    #[test]
    fn test_incapable_providers_are_filtered() {
        let balancer = balancer(&["groq"]);
        let mut request = request();
        request.model = Some("gemini-2.0-flash".to_string());
        assert!(balancer.select(&request).is_empty());
    }
}
