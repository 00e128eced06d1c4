//! Provider health tracking.
//!
//! Each provider carries an EWMA success ratio, an EWMA latency and a circuit
//! breaker. The breaker opens after consecutive transient failures, waits out
//! an exponentially growing cooldown, then admits exactly one probe.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use relay_types::config::{CircuitBreakerSettings, HealthSettings};
use relay_types::status::HealthStatus;

use super::outcome::DispatchOutcome;
use super::rate_limit::instant_after;
use super::registry::ProviderRegistry;

/// Circuit breaker state for a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Excluded from selection until `until`.
    Open { until: Instant, cooldown: Duration },
    /// Cooldown elapsed: a single probe decides whether to close or reopen.
    HalfOpen {
        probe_in_flight: bool,
        cooldown: Duration,
    },
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen { .. } => "half_open",
        }
    }
}

/// Right to call a provider, obtained from [`HealthTracker::begin_attempt`].
///
/// A permit taken in HalfOpen holds the provider's single probe; hand it back
/// with [`HealthTracker::abandon`] if the call never produces an outcome.
#[derive(Debug, PartialEq, Eq)]
pub struct AttemptPermit {
    provider: String,
    probe: bool,
}

impl AttemptPermit {
    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn is_probe(&self) -> bool {
        self.probe
    }
}

#[derive(Debug)]
struct ProviderHealth {
    breaker: CircuitBreakerSettings,
    state: CircuitState,
    success_ratio: f64,
    latency_ms: Option<f64>,
    consecutive_failures: u32,
    /// Opens since the circuit last closed; drives the cooldown backoff.
    consecutive_opens: u32,
    last_error: Option<String>,
    last_success: Option<Instant>,
    total_calls: u64,
    total_failures: u64,
    uptime_since: Option<chrono::DateTime<chrono::Utc>>,
}

impl ProviderHealth {
    fn new(breaker: CircuitBreakerSettings) -> Self {
        Self {
            breaker,
            state: CircuitState::Closed,
            success_ratio: 1.0,
            latency_ms: None,
            consecutive_failures: 0,
            consecutive_opens: 0,
            last_error: None,
            last_success: None,
            total_calls: 0,
            total_failures: 0,
            uptime_since: Some(chrono::Utc::now()),
        }
    }

    /// Open -> HalfOpen once the cooldown has elapsed.
    fn refresh(&mut self, key: &str, now: Instant) {
        if let CircuitState::Open { until, cooldown } = self.state {
            if now >= until {
                self.state = CircuitState::HalfOpen {
                    probe_in_flight: false,
                    cooldown,
                };
                tracing::info!(provider = %key, "Circuit half-open, awaiting probe");
            }
        }
    }

    fn is_eligible(&self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open { .. } => false,
            CircuitState::HalfOpen {
                probe_in_flight, ..
            } => !probe_in_flight,
        }
    }

    fn backoff(&self) -> Duration {
        let exponent = self.consecutive_opens.saturating_sub(1).min(20);
        self.breaker
            .initial_cooldown()
            .saturating_mul(1u32 << exponent)
            .min(self.breaker.max_cooldown())
    }

    fn open(&mut self, key: &str, now: Instant) {
        self.consecutive_opens = self.consecutive_opens.saturating_add(1);
        let cooldown = self.backoff();
        self.state = CircuitState::Open {
            until: instant_after(now, cooldown),
            cooldown,
        };
        self.uptime_since = None;
        tracing::info!(
            provider = %key,
            cooldown_ms = cooldown.as_millis() as u64,
            consecutive_failures = self.consecutive_failures,
            "Circuit opened"
        );
    }

    fn close(&mut self, key: &str) {
        if self.state != CircuitState::Closed {
            tracing::info!(provider = %key, "Circuit closed");
            self.uptime_since = Some(chrono::Utc::now());
        }
        self.state = CircuitState::Closed;
        self.consecutive_opens = 0;
    }

    fn observe_latency(&mut self, alpha: f64, latency: Duration) {
        let sample = latency.as_secs_f64() * 1_000.0;
        self.latency_ms = Some(match self.latency_ms {
            Some(old) => alpha * sample + (1.0 - alpha) * old,
            None => sample,
        });
    }

    fn observe_success(&mut self, alpha: f64, success: bool) {
        let sample = if success { 1.0 } else { 0.0 };
        self.success_ratio = alpha * sample + (1.0 - alpha) * self.success_ratio;
    }

    fn record(
        &mut self,
        key: &str,
        outcome: &DispatchOutcome,
        latency: Duration,
        alpha: f64,
        now: Instant,
    ) {
        self.total_calls += 1;

        match outcome {
            DispatchOutcome::Success { .. } => {
                self.observe_success(alpha, true);
                self.observe_latency(alpha, latency);
                self.consecutive_failures = 0;
                self.last_success = Some(now);
                // A late success while Open also proves recovery.
                self.close(key);
            }
            DispatchOutcome::PermanentFailure { .. } => {
                self.total_failures += 1;
                self.observe_latency(alpha, latency);
                self.consecutive_failures = 0;
                self.close(key);
            }
            DispatchOutcome::RateLimited { .. } => {
                self.total_failures += 1;
                self.observe_success(alpha, false);
                if matches!(self.state, CircuitState::HalfOpen { .. }) {
                    self.open(key, now);
                }
            }
            DispatchOutcome::TransientFailure { .. } | DispatchOutcome::Timeout => {
                self.total_failures += 1;
                self.observe_success(alpha, false);
                self.observe_latency(alpha, latency);
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                match self.state {
                    CircuitState::Closed
                        if self.consecutive_failures >= self.breaker.failure_threshold =>
                    {
                        self.open(key, now);
                    }
                    CircuitState::HalfOpen { .. } => self.open(key, now),
                    _ => {}
                }
            }
        }

        if !outcome.kind().is_success() {
            self.last_error = Some(
                outcome
                    .detail()
                    .unwrap_or_else(|| outcome.kind().to_string()),
            );
        }
    }

    fn score(&self, latency_reference_ms: f64) -> f64 {
        let latency_factor = match self.latency_ms {
            Some(latency) if latency_reference_ms > 0.0 => 1.0 + latency / latency_reference_ms,
            _ => 1.0,
        };
        self.success_ratio / latency_factor
    }

    fn to_status(&self, latency_reference_ms: f64, now: Instant) -> HealthStatus {
        let last_success_ago = self.last_success.map(|s| {
            let elapsed = now.saturating_duration_since(s).as_secs();
            if elapsed < 60 {
                format!("{elapsed}s ago")
            } else if elapsed < 3600 {
                format!("{}m ago", elapsed / 60)
            } else {
                format!("{}h ago", elapsed / 3600)
            }
        });

        HealthStatus {
            circuit_state: self.state.as_str().to_string(),
            success_ratio: self.success_ratio,
            latency_ms: self.latency_ms.map(|l| l.round() as u64),
            score: self.score(latency_reference_ms),
            consecutive_failures: self.consecutive_failures,
            last_error: self.last_error.clone(),
            last_success_ago,
            total_calls: self.total_calls,
            total_failures: self.total_failures,
            uptime_since: self.uptime_since.map(|t| t.to_rfc3339()),
        }
    }
}

/// Health state for every registered provider, one mutex each.
#[derive(Debug)]
pub struct HealthTracker {
    records: HashMap<String, Mutex<ProviderHealth>>,
    alpha: f64,
    latency_reference_ms: f64,
}

impl HealthTracker {
    pub fn from_registry(registry: &ProviderRegistry, settings: &HealthSettings) -> Self {
        let records = registry
            .iter()
            .map(|p| {
                (
                    p.key.clone(),
                    Mutex::new(ProviderHealth::new(p.circuit_breaker.clone())),
                )
            })
            .collect();
        Self {
            records,
            alpha: settings.ewma_alpha,
            latency_reference_ms: settings.latency_reference_ms as f64,
        }
    }

    fn with_record<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut ProviderHealth, Instant) -> R,
    ) -> Option<R> {
        let slot = self.records.get(key)?;
        let mut record = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        record.refresh(key, now);
        Some(f(&mut *record, now))
    }

    /// Whether the provider may currently be selected.
    ///
    /// Does not claim the HalfOpen probe; see [`HealthTracker::begin_attempt`].
    pub fn is_eligible(&self, key: &str) -> bool {
        self.with_record(key, |record, _| record.is_eligible())
            .unwrap_or(false)
    }

    /// Claim the right to call the provider.
    ///
    /// Returns `None` while the circuit is Open or another caller holds the
    /// HalfOpen probe.
    pub fn begin_attempt(&self, key: &str) -> Option<AttemptPermit> {
        self.with_record(key, |record, _| match record.state {
            CircuitState::Closed => Some(AttemptPermit {
                provider: key.to_string(),
                probe: false,
            }),
            CircuitState::HalfOpen {
                probe_in_flight: false,
                cooldown,
            } => {
                record.state = CircuitState::HalfOpen {
                    probe_in_flight: true,
                    cooldown,
                };
                tracing::debug!(provider = %key, "Probe claimed");
                Some(AttemptPermit {
                    provider: key.to_string(),
                    probe: true,
                })
            }
            _ => None,
        })
        .flatten()
    }

    /// Return a permit whose call produced no outcome.
    pub fn abandon(&self, permit: AttemptPermit) {
        if !permit.probe {
            return;
        }
        self.with_record(&permit.provider, |record, _| {
            if let CircuitState::HalfOpen {
                probe_in_flight: true,
                cooldown,
            } = record.state
            {
                record.state = CircuitState::HalfOpen {
                    probe_in_flight: false,
                    cooldown,
                };
            }
        });
    }

    /// Fold one attempt's outcome into the provider's health.
    pub fn record_outcome(&self, key: &str, outcome: &DispatchOutcome, latency: Duration) {
        let alpha = self.alpha;
        self.with_record(key, |record, now| {
            record.record(key, outcome, latency, alpha, now);
        });
    }

    /// `success_ratio / (1 + latency / latency_reference)`; 0.0 for unknown keys.
    pub fn score(&self, key: &str) -> f64 {
        let reference = self.latency_reference_ms;
        self.with_record(key, |record, _| record.score(reference))
            .unwrap_or(0.0)
    }

    pub fn state(&self, key: &str) -> Option<CircuitState> {
        self.with_record(key, |record, _| record.state.clone())
    }

    pub fn consecutive_failures(&self, key: &str) -> Option<u32> {
        self.with_record(key, |record, _| record.consecutive_failures)
    }

    pub fn status(&self, key: &str) -> Option<HealthStatus> {
        let reference = self.latency_reference_ms;
        self.with_record(key, |record, now| record.to_status(reference, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_types::config::{ModelSpec, ProviderConfig};
    use relay_types::llm::Usage;

    fn tracker_with(breaker: CircuitBreakerSettings) -> HealthTracker {
        let mut config = ProviderConfig::new("p", ModelSpec::new("m", 8_192), 10, 10_000);
        config.circuit_breaker = breaker;
        let registry = ProviderRegistry::from_config(&[config]).unwrap();
        HealthTracker::from_registry(&registry, &HealthSettings::default())
    }

    fn tracker() -> HealthTracker {
        tracker_with(CircuitBreakerSettings {
            failure_threshold: 3,
            initial_cooldown_ms: 10_000,
            max_cooldown_ms: 30_000,
        })
    }

    fn success() -> DispatchOutcome {
        DispatchOutcome::Success {
            usage: Usage::default(),
        }
    }

    fn transient() -> DispatchOutcome {
        DispatchOutcome::TransientFailure {
            message: "502 bad gateway".to_string(),
        }
    }

    fn fail_n(tracker: &HealthTracker, n: usize) {
        for _ in 0..n {
            tracker.record_outcome("p", &transient(), Duration::from_millis(100));
        }
    }

    #[test]
    fn test_new_provider_is_healthy() {
        let tracker = tracker();
        assert!(tracker.is_eligible("p"));
        assert_eq!(tracker.state("p"), Some(CircuitState::Closed));
        assert!((tracker.score("p") - 1.0).abs() < f64::EPSILON);
        assert_eq!(tracker.consecutive_failures("p"), Some(0));
    }

    #[test]
    fn test_unknown_provider_is_never_eligible() {
        let tracker = tracker();
        assert!(!tracker.is_eligible("missing"));
        assert!(tracker.begin_attempt("missing").is_none());
        assert_eq!(tracker.score("missing"), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_after_threshold_failures() {
        let tracker = tracker();
        fail_n(&tracker, 2);
        assert!(tracker.is_eligible("p"));

        fail_n(&tracker, 1);
        assert!(!tracker.is_eligible("p"));
        assert!(tracker.begin_attempt("p").is_none());
        assert!(matches!(
            tracker.state("p"),
            Some(CircuitState::Open { cooldown, .. }) if cooldown == Duration::from_secs(10)
        ));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let tracker = tracker();
        fail_n(&tracker, 2);
        tracker.record_outcome("p", &success(), Duration::from_millis(100));
        assert_eq!(tracker.consecutive_failures("p"), Some(0));
        fail_n(&tracker, 2);
        assert_eq!(tracker.state("p"), Some(CircuitState::Closed));
    }

    #[test]
    fn test_rate_limited_does_not_count_toward_breaker() {
        let tracker = tracker();
        fail_n(&tracker, 2);
        for _ in 0..5 {
            tracker.record_outcome(
                "p",
                &DispatchOutcome::RateLimited { retry_after: None },
                Duration::from_millis(5),
            );
        }
        assert_eq!(tracker.consecutive_failures("p"), Some(2));
        assert_eq!(tracker.state("p"), Some(CircuitState::Closed));
        assert!(tracker.score("p") < 0.2);
    }

    #[test]
    fn test_permanent_failure_keeps_success_ratio() {
        let tracker = tracker();
        fail_n(&tracker, 2);
        let before = tracker.status("p").unwrap().success_ratio;
        tracker.record_outcome(
            "p",
            &DispatchOutcome::PermanentFailure {
                message: "400 bad request".to_string(),
            },
            Duration::from_millis(100),
        );
        let status = tracker.status("p").unwrap();
        assert!((status.success_ratio - before).abs() < f64::EPSILON);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.last_error.as_deref(), Some("400 bad request"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_after_cooldown() {
        let tracker = tracker();
        fail_n(&tracker, 3);

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!tracker.is_eligible("p"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(tracker.is_eligible("p"));
        assert!(tracker.is_eligible("p"), "eligibility check does not claim");

        let probe = tracker.begin_attempt("p").unwrap();
        assert!(probe.is_probe());
        assert!(!tracker.is_eligible("p"));
        assert!(tracker.begin_attempt("p").is_none());

        tracker.record_outcome("p", &success(), Duration::from_millis(50));
        assert_eq!(tracker.state("p"), Some(CircuitState::Closed));
        let permit = tracker.begin_attempt("p").unwrap();
        assert!(!permit.is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_probe_is_returned() {
        let tracker = tracker();
        fail_n(&tracker, 3);
        tokio::time::advance(Duration::from_secs(10)).await;

        let probe = tracker.begin_attempt("p").unwrap();
        assert!(!tracker.is_eligible("p"));
        tracker.abandon(probe);
        assert!(tracker.is_eligible("p"));
        assert!(tracker.begin_attempt("p").unwrap().is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_doubles_cooldown_up_to_max() {
        let tracker = tracker();
        fail_n(&tracker, 3);

        for expected in [20, 30, 30] {
            let Some(CircuitState::Open { cooldown, .. }) = tracker.state("p") else {
                panic!("circuit should be open");
            };
            tokio::time::advance(cooldown).await;
            let _probe = tracker.begin_attempt("p").unwrap();
            tracker.record_outcome("p", &DispatchOutcome::Timeout, Duration::from_secs(1));
            assert!(matches!(
                tracker.state("p"),
                Some(CircuitState::Open { cooldown, .. }) if cooldown == Duration::from_secs(expected)
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_resets_after_close() {
        let tracker = tracker();
        fail_n(&tracker, 3);
        tokio::time::advance(Duration::from_secs(10)).await;
        let _probe = tracker.begin_attempt("p").unwrap();
        fail_n(&tracker, 1);
        tokio::time::advance(Duration::from_secs(20)).await;
        let _probe = tracker.begin_attempt("p").unwrap();
        tracker.record_outcome("p", &success(), Duration::from_millis(10));

        fail_n(&tracker, 3);
        assert!(matches!(
            tracker.state("p"),
            Some(CircuitState::Open { cooldown, .. }) if cooldown == Duration::from_secs(10)
        ));
    }

    #[test]
    fn test_score_penalises_latency() {
        let tracker = tracker();
        tracker.record_outcome("p", &success(), Duration::from_millis(1_000));
        // Reference latency 1000ms halves the score.
        assert!((tracker.score("p") - 0.5).abs() < 1e-9);

        tracker.record_outcome("p", &success(), Duration::from_millis(0));
        // EWMA: 0.3 * 0 + 0.7 * 1000 = 700ms.
        assert!((tracker.score("p") - 1.0 / 1.7).abs() < 1e-9);
    }

    #[test]
    fn test_success_ratio_ewma() {
        let tracker = tracker();
        fail_n(&tracker, 1);
        let ratio = tracker.status("p").unwrap().success_ratio;
        assert!((ratio - 0.7).abs() < 1e-9);
        tracker.record_outcome("p", &success(), Duration::ZERO);
        let ratio = tracker.status("p").unwrap().success_ratio;
        assert!((ratio - (0.3 + 0.7 * 0.7)).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_to_status() {
        let tracker = tracker();
        tracker.record_outcome("p", &success(), Duration::from_millis(120));
        tokio::time::advance(Duration::from_secs(125)).await;
        fail_n(&tracker, 3);

        let status = tracker.status("p").unwrap();
        assert_eq!(status.circuit_state, "open");
        assert_eq!(status.total_calls, 4);
        assert_eq!(status.total_failures, 3);
        assert_eq!(status.last_success_ago.as_deref(), Some("2m ago"));
        assert!(status.uptime_since.is_none());
        assert!(status.last_error.unwrap().contains("502"));
    }
}
