//! Failover dispatcher.
//!
//! Walks the ranked candidate list for one request: reserve budget, claim a
//! health permit, call the transport under the attempt and total deadlines,
//! then settle the reservation and fold the outcome into health before
//! deciding (via [`classify`]) whether to return, fail over, or surface.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use relay_types::config::{DispatchSettings, RelayConfig};
use relay_types::error::{AttemptRecord, ConfigError, DispatchError, OutcomeKind, TransportError};
use relay_types::llm::{CompletionRequest, CompletionResponse, RequestId};
use relay_types::status::ProviderStatusInfo;

use super::balancer::{CandidateList, LoadBalancer};
use super::box_transport::BoxTransport;
use super::health::{AttemptPermit, HealthTracker};
use super::outcome::{DispatchOutcome, Step, classify};
use super::rate_limit::{RateLimiter, Reservation, instant_after};
use super::registry::ProviderRegistry;

/// Result of a successful dispatch.
#[derive(Debug)]
pub struct DispatchResult {
    pub request_id: RequestId,
    pub response: CompletionResponse,
    /// Key of the provider that served the request.
    pub provider: String,
    /// Every attempt made, the successful one last.
    pub attempts: Vec<AttemptRecord>,
    /// Set when a provider other than the top-ranked candidate answered.
    pub failover_warning: Option<String>,
}

/// How an in-flight transport call ended.
enum AttemptEnd {
    Finished(Result<CompletionResponse, TransportError>),
    DeadlineExceeded,
    Cancelled,
}

/// Reservation and permit held while a call is in flight.
///
/// Dropping it unsettled (cancellation, deadline, or a dropped dispatch
/// future) releases the reservation and hands back a probe.
struct InFlight<'a> {
    limiter: &'a RateLimiter,
    health: &'a HealthTracker,
    held: Option<(Reservation, AttemptPermit)>,
}

impl<'a> InFlight<'a> {
    fn new(
        limiter: &'a RateLimiter,
        health: &'a HealthTracker,
        reservation: Reservation,
        permit: AttemptPermit,
    ) -> Self {
        Self {
            limiter,
            health,
            held: Some((reservation, permit)),
        }
    }

    /// Disarm the guard once the call produced an outcome.
    fn settle(mut self) -> Option<Reservation> {
        self.held.take().map(|(reservation, _permit)| reservation)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some((reservation, permit)) = self.held.take() {
            self.limiter.release(&reservation);
            self.health.abandon(permit);
            tracing::debug!(provider = %reservation.provider(), "Released abandoned attempt");
        }
    }
}

/// Routes completion requests across providers with failover.
///
/// `Send + Sync`; share one instance behind an `Arc`.
#[derive(Debug)]
pub struct Dispatcher {
    registry: Arc<ProviderRegistry>,
    limiter: Arc<RateLimiter>,
    health: Arc<HealthTracker>,
    balancer: LoadBalancer,
    transport: BoxTransport,
    settings: DispatchSettings,
}

impl Dispatcher {
    /// Validate the configuration and wire up every component.
    pub fn from_config(config: RelayConfig, transport: BoxTransport) -> Result<Self, ConfigError> {
        validate_settings(&config)?;

        let registry = Arc::new(ProviderRegistry::from_config(&config.providers)?);
        let limiter = Arc::new(RateLimiter::from_registry(&registry, &config.rate_limit));
        let health = Arc::new(HealthTracker::from_registry(&registry, &config.health));
        let balancer = LoadBalancer::new(
            Arc::clone(&registry),
            Arc::clone(&limiter),
            Arc::clone(&health),
            config.balancer.score_tolerance,
        );

        Ok(Self {
            registry,
            limiter,
            health,
            balancer,
            transport,
            settings: config.dispatch,
        })
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    /// Health and budget snapshot of every provider, in config order.
    pub fn status(&self) -> Vec<ProviderStatusInfo> {
        self.registry
            .iter()
            .filter_map(|provider| {
                Some(ProviderStatusInfo {
                    key: provider.key.clone(),
                    display_name: provider.display_name.clone(),
                    health: self.health.status(&provider.key)?,
                    rate_limit: self.limiter.status(&provider.key)?,
                })
            })
            .collect()
    }

    pub async fn dispatch(
        &self,
        request: &CompletionRequest,
    ) -> Result<DispatchResult, DispatchError> {
        self.dispatch_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Dispatch, giving up as soon as `cancel` fires.
    ///
    /// Cancellation releases the in-flight reservation and records no health
    /// outcome; no further candidates are tried.
    pub async fn dispatch_with_cancel(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<DispatchResult, DispatchError> {
        let request_id = RequestId::new();
        let span = tracing::info_span!("dispatch", %request_id);
        self.run(request, cancel, request_id).instrument(span).await
    }

    async fn run(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
        request_id: RequestId,
    ) -> Result<DispatchResult, DispatchError> {
        validate_request(request, self.settings.max_output_tokens)?;

        let started = Instant::now();
        let deadline = instant_after(started, self.settings.total_timeout());

        let candidates = self.balancer.select(request);
        if candidates.is_empty() {
            tracing::warn!("No eligible provider for request");
            return Err(DispatchError::NoEligibleProvider);
        }
        tracing::debug!(candidates = ?candidates.keys(), "Candidates ranked");

        let estimate = u64::from(request.estimated_total_tokens());
        let mut attempts: Vec<AttemptRecord> = Vec::new();

        for key in candidates.iter() {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled { attempts });
            }
            if Instant::now() >= deadline {
                return Err(timed_out(started, attempts));
            }
            if self
                .settings
                .max_attempts
                .is_some_and(|max| attempts.len() >= max)
            {
                tracing::debug!(attempts = attempts.len(), "Attempt limit reached");
                break;
            }

            let Some(provider) = self.registry.get(key) else {
                continue;
            };
            let Some(reservation) = self.limiter.reserve(key, estimate) else {
                tracing::debug!(provider = %key, "Budget taken since selection, skipping");
                continue;
            };
            let Some(permit) = self.health.begin_attempt(key) else {
                self.limiter.release(&reservation);
                tracing::debug!(provider = %key, "Circuit closed to new calls since selection, skipping");
                continue;
            };
            let guard = InFlight::new(&self.limiter, &self.health, reservation, permit);
            self.balancer.note_attempt(key);

            let attempt_deadline = match self.settings.attempt_timeout() {
                Some(limit) => deadline.min(instant_after(Instant::now(), limit)),
                None => deadline,
            };
            let call_started = Instant::now();

            let end = tokio::select! {
                biased;
                _ = cancel.cancelled() => AttemptEnd::Cancelled,
                result = tokio::time::timeout_at(
                    attempt_deadline,
                    self.transport.call(provider, request),
                ) => match result {
                    Ok(reply) => AttemptEnd::Finished(reply),
                    Err(_) if attempt_deadline < deadline => {
                        AttemptEnd::Finished(Err(TransportError::timeout()))
                    }
                    Err(_) => AttemptEnd::DeadlineExceeded,
                },
            };
            let latency = call_started.elapsed();

            let reply = match end {
                AttemptEnd::Finished(reply) => reply,
                AttemptEnd::Cancelled => {
                    drop(guard);
                    tracing::info!(provider = %key, "Dispatch cancelled mid-attempt");
                    return Err(DispatchError::Cancelled { attempts });
                }
                AttemptEnd::DeadlineExceeded => {
                    drop(guard);
                    attempts.push(AttemptRecord {
                        provider: key.to_string(),
                        outcome: OutcomeKind::Timeout,
                        latency_ms: millis(latency),
                        detail: Some("aborted at dispatch deadline".to_string()),
                    });
                    tracing::error!(provider = %key, "Dispatch deadline reached mid-attempt");
                    return Err(timed_out(started, attempts));
                }
            };

            let outcome = match &reply {
                Ok(response) => DispatchOutcome::Success {
                    usage: response.usage,
                },
                Err(err) => DispatchOutcome::from_transport_error(err),
            };

            if let Some(reservation) = guard.settle() {
                self.limiter
                    .commit(&reservation, outcome.tokens_used(), outcome.kind());
            }
            self.health.record_outcome(key, &outcome, latency);
            if let DispatchOutcome::RateLimited { retry_after } = outcome {
                self.limiter.throttle(key, retry_after);
            }
            attempts.push(AttemptRecord {
                provider: key.to_string(),
                outcome: outcome.kind(),
                latency_ms: millis(latency),
                detail: outcome.detail(),
            });

            match (classify(&outcome), reply) {
                (Step::Return, Ok(response)) => {
                    let failover_warning = self.failover_warning(&candidates, key, request);
                    if let Some(ref warning) = failover_warning {
                        tracing::warn!(%warning, "Failover occurred");
                    }
                    tracing::debug!(
                        provider = %key,
                        latency_ms = millis(latency),
                        tokens = outcome.tokens_used(),
                        "Dispatch succeeded"
                    );
                    return Ok(DispatchResult {
                        request_id,
                        response,
                        provider: key.to_string(),
                        attempts,
                        failover_warning,
                    });
                }
                (Step::Surface, _) => {
                    let message = outcome
                        .detail()
                        .unwrap_or_else(|| outcome.kind().to_string());
                    tracing::error!(
                        provider = %key,
                        error = %message,
                        "Non-failover error, returning immediately"
                    );
                    return Err(DispatchError::ClientError {
                        provider: Some(key.to_string()),
                        message,
                    });
                }
                _ => {
                    tracing::warn!(
                        provider = %key,
                        outcome = %outcome.kind(),
                        latency_ms = millis(latency),
                        "Provider failed, trying next candidate"
                    );
                }
            }
        }

        if attempts.is_empty() {
            tracing::warn!("Every candidate was taken before an attempt could start");
            return Err(DispatchError::NoEligibleProvider);
        }
        tracing::error!(attempts = attempts.len(), "All providers exhausted");
        Err(DispatchError::AllProvidersExhausted { attempts })
    }

    /// Warning when `used` is not the top-ranked candidate.
    fn failover_warning(
        &self,
        candidates: &CandidateList,
        used: &str,
        request: &CompletionRequest,
    ) -> Option<String> {
        let primary = candidates.first()?;
        if primary == used {
            return None;
        }

        let mut parts = vec![format!("Switched to {used}")];

        let context = |key: &str| {
            self.registry
                .get(key)
                .and_then(|p| p.resolve_model(request.model.as_deref()))
                .map(|m| m.context_window)
        };
        if let (Some(primary_ctx), Some(used_ctx)) = (context(primary), context(used)) {
            if used_ctx < primary_ctx {
                parts.push(
                    "Running on a smaller model -- responses may be less detailed".to_string(),
                );
            }
        }

        Some(parts.join(". "))
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn timed_out(started: Instant, attempts: Vec<AttemptRecord>) -> DispatchError {
    DispatchError::TimeoutExceeded {
        elapsed_ms: millis(started.elapsed()),
        attempts,
    }
}

/// Longest accepted short window; longer periods have their own budgets.
const MAX_WINDOW_SECS: u64 = 24 * 60 * 60;

/// Check the tuning sections; provider entries are validated by the registry.
pub fn validate_settings(config: &RelayConfig) -> Result<(), ConfigError> {
    let invalid = |reason: &str| Err(ConfigError::Settings(reason.to_string()));

    let alpha = config.health.ewma_alpha;
    if !(alpha > 0.0 && alpha <= 1.0) {
        return invalid("health.ewma_alpha must be in (0, 1]");
    }
    if config.health.latency_reference_ms == 0 {
        return invalid("health.latency_reference_ms must be positive");
    }
    let tolerance = config.balancer.score_tolerance;
    if !tolerance.is_finite() || tolerance < 0.0 {
        return invalid("balancer.score_tolerance must be a non-negative number");
    }
    if !(1..=MAX_WINDOW_SECS).contains(&config.rate_limit.window_secs) {
        return invalid("rate_limit.window_secs must be between 1 and 86400");
    }
    let dispatch = &config.dispatch;
    if dispatch.total_timeout_ms == 0 {
        return invalid("dispatch.total_timeout_ms must be positive");
    }
    if dispatch.attempt_timeout_ms == Some(0) {
        return invalid("dispatch.attempt_timeout_ms must be positive when set");
    }
    if dispatch.max_attempts == Some(0) {
        return invalid("dispatch.max_attempts must be positive when set");
    }
    if dispatch.max_output_tokens == 0 {
        return invalid("dispatch.max_output_tokens must be positive");
    }
    Ok(())
}

/// Reject requests no provider could serve.
fn validate_request(request: &CompletionRequest, max_output_tokens: u32) -> Result<(), DispatchError> {
    let reject = |message: String| {
        Err(DispatchError::ClientError {
            provider: None,
            message,
        })
    };

    if request.messages.is_empty() {
        return reject("request has no messages".to_string());
    }
    if request.messages.iter().all(|m| m.content.trim().is_empty()) {
        return reject("request messages are all empty".to_string());
    }
    if request.max_tokens == 0 || request.max_tokens > max_output_tokens {
        return reject(format!(
            "max_tokens must be between 1 and {max_output_tokens}, got {}",
            request.max_tokens
        ));
    }
    if let Some(t) = request.temperature {
        if !(0.0..=2.0).contains(&t) {
            return reject(format!("temperature must be between 0 and 2, got {t}"));
        }
    }
    if let Some(p) = request.top_p {
        if !(0.0..=1.0).contains(&p) {
            return reject(format!("top_p must be between 0 and 1, got {p}"));
        }
    }
    if request.top_k == Some(0) {
        return reject("top_k must be at least 1".to_string());
    }
    Ok(())
}
