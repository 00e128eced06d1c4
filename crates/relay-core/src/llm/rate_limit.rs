//! Per-provider request and token budgets over fixed windows.
//!
//! Every provider has a short window (default 60s) carrying its per-minute
//! budgets, plus an hour, day or 30-day window for each longer period it has
//! budgets for. Windows reset to zero once fully elapsed; there is no gradual
//! decay.
//!
//! Budgets are consumed optimistically: `reserve` checks and increments under
//! the provider's mutex so concurrent requests cannot overshoot, `commit`
//! reconciles the estimate with real usage, and `release` rolls back a
//! reservation whose call never happened.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use relay_types::config::{RateLimitSettings, ReconciliationStrategy};
use relay_types::error::OutcomeKind;
use relay_types::status::{RateLimitStatus, WindowStatus};

use super::registry::ProviderRegistry;

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const MONTH: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Stand-in offset for waits too long to represent as an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `base + wait`, clamped to a far-future instant instead of overflowing.
pub(crate) fn instant_after(base: Instant, wait: Duration) -> Instant {
    base.checked_add(wait)
        .or_else(|| base.checked_add(FAR_FUTURE))
        .unwrap_or(base)
}

/// Provisional budget claim taken before a provider call.
///
/// Settling a reservation twice (commit then release, or release twice) is a
/// no-op, so handles may be cloned freely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    provider: String,
    id: u64,
    estimated_tokens: u64,
}

impl Reservation {
    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn estimated_tokens(&self) -> u64 {
        self.estimated_tokens
    }
}

#[derive(Debug)]
struct BudgetWindow {
    length: Duration,
    request_limit: Option<u32>,
    token_limit: Option<u64>,
    started_at: Instant,
    requests: u32,
    tokens: u64,
    /// Outstanding reservation id -> tokens reserved in this window.
    pending: HashMap<u64, u64>,
}

impl BudgetWindow {
    fn new(
        length: Duration,
        request_limit: Option<u32>,
        token_limit: Option<u64>,
        now: Instant,
    ) -> Self {
        Self {
            length,
            request_limit,
            token_limit,
            started_at: now,
            requests: 0,
            tokens: 0,
            pending: HashMap::new(),
        }
    }

    /// Hard reset once the window has fully elapsed. Reservations taken in the
    /// old window are forgotten; settling them later does nothing.
    fn roll(&mut self, now: Instant) {
        if now.saturating_duration_since(self.started_at) >= self.length {
            self.started_at = now;
            self.requests = 0;
            self.tokens = 0;
            self.pending.clear();
        }
    }

    fn admits(&self, tokens: u64) -> bool {
        let requests_ok = self.request_limit.is_none_or(|limit| self.requests < limit);
        let tokens_ok = self
            .token_limit
            .is_none_or(|limit| self.tokens < limit && self.tokens.saturating_add(tokens) <= limit);
        requests_ok && tokens_ok
    }

    fn resets_at(&self) -> Instant {
        instant_after(self.started_at, self.length)
    }

    fn to_status(&self, now: Instant) -> WindowStatus {
        WindowStatus {
            window_secs: self.length.as_secs(),
            requests: self.requests,
            request_limit: self.request_limit,
            tokens: self.tokens,
            token_limit: self.token_limit,
            in_flight: self.pending.len(),
            resets_in_ms: self.resets_at().saturating_duration_since(now).as_millis() as u64,
        }
    }
}

#[derive(Debug)]
struct ProviderLimits {
    /// Short window first, then hour, day and month windows if configured.
    windows: Vec<BudgetWindow>,
    /// Provider-signalled throttle.
    throttled_until: Option<Instant>,
}

impl ProviderLimits {
    fn refresh(&mut self, now: Instant) {
        for window in &mut self.windows {
            window.roll(now);
        }
        if self.throttled_until.is_some_and(|until| now >= until) {
            self.throttled_until = None;
        }
    }

    fn admits(&self, tokens: u64) -> bool {
        self.throttled_until.is_none() && self.windows.iter().all(|w| w.admits(tokens))
    }
}

fn reconciled_tokens(strategy: ReconciliationStrategy, reserved: u64, actual: u64) -> u64 {
    match strategy {
        ReconciliationStrategy::Actual => actual,
        ReconciliationStrategy::Conservative => reserved.max(actual),
        ReconciliationStrategy::Estimate => reserved,
    }
}

/// Budget accounting for every registered provider.
///
/// One mutex per provider; operations on different providers never contend
/// and no lock is held across an await point.
#[derive(Debug)]
pub struct RateLimiter {
    limits: HashMap<String, Mutex<ProviderLimits>>,
    window: Duration,
    strategy: ReconciliationStrategy,
    next_id: AtomicU64,
}

impl RateLimiter {
    pub fn from_registry(registry: &ProviderRegistry, settings: &RateLimitSettings) -> Self {
        let now = Instant::now();
        let window = settings.window();
        let limits = registry
            .iter()
            .map(|provider| {
                let mut windows = vec![BudgetWindow::new(
                    window,
                    Some(provider.requests_per_minute),
                    Some(provider.tokens_per_minute),
                    now,
                )];
                let periods = [
                    (HOUR, provider.requests_per_hour, provider.tokens_per_hour),
                    (DAY, provider.requests_per_day, provider.tokens_per_day),
                    (MONTH, provider.requests_per_month, provider.tokens_per_month),
                ];
                windows.extend(
                    periods
                        .into_iter()
                        .filter(|(_, requests, tokens)| requests.is_some() || tokens.is_some())
                        .map(|(length, requests, tokens)| {
                            BudgetWindow::new(length, requests, tokens, now)
                        }),
                );
                let limits = ProviderLimits {
                    windows,
                    throttled_until: None,
                };
                (provider.key.clone(), Mutex::new(limits))
            })
            .collect();

        Self {
            limits,
            window,
            strategy: settings.reconciliation,
            next_id: AtomicU64::new(1),
        }
    }

    /// Run `f` on a provider's limits after rolling expired windows.
    fn with_limits<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut ProviderLimits, Instant) -> R,
    ) -> Option<R> {
        let slot = self.limits.get(key)?;
        let mut limits = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        limits.refresh(now);
        Some(f(&mut *limits, now))
    }

    /// Whether the provider is below both its request and token budgets.
    pub fn admit(&self, key: &str) -> bool {
        self.admit_estimate(key, 0)
    }

    /// Whether a request estimated at `tokens` would currently fit.
    pub fn admit_estimate(&self, key: &str, tokens: u64) -> bool {
        self.with_limits(key, |limits, _| limits.admits(tokens))
            .unwrap_or(false)
    }

    /// Atomically admit and claim one request plus `estimated_tokens`.
    ///
    /// Returns `None` when the provider is unknown, throttled, or any window
    /// lacks room.
    pub fn reserve(&self, key: &str, estimated_tokens: u64) -> Option<Reservation> {
        self.with_limits(key, |limits, _| {
            if !limits.admits(estimated_tokens) {
                return None;
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            for window in &mut limits.windows {
                window.requests = window.requests.saturating_add(1);
                window.tokens = window.tokens.saturating_add(estimated_tokens);
                window.pending.insert(id, estimated_tokens);
            }
            Some(Reservation {
                provider: key.to_string(),
                id,
                estimated_tokens,
            })
        })
        .flatten()
    }

    /// Settle a reservation after the call completed.
    ///
    /// The request slot stays consumed. On success the token charge follows
    /// the configured reconciliation strategy; on failure the reservation's
    /// tokens are replaced by `actual_tokens` (normally zero).
    ///
    /// Returns `false` when the reservation was already settled or its
    /// window has rolled over.
    pub fn commit(&self, reservation: &Reservation, actual_tokens: u64, outcome: OutcomeKind) -> bool {
        let strategy = self.strategy;
        self.with_limits(&reservation.provider, |limits, _| {
            let mut settled = false;
            for window in &mut limits.windows {
                let Some(reserved) = window.pending.remove(&reservation.id) else {
                    continue;
                };
                settled = true;
                let charged = if outcome.is_success() {
                    reconciled_tokens(strategy, reserved, actual_tokens)
                } else {
                    actual_tokens
                };
                window.tokens = window.tokens.saturating_sub(reserved).saturating_add(charged);
            }
            if settled && outcome.is_success() && actual_tokens > reservation.estimated_tokens {
                tracing::debug!(
                    provider = %reservation.provider,
                    estimated = reservation.estimated_tokens,
                    actual = actual_tokens,
                    "Token usage exceeded reservation"
                );
            }
            settled
        })
        .unwrap_or(false)
    }

    /// Roll back a reservation whose call never started or was abandoned.
    ///
    /// Returns `false` (and changes nothing) if it was already settled.
    pub fn release(&self, reservation: &Reservation) -> bool {
        self.with_limits(&reservation.provider, |limits, _| {
            let mut released = false;
            for window in &mut limits.windows {
                if let Some(reserved) = window.pending.remove(&reservation.id) {
                    released = true;
                    window.requests = window.requests.saturating_sub(1);
                    window.tokens = window.tokens.saturating_sub(reserved);
                }
            }
            released
        })
        .unwrap_or(false)
    }

    /// Block admission after the provider itself reported throttling.
    ///
    /// Honors `retry_after` up to the short window length; without a hint the
    /// block lasts until the current short window rolls over.
    pub fn throttle(&self, key: &str, retry_after: Option<Duration>) {
        let window = self.window;
        self.with_limits(key, |limits, now| {
            let until = match retry_after {
                Some(wait) => instant_after(now, wait.min(window)),
                None => limits.windows[0].resets_at(),
            };
            let until = limits.throttled_until.map_or(until, |current| current.max(until));
            limits.throttled_until = Some(until);
            tracing::debug!(
                provider = %key,
                wait_ms = until.saturating_duration_since(now).as_millis() as u64,
                "Provider throttled"
            );
        });
    }

    pub fn status(&self, key: &str) -> Option<RateLimitStatus> {
        self.with_limits(key, |limits, now| RateLimitStatus {
            windows: limits.windows.iter().map(|w| w.to_status(now)).collect(),
            throttled_for_ms: limits
                .throttled_until
                .map(|until| until.saturating_duration_since(now).as_millis() as u64),
        })
    }
}
