//! Attempt outcomes and the failover policy.
//!
//! `classify` is a pure function: it decides what the dispatcher does next
//! from an outcome alone, so the policy is testable without a transport.

use std::time::Duration;

use relay_types::error::{OutcomeKind, TransportError, TransportErrorKind};
use relay_types::llm::Usage;

/// Result of one attempt against one provider.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Success { usage: Usage },
    /// Provider signalled throttling.
    RateLimited { retry_after: Option<Duration> },
    /// Network error or retriable 5xx.
    TransientFailure { message: String },
    /// 4xx other than rate limiting, or a failure the provider marked non-retriable.
    PermanentFailure { message: String },
    Timeout,
}

impl DispatchOutcome {
    pub fn from_transport_error(err: &TransportError) -> Self {
        match err.kind {
            TransportErrorKind::RateLimited => DispatchOutcome::RateLimited {
                retry_after: err.retry_after,
            },
            TransportErrorKind::Timeout => DispatchOutcome::Timeout,
            TransportErrorKind::ClientError => DispatchOutcome::PermanentFailure {
                message: err.message.clone(),
            },
            TransportErrorKind::Network | TransportErrorKind::ServerError if err.retriable => {
                DispatchOutcome::TransientFailure {
                    message: err.to_string(),
                }
            }
            TransportErrorKind::Network | TransportErrorKind::ServerError => {
                DispatchOutcome::PermanentFailure {
                    message: err.to_string(),
                }
            }
        }
    }

    pub fn kind(&self) -> OutcomeKind {
        match self {
            DispatchOutcome::Success { .. } => OutcomeKind::Success,
            DispatchOutcome::RateLimited { .. } => OutcomeKind::RateLimited,
            DispatchOutcome::TransientFailure { .. } => OutcomeKind::TransientFailure,
            DispatchOutcome::PermanentFailure { .. } => OutcomeKind::PermanentFailure,
            DispatchOutcome::Timeout => OutcomeKind::Timeout,
        }
    }

    /// Tokens the provider reports as consumed; failures consume none.
    pub fn tokens_used(&self) -> u64 {
        match self {
            DispatchOutcome::Success { usage } => u64::from(usage.total()),
            _ => 0,
        }
    }

    pub fn detail(&self) -> Option<String> {
        match self {
            DispatchOutcome::Success { .. } | DispatchOutcome::Timeout => None,
            DispatchOutcome::RateLimited { retry_after } => {
                retry_after.map(|d| format!("retry after {}ms", d.as_millis()))
            }
            DispatchOutcome::TransientFailure { message }
            | DispatchOutcome::PermanentFailure { message } => Some(message.clone()),
        }
    }
}

/// What the dispatcher does after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Hand the response to the caller.
    Return,
    /// Try the next candidate.
    Failover,
    /// Surface the error now; another provider cannot fix the request.
    Surface,
}

pub fn classify(outcome: &DispatchOutcome) -> Step {
    match outcome {
        DispatchOutcome::Success { .. } => Step::Return,
        DispatchOutcome::RateLimited { .. }
        | DispatchOutcome::TransientFailure { .. }
        | DispatchOutcome::Timeout => Step::Failover,
        DispatchOutcome::PermanentFailure { .. } => Step::Surface,
    }
}
