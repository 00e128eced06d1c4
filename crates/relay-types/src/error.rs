use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Startup-fatal configuration problems. Never raised per request.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no enabled providers configured")]
    NoProviders,

    #[error("provider '{provider}' is missing required field '{field}'")]
    MissingField { provider: String, field: &'static str },

    #[error("provider '{provider}' is invalid: {reason}")]
    Invalid { provider: String, reason: String },

    #[error("provider key '{0}' is configured more than once")]
    DuplicateKey(String),

    #[error("invalid relay settings: {0}")]
    Settings(String),

    #[error("failed to read config file '{path}': {message}")]
    Io { path: String, message: String },

    #[error("failed to parse config: {0}")]
    Parse(String),
}

/// What went wrong inside the transport collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    RateLimited,
    Timeout,
    Network,
    ClientError,
    ServerError,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::RateLimited => write!(f, "rate_limited"),
            TransportErrorKind::Timeout => write!(f, "timeout"),
            TransportErrorKind::Network => write!(f, "network"),
            TransportErrorKind::ClientError => write!(f, "client_error"),
            TransportErrorKind::ServerError => write!(f, "server_error"),
        }
    }
}

/// Error returned by the transport for a single provider call.
#[derive(Debug, Clone, Error)]
#[error("{kind} error: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    /// Whether the provider considers the failure worth retrying elsewhere.
    pub retriable: bool,
    pub message: String,
    /// Throttle hint from the provider (e.g., a `Retry-After` header).
    pub retry_after: Option<Duration>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, retriable: bool, message: impl Into<String>) -> Self {
        Self {
            kind,
            retriable,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self {
            kind: TransportErrorKind::RateLimited,
            retriable: true,
            message: "provider signalled throttling".to_string(),
            retry_after,
        }
    }

    pub fn timeout() -> Self {
        Self::new(TransportErrorKind::Timeout, true, "provider call timed out")
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Network, true, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::ServerError, true, message)
    }

    pub fn client(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::ClientError, false, message)
    }
}

/// Classification of one dispatch attempt, as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    RateLimited,
    TransientFailure,
    PermanentFailure,
    Timeout,
}

impl OutcomeKind {
    pub fn is_success(&self) -> bool {
        matches!(self, OutcomeKind::Success)
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeKind::Success => write!(f, "success"),
            OutcomeKind::RateLimited => write!(f, "rate_limited"),
            OutcomeKind::TransientFailure => write!(f, "transient_failure"),
            OutcomeKind::PermanentFailure => write!(f, "permanent_failure"),
            OutcomeKind::Timeout => write!(f, "timeout"),
        }
    }
}

/// Summary of one attempt against one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub provider: String,
    pub outcome: OutcomeKind,
    pub latency_ms: u64,
    pub detail: Option<String>,
}

impl fmt::Display for AttemptRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} after {}ms", self.provider, self.outcome, self.latency_ms)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}

fn last_attempt(attempts: &[AttemptRecord]) -> String {
    attempts
        .last()
        .map(|a| a.to_string())
        .unwrap_or_else(|| "none".to_string())
}

/// Errors surfaced to callers of `dispatch`.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no eligible provider: every provider is rate-limited, unhealthy, or incapable")]
    NoEligibleProvider,

    #[error("all providers exhausted after {} attempt(s); last: {}", .attempts.len(), last_attempt(.attempts))]
    AllProvidersExhausted { attempts: Vec<AttemptRecord> },

    #[error("dispatch timed out after {elapsed_ms}ms; last: {}", last_attempt(.attempts))]
    TimeoutExceeded {
        elapsed_ms: u64,
        attempts: Vec<AttemptRecord>,
    },

    #[error("client error{}: {message}", .provider.as_ref().map(|p| format!(" from {p}")).unwrap_or_default())]
    ClientError {
        /// `None` when the request was rejected before any provider was tried.
        provider: Option<String>,
        message: String,
    },

    #[error("dispatch cancelled by caller")]
    Cancelled { attempts: Vec<AttemptRecord> },
}

impl DispatchError {
    /// Attempts made before the error, empty when none were started.
    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            DispatchError::AllProvidersExhausted { attempts }
            | DispatchError::TimeoutExceeded { attempts, .. }
            | DispatchError::Cancelled { attempts } => attempts,
            DispatchError::NoEligibleProvider | DispatchError::ClientError { .. } => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(provider: &str, outcome: OutcomeKind) -> AttemptRecord {
        AttemptRecord {
            provider: provider.to_string(),
            outcome,
            latency_ms: 120,
            detail: Some("503".to_string()),
        }
    }

    #[test]
    fn test_exhausted_display_names_last_attempt() {
        let err = DispatchError::AllProvidersExhausted {
            attempts: vec![
                record("groq", OutcomeKind::TransientFailure),
                record("gemini", OutcomeKind::Timeout),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 attempt(s)"), "got: {msg}");
        assert!(msg.contains("gemini timeout after 120ms (503)"), "got: {msg}");
        assert_eq!(err.attempts().len(), 2);
    }

    #[test]
    fn test_client_error_display() {
        let err = DispatchError::ClientError {
            provider: Some("groq".to_string()),
            message: "bad request".to_string(),
        };
        assert_eq!(err.to_string(), "client error from groq: bad request");

        let err = DispatchError::ClientError {
            provider: None,
            message: "max_tokens out of range".to_string(),
        };
        assert_eq!(err.to_string(), "client error: max_tokens out of range");
        assert!(err.attempts().is_empty());
    }

    #[test]
    fn test_timeout_display_without_attempts() {
        let err = DispatchError::TimeoutExceeded {
            elapsed_ms: 5000,
            attempts: Vec::new(),
        };
        assert_eq!(err.to_string(), "dispatch timed out after 5000ms; last: none");
    }

    #[test]
    fn test_transport_error_constructors() {
        let err = TransportError::client("unsupported parameter");
        assert_eq!(err.kind, TransportErrorKind::ClientError);
        assert!(!err.retriable);
        assert_eq!(err.to_string(), "client_error error: unsupported parameter");

        let err = TransportError::rate_limited(Some(Duration::from_secs(2)));
        assert!(err.retriable);
        assert_eq!(err.retry_after, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::MissingField {
            provider: "groq".to_string(),
            field: "models",
        };
        assert_eq!(
            err.to_string(),
            "provider 'groq' is missing required field 'models'"
        );
    }
}
