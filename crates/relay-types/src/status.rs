//! Point-in-time status snapshots for observability endpoints and logs.

use serde::{Deserialize, Serialize};

/// Health view of one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// One of "closed", "open", "half_open".
    pub circuit_state: String,
    pub success_ratio: f64,
    pub latency_ms: Option<u64>,
    pub score: f64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    /// Human-readable time since last success (e.g., "2m ago").
    pub last_success_ago: Option<String>,
    pub total_calls: u64,
    pub total_failures: u64,
    /// RFC 3339 timestamp of when the provider last became available.
    pub uptime_since: Option<String>,
}

/// Usage of one budget window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowStatus {
    pub window_secs: u64,
    pub requests: u32,
    pub request_limit: Option<u32>,
    pub tokens: u64,
    pub token_limit: Option<u64>,
    /// Reservations issued in this window and not yet committed or released.
    pub in_flight: usize,
    pub resets_in_ms: u64,
}

impl WindowStatus {
    pub fn remaining_requests(&self) -> Option<u32> {
        self.request_limit.map(|l| l.saturating_sub(self.requests))
    }

    pub fn remaining_tokens(&self) -> Option<u64> {
        self.token_limit.map(|l| l.saturating_sub(self.tokens))
    }
}

/// Rate-limit view of one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub windows: Vec<WindowStatus>,
    /// Remaining provider-signalled throttle, if any.
    pub throttled_for_ms: Option<u64>,
}

/// Combined status of one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatusInfo {
    pub key: String,
    pub display_name: String,
    pub health: HealthStatus,
    pub rate_limit: RateLimitStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_remaining_saturates() {
        let window = WindowStatus {
            window_secs: 60,
            requests: 5,
            request_limit: Some(3),
            tokens: 100,
            token_limit: None,
            in_flight: 0,
            resets_in_ms: 1_000,
        };
        assert_eq!(window.remaining_requests(), Some(0));
        assert_eq!(window.remaining_tokens(), None);
    }
}
