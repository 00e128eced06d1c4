//! Multi-provider routing for chat completions.
//!
//! - `Transport` / `BoxTransport`: the port to the provider-calling collaborator
//! - `ProviderRegistry`: immutable provider catalogue
//! - `RateLimiter`: fixed-window request/token budgets with reservations
//! - `HealthTracker`: EWMA scoring and per-provider circuit breakers
//! - `LoadBalancer`: candidate filtering and ranking
//! - `Dispatcher`: the failover loop

pub mod balancer;
pub mod box_transport;
pub mod dispatch;
pub mod health;
pub mod outcome;
pub mod rate_limit;
pub mod registry;
pub mod transport;
