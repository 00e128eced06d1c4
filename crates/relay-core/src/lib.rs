//! Request-dispatch engine for the relay.
//!
//! This crate owns the per-provider shared state (rate-limit windows, health
//! records) and the policy that turns a normalized request into an ordered
//! series of provider attempts. It depends only on `relay-types` -- the
//! transport that actually talks to providers is a port implemented elsewhere.

pub mod llm;
