//! Shared domain types for the relay dispatch core.
//!
//! Normalized requests and responses, provider configuration, the error
//! taxonomy, and status snapshots. Zero runtime dependencies -- only serde,
//! uuid, thiserror.

pub mod config;
pub mod error;
pub mod llm;
pub mod status;
