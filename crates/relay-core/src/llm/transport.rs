//! Transport trait definition.
//!
//! The transport is the external collaborator that translates a normalized
//! request into a provider's wire format, performs the call, and maps the
//! reply (or failure) back. Uses RPITIT for `call`; see `BoxTransport` for the
//! object-safe wrapper the dispatcher holds.

use relay_types::error::TransportError;
use relay_types::llm::{CompletionRequest, CompletionResponse};

use super::registry::Provider;

/// Calls a single upstream provider.
///
/// Implementations must classify failures through `TransportError::kind`
/// (rate-limited, timeout, network, client error, server error); the
/// dispatcher decides failover purely from that classification.
///
/// Implementations live outside the core (HTTP clients, test doubles).
pub trait Transport: Send + Sync {
    /// Send the request to `provider` and await the full response.
    ///
    /// `provider.resolve_model(request.model.as_deref())` gives the model
    /// id the call should target.
    fn call(
        &self,
        provider: &Provider,
        request: &CompletionRequest,
    ) -> impl std::future::Future<Output = Result<CompletionResponse, TransportError>> + Send;
}
