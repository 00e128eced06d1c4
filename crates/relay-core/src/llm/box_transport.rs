//! BoxTransport -- object-safe dynamic dispatch wrapper for Transport.
//!
//! 1. Define an object-safe `TransportDyn` trait with boxed futures
//! 2. Blanket-impl `TransportDyn` for all `T: Transport`
//! 3. `BoxTransport` wraps `Box<dyn TransportDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use relay_types::error::TransportError;
use relay_types::llm::{CompletionRequest, CompletionResponse};

use super::registry::Provider;
use super::transport::Transport;

/// Object-safe version of [`Transport`] with a boxed future.
pub trait TransportDyn: Send + Sync {
    fn call_boxed<'a>(
        &'a self,
        provider: &'a Provider,
        request: &'a CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, TransportError>> + Send + 'a>>;
}

impl<T: Transport> TransportDyn for T {
    fn call_boxed<'a>(
        &'a self,
        provider: &'a Provider,
        request: &'a CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, TransportError>> + Send + 'a>> {
        Box::pin(self.call(provider, request))
    }
}

/// Type-erased transport held by the `Dispatcher`.
///
/// Since `Transport` uses RPITIT, it cannot be used as a trait object
/// directly; this wrapper provides the equivalent call.
pub struct BoxTransport {
    inner: Box<dyn TransportDyn + Send + Sync>,
}

impl BoxTransport {
    pub fn new<T: Transport + 'static>(transport: T) -> Self {
        Self {
            inner: Box::new(transport),
        }
    }

    pub async fn call(
        &self,
        provider: &Provider,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, TransportError> {
        self.inner.call_boxed(provider, request).await
    }
}

impl std::fmt::Debug for BoxTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxTransport").finish_non_exhaustive()
    }
}
