//! Process-wide logging for a binary that embeds the relay.
//!
//! The relay crates only emit `tracing` events and the per-request `dispatch`
//! span; nothing in them installs a subscriber. The embedding binary calls
//! [`init_tracing`] once at startup, before building the dispatcher, and
//! [`shutdown_tracing`] before exit.
//!
//! ```no_run
//! relay_observe::tracing_setup::init_tracing(std::env::var_os("RELAY_OTEL").is_some())?;
//! // ... load relay.toml, build the Dispatcher, serve ...
//! relay_observe::tracing_setup::shutdown_tracing();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Tracer name under which dispatch spans are exported.
pub const TRACER_NAME: &str = "relay";

/// Filter used when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "info";

static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Install the global subscriber: `RUST_LOG` filtering (default `info`), a
/// `fmt` layer that reports each span's duration on close, and, when
/// `enable_otel` is set, a bridge exporting spans to stdout as OTel spans.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(enable_otel: bool) -> Result<(), Box<dyn std::error::Error>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let provider = enable_otel.then(|| {
        SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build()
    });
    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer(TRACER_NAME)));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_span_events(FmtSpan::CLOSE),
        )
        .with(otel_layer)
        .try_init()?;

    if let Some(provider) = provider {
        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);
    }
    Ok(())
}

/// Flush buffered spans. No-op unless OTel export was enabled.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(err) = provider.shutdown() {
            tracing::warn!(error = %err, "OTel tracer provider shutdown failed");
        }
    }
}
