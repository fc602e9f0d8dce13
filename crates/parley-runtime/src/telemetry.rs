//! Tracing and span-export setup for the dialogue engine.
//!
//! The engine instruments the turn pipeline with `tracing` spans
//! (`handle_turn` is the root; classification, dispatch, and graph writes
//! log inside it). [`init_tracing`] installs the global subscriber once at
//! startup and, when a collector endpoint is configured, ships those spans
//! over OTLP/HTTP.
//!
//! | Variable | Effect |
//! |---|---|
//! | `RUST_LOG` | Log filter, default `info`. |
//! | `PARLEY_LOG_FORMAT=json` | Newline-delimited JSON instead of the compact console format. |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | Collector base URL; absent means no span export. |

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global `tracing` subscriber.
///
/// Keep the returned guard alive in `main`; dropping it flushes and shuts
/// down the span exporter.
pub fn init_tracing(service_name: &str) -> TracerProviderGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = if json_logs() {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().compact().boxed()
    };

    let provider = otlp_provider(service_name);
    let export_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("parley")));

    tracing_subscriber::registry()
        .with(filter)
        .with(export_layer)
        .with(fmt_layer)
        .init();

    TracerProviderGuard(provider)
}

fn json_logs() -> bool {
    std::env::var("PARLEY_LOG_FORMAT").as_deref() == Ok("json")
}

/// Shuts down the OTel [`SdkTracerProvider`] on drop, flushing pending
/// spans. Holds `None` when no collector endpoint was configured.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("[parley] span exporter shutdown failed: {e}");
            }
        }
    }
}

/// OTLP/HTTP span pipeline, present only when
/// `OTEL_EXPORTER_OTLP_ENDPOINT` is set. Exporter construction failures are
/// reported on stderr and leave the process on console logging alone.
fn otlp_provider(service_name: &str) -> Option<SdkTracerProvider> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[parley] OTLP exporter init failed: {e}"))
        .ok()?;

    Some(
        SdkTracerProvider::builder()
            .with_resource(
                Resource::builder()
                    .with_service_name(service_name.to_string())
                    .build(),
            )
            // Simple exporter: no Tokio runtime needed at init time, so the
            // CLI can call this before building its runtime.
            .with_simple_exporter(exporter)
            .build(),
    )
}
