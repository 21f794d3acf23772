//! Subscriber initialization.

use std::sync::Once;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install console logging. The filter comes from `RUST_LOG`, default `info`.
///
/// Only the first call in a process installs anything; a subscriber set up
/// elsewhere is left alone.
///
/// # Example
/// ```
/// use pitchline_telemetry::init_telemetry;
/// init_telemetry("pitchline");
/// ```
pub fn init_telemetry(service_name: &str) {
    INIT.call_once(|| {
        let installed = tracing_subscriber::registry()
            .with(env_filter())
            .with(tracing_subscriber::fmt::layer().with_target(true).with_line_number(true))
            .try_init();

        if installed.is_ok() {
            tracing::info!(service.name = service_name, "Telemetry initialized");
        }
    });
}

/// Install newline-delimited JSON logging, for running the relay under a
/// log collector.
pub fn init_json_telemetry(service_name: &str) {
    INIT.call_once(|| {
        let installed = tracing_subscriber::registry()
            .with(env_filter())
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init();

        if installed.is_ok() {
            tracing::info!(service.name = service_name, format = "json", "Telemetry initialized");
        }
    });
}
