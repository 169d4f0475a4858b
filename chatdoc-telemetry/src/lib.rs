//! Logging setup for chatdoc services.
//!
//! Library crates only emit `tracing` events; binaries call one of the
//! `init_*` functions once at startup. The filter comes from `RUST_LOG`
//! and defaults to `info`.
//!
//! [`CaptureLayer`] records events in memory so tests can assert on what
//! was logged.

mod capture;

pub use capture::{CaptureLayer, CapturedEvent, CapturedEvents};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_FILTER: &str = "info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install a human-readable subscriber for `service`.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_telemetry(service: &str) -> bool {
    let installed = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_target(true))
        .try_init();
    if installed.is_ok() {
        tracing::info!(service, "telemetry initialized");
    }
    installed.is_ok()
}

/// Install a JSON-lines subscriber for `service`, for log shipping.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_json_telemetry(service: &str) -> bool {
    let installed = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().json().with_current_span(false))
        .try_init();
    if installed.is_ok() {
        tracing::info!(service, "telemetry initialized");
    }
    installed.is_ok()
}
