//! Structured logging setup (ambient per SPEC_FULL.md §1.1), mirroring the
//! teacher's `worker::init_worker_tracing` EnvFilter construction.

use tracing_subscriber::EnvFilter;

/// Installs a global tracing subscriber. Respects `RUST_LOG`, defaulting to
/// `info`. Each consume cycle and prediction enters its own span with
/// `queue`/`prediction_id` fields, replacing the Python original's
/// `structlog.contextvars` binding.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
