// src/logging.rs
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the diagnostic subscriber. Level comes from `RUST_LOG`, falling
/// back to `info`. Call once, before any server is built; tests that want to
/// capture diagnostics install their own subscriber instead.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
