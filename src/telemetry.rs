//! Tracing bootstrap for engine binaries and tests.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber.
///
/// Honors `RUST_LOG`; defaults to `info` for the crate and `warn` for
/// dependencies. Calling this twice is harmless; the second install is
/// ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,recongraph=info"));

    let fmt_layer = fmt::layer().with_target(true).compact();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}
