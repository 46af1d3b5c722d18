//! Logging initialization.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for the engine.
///
/// Reads the filter from the environment (`RUST_LOG`), defaulting to
/// `vessel=info`. Safe to call once per process; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::from_default_env().add_directive(
        "vessel=info"
            .parse()
            .unwrap_or_else(|_| tracing_subscriber::filter::LevelFilter::INFO.into()),
    );

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init();
}
