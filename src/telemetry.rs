//! Telemetry
//!
//! Log output for the engine and the CLI. Everything is written to stderr;
//! stdout belongs to the CLI's JSON results.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber once; later calls are no-ops.
///
/// `RUST_LOG` wins when set. Otherwise `level` applies to this crate and the
/// CLI, and dependencies only report warnings. Debug builds print readable
/// multi-line events, release builds one JSON object per event.
pub fn init_telemetry_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,prism_core={level},prism_cli={level}")));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if cfg!(debug_assertions) {
        registry
            .with(fmt::layer().pretty().with_target(false).with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().json().with_current_span(true).with_writer(std::io::stderr))
            .try_init()
    };
    if installed.is_err() {
        tracing::debug!("telemetry already initialised");
    }
}
