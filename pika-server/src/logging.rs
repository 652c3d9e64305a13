//! Process-wide `tracing` subscriber.

use tracing_subscriber::EnvFilter;

/// Installs the compact formatter once for the whole process.
///
/// `RUST_LOG` wins over `default_level`; an unparsable directive falls back to `info`.
/// Later calls are no-ops, so tests may call this freely.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .with_target(false)
        .try_init();
}
