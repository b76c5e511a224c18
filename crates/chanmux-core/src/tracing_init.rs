//! Shared tracing/logging initialization.
//!
//! Binaries install the subscriber once; the library crates only emit
//! through the `tracing` macros. Diagnostics such as dropped bundles end up
//! wherever this subscriber sends them.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogSettings;

/// Initialise the global tracing subscriber for a chanmux binary.
///
/// The demuxer reports every bundle it discards (unregistered identifier,
/// full hold backlog, evicted backlog) as a `warn!` event, so the filter
/// built here must let `chanmux=warn` through for those losses to be seen.
///
/// * `default_filter` -- directives used when `RUST_LOG` is unset or invalid
///   (see [`default_filter`]).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(env_filter);
    if log_json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Build the default filter directive for the given crates at `settings.level`.
pub fn default_filter(crates: &[&str], settings: &LogSettings) -> String {
    crates
        .iter()
        .map(|name| format!("{}={}", name.replace('-', "_"), settings.level))
        .collect::<Vec<_>>()
        .join(",")
}
