//! Structured logging setup for the `pluginctl` binary.
//!
//! Library code only emits `tracing` events; installing a subscriber is the
//! binary's job. The filter comes from `PLUGINCTL_LOG` first, then the
//! `--verbose` flag, then the config file.

use crate::core::config::{ENV_LOG, LoggingConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Pick the filter directive for this run.
pub fn resolve_filter(env_value: Option<String>, verbose: bool, config: &LoggingConfig) -> String {
    if let Some(directive) = env_value.filter(|v| !v.trim().is_empty()) {
        return directive;
    }
    if verbose {
        return "debug".to_string();
    }
    config.level.clone()
}

/// Install the global subscriber on stderr. Safe to call more than once; later
/// calls are no-ops.
pub fn init(verbose: bool, config: &LoggingConfig) {
    let directive = resolve_filter(std::env::var(ENV_LOG).ok(), verbose, config);
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}
