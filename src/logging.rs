//! Tracing subscriber setup.

use crate::config::LoggingConfig;
use crate::error::{CourierError, CourierResult};
use tracing_subscriber::EnvFilter;

/// Install a global `tracing` subscriber built from `config`.
///
/// `RUST_LOG` takes precedence over the configured level when set. Fails if
/// a global subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> CourierResult<()> {
    let level = tracing::Level::from(config.level);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.include_targets);

    let result = if config.json_format {
        builder.json().try_init()
    } else {
        builder.with_ansi(config.colored).try_init()
    };

    result.map_err(|e| CourierError::config(format!("failed to install tracing subscriber: {e}")))
}
