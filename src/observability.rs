//! Structured logging setup.

use tracing_subscriber::EnvFilter;

use crate::{config::Config, error::Result};

/// Initializes the global tracing subscriber: JSON-formatted spans filtered
/// by the configured log level, falling back to `info` if it doesn't parse.
pub fn init_tracing(config: &Config) -> Result<()> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_new(&config.server.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(environment = %config.server.environment, "tracing initialized");

    Ok(())
}
