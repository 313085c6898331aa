//! Tracing initialization

use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::error::Result;

/// Initialize the global tracing subscriber
///
/// `LOG_LEVEL` seeds the env filter; `LOG_FORMAT=json` selects JSON lines,
/// anything else the human-readable formatter.
pub fn init_tracing(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if config.server.log_format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        log_level = %config.server.log_level,
        log_format = %config.server.log_format,
        "tracing initialized"
    );
    Ok(())
}
