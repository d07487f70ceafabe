//! Tracing initialization

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Config;
use crate::error::Result;

/// Initialize the tracing subscriber
///
/// `RUST_LOG` wins when set; otherwise the configured service log level
/// applies to the gateway's own crate and `info` to everything else.
pub fn init_tracing(config: &Config) -> Result<()> {
    let default_directive = format!(
        "info,mcp_gateway={}",
        config.service.log_level
    );

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    tracing::debug!("Tracing initialized");
    Ok(())
}
