// src/observability/mod.rs
//! Logging setup
//!
//! The engine logs through the `tracing` facade; embedding applications may
//! install their own subscriber instead of calling [`init_tracing`].

use crate::utils::config::TraceConfig;
use crate::utils::errors::{EngineError, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install a fmt subscriber honoring `RUST_LOG`, else the configured level.
///
/// Returns `Ok(false)` when a global subscriber was already installed.
pub fn init_tracing(config: &TraceConfig) -> Result<bool> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(config.log_level.to_ascii_lowercase())
            .map_err(|e| EngineError::Config(format!("Invalid log level: {}", e)))?,
    };

    let installed = if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true))
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .try_init()
            .is_ok()
    };

    Ok(installed)
}
