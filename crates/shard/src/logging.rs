//! Logging system setup and configuration
//!
//! This module initializes the tracing subscriber used by every crate of the
//! server. `RUST_LOG` always wins over the configured level, so operators can
//! turn on e.g. `packet_trace=debug` without touching the config file.

use crate::config::LoggingSettings;
use anyhow::{anyhow, Result};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the logging system
///
/// # Arguments
/// * `settings` - Logging section of the configuration, CLI overrides applied
///
/// # Environment Variables
/// * `RUST_LOG` - Override the configured filter (e.g., "debug", "packet_trace=debug")
pub fn setup_logging(settings: &LoggingSettings) -> Result<()> {
    let level = settings.level.as_str();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);

    let installed = if settings.json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(false)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .try_init()
    };
    installed.map_err(|e| anyhow!("Failed to install tracing subscriber: {e}"))?;

    info!("🔧 Logging initialized with level: {}", level);
    Ok(())
}
