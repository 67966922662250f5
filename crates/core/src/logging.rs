//! Structured logging infrastructure for Fleetlink.
//!
//! This module provides centralized logging initialization with support
//! for structured JSON output and environment-based configuration.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Initialize the logging system with structured output.
///
/// Log level can be configured via the `RUST_LOG` environment variable.
/// If not set, defaults to `info` level.
///
/// # Example
/// ```no_run
/// use fleetlink_core::logging;
///
/// logging::init();
/// tracing::info!("Agent started");
/// ```
pub fn init() {
    tracing_subscriber::registry()
        .with(env_filter("info"))
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

/// Initialize the logging system with JSON output for production environments.
///
/// This format is suitable for log aggregation systems and structured log analysis.
/// Log level can be configured via the `RUST_LOG` environment variable.
///
/// # Example
/// ```no_run
/// use fleetlink_core::logging;
///
/// logging::init_json();
/// tracing::info!(device_id = "edge-7", "Registration started");
/// ```
pub fn init_json() {
    tracing_subscriber::registry()
        .with(env_filter("info"))
        .with(fmt::layer().json().with_target(true).with_thread_ids(true))
        .init();
}

/// Initialize logging from the `[logging]` configuration section.
///
/// `RUST_LOG` still wins over the configured level when it is set.
pub fn init_with(config: &LoggingConfig) {
    let filter = env_filter(&config.level);
    let registry = tracing_subscriber::registry().with(filter);

    if config.json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

fn env_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
