/*!
 * Logging functionality for DomoFlow.
 *
 * This module provides tracing setup and span helpers for consistent
 * logging across devices, watchers and transports.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_filter("info")
}

/// Initialize the logging system with a specific filter
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "debug", "domoflow=trace")
pub fn init_with_filter(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .map_err(|e| Error::logging(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// Create a new span for a device instance
///
/// # Arguments
///
/// * `sid` - The device sid
pub fn device_span(sid: &str) -> tracing::Span {
    tracing::info_span!("device", sid = %sid)
}

/// Create a new span for an operation
///
/// # Arguments
///
/// * `component` - The component performing the operation
/// * `operation` - The name of the operation
pub fn operation_span(component: &str, operation: &str) -> tracing::Span {
    tracing::info_span!("operation", component = %component, name = %operation)
}
