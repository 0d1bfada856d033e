/*!
 * Prelude module for DomoFlow Core.
 *
 * This module re-exports commonly used types and functions from the
 * DomoFlow Core crate to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{value_map_from_json, AttrKind, Sid, Value, ValueMap};

// Re-export config types
pub use crate::config::{Config, ConfigBuilder, SharedConfig};

// Re-export utility functions
pub use crate::utils::{spawn_and_log, with_retry, with_timeout};

// Re-export logging helpers
pub use crate::logging::{device_span, operation_span};
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
