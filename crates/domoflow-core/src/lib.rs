/*!
 * DomoFlow Core
 *
 * This crate provides the shared foundation for the DomoFlow system:
 * the attribute value model, configuration, logging and async utilities.
 */

#![warn(missing_docs)]
#![warn(rustdoc::missing_doc_code_examples)]

pub mod config;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod types;
pub mod utils;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use chrono;
    pub use futures;
    pub use serde;
    pub use serde_json;
    pub use tokio;
    pub use tracing;
    pub use uuid;
}

/// DomoFlow core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("DomoFlow Core {} initialized", VERSION);
    Ok(())
}
