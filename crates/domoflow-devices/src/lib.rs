/*!
 * DomoFlow Devices
 *
 * This crate provides the capability-based device model, watchers and
 * vendor integrations for the DomoFlow system.
 */

#![warn(missing_docs)]
#![warn(rustdoc::missing_doc_code_examples)]

// Re-export core types
pub use domoflow_core::prelude;

pub mod device;
pub mod discovery;
pub mod gateway;
pub mod status;
pub mod traits;
pub mod transport;
pub mod vendors;
pub mod watcher;

// Re-export the device model surface
pub use device::{BaseDevice, Capability, Device, DeviceDescriptor, DeviceError, Result};
pub use status::{Attribute, DeviceStatus};
pub use watcher::{Report, Watcher};

/// DomoFlow devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device system
pub fn init() -> Result<()> {
    tracing::info!("DomoFlow Devices {} initialized", VERSION);
    Ok(())
}

/// Get the protocols compiled into this build
pub fn available_protocols() -> Vec<&'static str> {
    let mut protocols = vec!["udp", "tcp"];

    #[cfg(feature = "mqtt")]
    protocols.push("mqtt");

    #[cfg(feature = "http")]
    protocols.push("http");

    protocols
}
