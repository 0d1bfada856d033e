/*!
 * Transport implementations for DomoFlow.
 *
 * This module contains the request/response transports vendor integrations
 * are built on: JSON over UDP (with multicast listening), JSON over HTTP
 * and a line-framed JSON protocol over TCP.
 */

// Export transport implementations
pub mod tcp;
pub mod udp;

#[cfg(feature = "http")]
pub mod http;

// Re-export specific transports for convenience
pub use tcp::TcpJsonClient;
pub use udp::{UdpJsonClient, UdpMulticastListener};

#[cfg(feature = "http")]
pub use http::HttpJsonClient;
