//! EtherNet/IP explicit messaging
//!
//! This library implements the EtherNet/IP encapsulation protocol and the CIP
//! message layer carried over it, for both ends of a TCP connection: an
//! [`Originator`] that registers a session and sends requests to a controller,
//! and a [`Server`] that answers them through application-provided service
//! handlers.
//!
//! The wire codecs (`encapsulation`, `cip`) are plain functions over byte
//! slices. Session and connection bookkeeping is a pure state machine in
//! `protocol`, driven by the tokio actors in `network`.

pub mod cip;
pub mod core;
pub mod encapsulation;
pub mod network;
pub mod protocol;
pub mod util;

// Re-export commonly used items
pub use crate::cip::{CipPacket, CipPath, ServiceHandler, ServiceTable};
pub use crate::core::{Config, Error, Result};
pub use crate::network::{Originator, Server};
pub use crate::protocol::Notification;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
