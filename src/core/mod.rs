//! Core types shared by every layer of the stack
//! 
//! Errors, configuration, serde helpers and the protocol constants used by both
//! the originator and the target.

pub mod error;
pub mod types;
pub mod serde;

pub use self::error::{Error, Result};
pub use self::types::{Config, OriginatorConfig, ServerConfig};

/// Encapsulation protocol version carried in RegisterSession
pub const PROTOCOL_VERSION: u16 = 1;

/// Registered TCP port for EtherNet/IP explicit messaging
pub const EIP_PORT: u16 = 44818;

/// Size of the fixed encapsulation header in bytes
pub const ENCAPSULATION_HEADER_SIZE: usize = 24;

/// Vendor id announced by this originator in ForwardOpen/ForwardClose
pub const DEFAULT_VENDOR_ID: u16 = 0x3333;

/// Serial number announced by this originator in ForwardOpen/ForwardClose
pub const DEFAULT_ORIGINATOR_SERIAL: u32 = 0x1337;
