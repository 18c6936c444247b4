//! CIP message layer
//! 
//! Path segments, Message Router requests and replies, Connection Manager
//! payloads, and the service dispatch table used by the target.

pub mod connection_manager;
pub mod epath;
pub mod message_router;
pub mod service;

pub use self::connection_manager::{
    build_connection_parameters, build_forward_close, build_forward_open, encode_timeout,
    ConnectionType, EncodedTimeout, FixedVar, ForwardOpenParams, ForwardOpenReply, Owner, Priority,
};
pub use self::epath::{build_logical_segment, LogicalType};
pub use self::message_router::{parse_request, CipPacket, CipPath, MessageRouterReply};
pub use self::service::{ServiceHandler, ServiceTable};

/// Connection Manager object class
pub const CONNECTION_MANAGER_CLASS: u32 = 0x06;
