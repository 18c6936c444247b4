//! Session protocol
//!
//! Framing of encapsulation packets on a byte stream, the notifications a
//! session publishes, and the pure session/connection state machine shared
//! by the originator and target sides.

pub mod codec;
pub mod message;
pub mod state;

pub use self::codec::EncapsulationCodec;
pub use self::message::Notification;
pub use self::state::{ConnectionState, Effect, Event, LinkState, Role, SessionState, StatusError};
