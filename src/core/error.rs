use std::io;
use thiserror::Error;

/// Error types for the EtherNet/IP stack
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid encapsulation command: 0x{0:04X}")]
    InvalidCommand(u16),

    #[error("Malformed encapsulation header: {0} bytes, need at least 24")]
    MalformedHeader(usize),

    #[error("Truncated encapsulation payload: expected {expected} bytes, got {actual}")]
    TruncatedPayload { expected: usize, actual: usize },

    #[error("Unknown CPF item type: 0x{0:04X}")]
    UnknownItemType(u16),

    #[error("Malformed CPF data: {0}")]
    MalformedCpf(String),

    #[error("Invalid logical segment type: 0x{0:02X}")]
    InvalidSegmentType(u8),

    #[error("Invalid logical segment address: {0}")]
    InvalidAddress(u32),

    #[error("Unsupported path segment: 0x{0:02X}")]
    UnsupportedSegment(u8),

    #[error("Malformed CIP request: {0}")]
    MalformedRequest(String),

    #[error("Invalid owner: {0}, expected Exclusive (0) or Multiple (1)")]
    InvalidOwner(u8),

    #[error("Invalid connection type: {0}, expected Null (0), Multicast (1), PointToPoint (2) or Reserved (3)")]
    InvalidConnectionType(u8),

    #[error("Invalid priority: {0}, expected Low (0), High (1), Scheduled (2) or Urgent (3)")]
    InvalidPriority(u8),

    #[error("Invalid fixed/variable flag: {0}, expected Fixed (0) or Variable (1)")]
    InvalidFixedVar(u8),

    #[error("Invalid connection size: {0}, must be between 2 and 10000")]
    InvalidSize(u16),

    #[error("Invalid timeout: {0}")]
    InvalidTimeout(String),

    #[error("Invalid timeout multiplier: {0}, expected a power of two between 4 and 512")]
    InvalidTimeoutMultiplier(u32),

    #[error("Invalid RPI: {0}, must be at least 8000")]
    InvalidRpi(u32),

    #[error("Invalid originator identity: {0}")]
    InvalidOriginator(String),

    #[error("No session established")]
    SessionNotEstablished,

    #[error("Connected message requested but no connection established")]
    NoConnectionEstablished,

    #[error("An unconnected request is already outstanding")]
    RequestOutstanding,

    #[error("No service handler registered for service 0x{0:02X}")]
    NoServiceHandler(u8),

    #[error("CIP service 0x{service:02X} failed with general status 0x{status:02X}")]
    CipStatus { service: u8, status: u8 },

    #[error("DNS error: {0}")]
    Dns(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Creates a new network error
    pub fn network(msg: impl Into<String>) -> Self {
        Error::Network(msg.into())
    }

    /// Creates a new DNS error
    pub fn dns(msg: impl Into<String>) -> Self {
        Error::Dns(msg.into())
    }

    /// Creates a new timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Creates a new invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Creates a new CPF error
    pub fn malformed_cpf(msg: impl Into<String>) -> Self {
        Error::MalformedCpf(msg.into())
    }

    /// Creates a new malformed request error
    pub fn malformed_request(msg: impl Into<String>) -> Self {
        Error::MalformedRequest(msg.into())
    }

    /// Returns true for errors raised by builders on out-of-range input
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidCommand(_)
                | Error::UnknownItemType(_)
                | Error::InvalidSegmentType(_)
                | Error::InvalidAddress(_)
                | Error::InvalidOwner(_)
                | Error::InvalidConnectionType(_)
                | Error::InvalidPriority(_)
                | Error::InvalidFixedVar(_)
                | Error::InvalidSize(_)
                | Error::InvalidTimeout(_)
                | Error::InvalidTimeoutMultiplier(_)
                | Error::InvalidRpi(_)
                | Error::InvalidOriginator(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::protocol("test error");
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(err.to_string(), "Protocol error: test error");
    }

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::Other, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_validation_classification() {
        assert!(Error::InvalidSize(0).is_validation());
        assert!(Error::InvalidCommand(0x99).is_validation());
        assert!(!Error::SessionNotEstablished.is_validation());
        assert!(!Error::timeout("connect").is_validation());
    }

    #[test]
    fn test_display_includes_codes() {
        assert_eq!(
            Error::InvalidCommand(0x99).to_string(),
            "Invalid encapsulation command: 0x0099"
        );
        assert_eq!(
            Error::CipStatus { service: 0x8E, status: 0x08 }.to_string(),
            "CIP service 0x8E failed with general status 0x08"
        );
    }
}
