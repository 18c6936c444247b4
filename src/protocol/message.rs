use crate::encapsulation::{CpfItem, EncapsulationHeader};

/// Notifications emitted by a session, one per inbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// RegisterSession succeeded
    SessionRegistered {
        /// Handle assigned by the target
        session_handle: u32,
    },

    /// A packet arrived with a non-zero encapsulation status
    SessionRegistrationFailed {
        /// Encapsulation status code
        code: u32,
        /// Readable form of `code`
        message: String,
    },

    /// The session was unregistered by the peer
    SessionUnregistered,

    /// Unconnected data arrived
    SendRRDataReceived {
        /// CPF items in wire order
        items: Vec<CpfItem>,
    },

    /// Connected data arrived
    SendUnitDataReceived {
        /// CPF items in wire order
        items: Vec<CpfItem>,
    },

    /// Any other command
    UnhandledCommand {
        /// The full parsed packet
        header: EncapsulationHeader,
    },

    /// The TCP connection closed
    Closed,
}

impl Notification {
    /// Short event name
    pub fn name(&self) -> &'static str {
        match self {
            Notification::SessionRegistered { .. } => "Session Registered",
            Notification::SessionRegistrationFailed { .. } => "Session Registration Failed",
            Notification::SessionUnregistered => "Session Unregistered",
            Notification::SendRRDataReceived { .. } => "SendRRData Received",
            Notification::SendUnitDataReceived { .. } => "SendUnitData Received",
            Notification::UnhandledCommand { .. } => "Unhandled Encapsulated Command Received",
            Notification::Closed => "Closed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_names() {
        assert_eq!(
            Notification::SessionRegistered { session_handle: 1 }.name(),
            "Session Registered"
        );
        assert_eq!(Notification::SendRRDataReceived { items: vec![] }.name(), "SendRRData Received");
        assert_eq!(Notification::Closed.name(), "Closed");
    }
}
