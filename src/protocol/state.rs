use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::core::{Error, Result, PROTOCOL_VERSION};
use crate::encapsulation::{
    self,
    header::status,
    Command, EncapsulationHeader,
};
use super::message::Notification;

/// Progress of one layer of the stack
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LinkState {
    #[default]
    Unconnected,
    Establishing,
    Established,
}

/// Which end of the TCP connection this state belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client; receives its session handle from the target
    Originator,
    /// Server side of one accepted connection
    Target {
        /// Handle handed out on RegisterSession
        assigned_handle: u32,
    },
}

/// Class 3 (explicit) connection bookkeeping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub state: LinkState,
    /// O->T connection id used in SendUnitData
    pub id: u32,
    /// Sequence count of the last connected send
    pub seq_num: u16,
}

/// Last non-zero encapsulation status seen
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusError {
    pub code: u32,
    pub message: String,
}

/// Inputs to the state machine
#[derive(Debug, Clone)]
pub enum Event {
    /// TCP connect started
    TcpConnecting,
    /// TCP connect completed
    TcpConnected,
    /// A complete packet arrived
    Frame(EncapsulationHeader),
    /// The UnregisterSession packet was written
    UnregisterWritten,
    /// The outstanding unconnected request got no reply in time
    RequestTimedOut,
    /// ForwardOpen sent
    ConnectionOpening,
    /// ForwardOpen accepted
    ConnectionOpened {
        connection_id: u32,
    },
    /// ForwardOpen rejected or timed out
    ConnectionFailed,
    /// ForwardClose completed
    ConnectionClosed,
    /// The socket closed or errored
    TcpClosed,
}

/// Work the owner of the state must carry out after a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Publish a notification
    Notify(Notification),
    /// Write a packet to the socket
    Write(Bytes),
    /// Close the socket once pending writes are flushed
    Shutdown,
}

/// Session and connection state of one TCP socket
///
/// Transitions are pure: [`SessionState::step`] consumes the state and an
/// event and returns the next state with the effects to perform. Outbound
/// operations (`register`, `send`, `unregister`) leave `self` untouched and
/// return the state to adopt once the packet is handed to the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    role: Role,
    tcp: LinkState,
    session: LinkState,
    session_handle: Option<u32>,
    connection: ConnectionState,
    /// Deadline of the outstanding unconnected request
    pending_until: Option<Instant>,
    last_error: Option<StatusError>,
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::originator()
    }
}

impl SessionState {
    /// Fresh originator state, nothing connected
    pub fn originator() -> Self {
        SessionState {
            role: Role::Originator,
            tcp: LinkState::Unconnected,
            session: LinkState::Unconnected,
            session_handle: None,
            connection: ConnectionState::default(),
            pending_until: None,
            last_error: None,
        }
    }

    /// State of a freshly accepted connection
    pub fn target(assigned_handle: u32) -> Self {
        SessionState {
            role: Role::Target { assigned_handle },
            tcp: LinkState::Established,
            ..SessionState::originator()
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn tcp(&self) -> LinkState {
        self.tcp
    }

    pub fn session(&self) -> LinkState {
        self.session
    }

    pub fn session_handle(&self) -> Option<u32> {
        self.session_handle
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn last_error(&self) -> Option<&StatusError> {
        self.last_error.as_ref()
    }

    pub fn is_established(&self) -> bool {
        self.session == LinkState::Established && self.session_handle.is_some()
    }

    /// Whether an unconnected request still awaits its reply at `now`
    pub fn has_pending_request(&self, now: Instant) -> bool {
        self.pending_until.map_or(false, |until| now < until)
    }

    /// Applies one event
    pub fn step(mut self, event: Event) -> (SessionState, Vec<Effect>) {
        let mut effects = Vec::new();

        match event {
            Event::TcpConnecting => self.tcp = LinkState::Establishing,
            Event::TcpConnected => self.tcp = LinkState::Established,
            Event::Frame(header) => self.on_frame(header, &mut effects),
            Event::UnregisterWritten => {
                self.session = LinkState::Unconnected;
                self.connection = ConnectionState::default();
                self.pending_until = None;
            }
            Event::RequestTimedOut => self.pending_until = None,
            Event::ConnectionOpening => {
                self.connection = ConnectionState {
                    state: LinkState::Establishing,
                    ..ConnectionState::default()
                };
            }
            Event::ConnectionOpened { connection_id } => {
                self.connection = ConnectionState {
                    state: LinkState::Established,
                    id: connection_id,
                    seq_num: 0,
                };
            }
            Event::ConnectionFailed | Event::ConnectionClosed => {
                self.connection = ConnectionState::default();
            }
            Event::TcpClosed => {
                self.tcp = LinkState::Unconnected;
                self.session = LinkState::Unconnected;
                self.session_handle = None;
                self.connection = ConnectionState::default();
                self.pending_until = None;
                effects.push(Effect::Notify(Notification::Closed));
            }
        }

        (self, effects)
    }

    fn on_frame(&mut self, header: EncapsulationHeader, effects: &mut Vec<Effect>) {
        if header.status != status::SUCCESS {
            let message = header.status_message();
            warn!(code = header.status, %message, "encapsulation status error");

            if self.session == LinkState::Establishing {
                self.session = LinkState::Unconnected;
            }
            self.pending_until = None;
            self.last_error = Some(StatusError { code: header.status, message: message.clone() });
            effects.push(Effect::Notify(Notification::SessionRegistrationFailed {
                code: header.status,
                message,
            }));
            return;
        }
        self.last_error = None;

        match header.command() {
            Some(Command::RegisterSession) => self.on_register_session(header, effects),
            Some(Command::UnregisterSession) => {
                debug!(handle = header.session_handle, "session unregistered by peer");
                self.session = LinkState::Unconnected;
                self.connection = ConnectionState::default();
                self.pending_until = None;
                effects.push(Effect::Notify(Notification::SessionUnregistered));
                if matches!(self.role, Role::Target { .. }) {
                    effects.push(Effect::Shutdown);
                }
            }
            Some(command @ (Command::SendRRData | Command::SendUnitData)) => {
                self.on_data(command, header, effects)
            }
            _ => {
                debug!(command = header.command, "unhandled encapsulation command");
                effects.push(Effect::Notify(Notification::UnhandledCommand { header }));
            }
        }
    }

    fn on_register_session(&mut self, header: EncapsulationHeader, effects: &mut Vec<Effect>) {
        match self.role {
            Role::Originator => {
                self.session = LinkState::Established;
                self.session_handle = Some(header.session_handle);
                debug!(handle = header.session_handle, "session registered");
                effects.push(Effect::Notify(Notification::SessionRegistered {
                    session_handle: header.session_handle,
                }));
            }
            Role::Target { assigned_handle } => {
                let version = encapsulation::parse_register_session_data(&header.data);
                let mut reply = EncapsulationHeader {
                    session_handle: 0,
                    ..header
                };

                match version {
                    Ok(PROTOCOL_VERSION) => {
                        self.session = LinkState::Established;
                        self.session_handle = Some(assigned_handle);
                        reply.session_handle = assigned_handle;
                        push_write(effects, reply.to_bytes());
                        effects.push(Effect::Notify(Notification::SessionRegistered {
                            session_handle: assigned_handle,
                        }));
                    }
                    Ok(other) => {
                        warn!(version = other, "unsupported encapsulation protocol version");
                        reply.status = status::UNSUPPORTED_PROTOCOL_REVISION;
                        push_write(effects, reply.to_bytes());
                    }
                    Err(e) => {
                        warn!(error = %e, "malformed RegisterSession");
                        reply.status = status::INVALID_LENGTH;
                        push_write(effects, reply.to_bytes());
                    }
                }
            }
        }
    }

    fn on_data(&mut self, command: Command, header: EncapsulationHeader, effects: &mut Vec<Effect>) {
        let is_target = matches!(self.role, Role::Target { .. });

        if is_target && (!self.is_established() || self.session_handle != Some(header.session_handle)) {
            warn!(handle = header.session_handle, "data for an unregistered session");
            push_write(effects, error_reply(&header, status::INVALID_SESSION_HANDLE));
            return;
        }

        match encapsulation::parse_command_data(&header.data) {
            Ok(items) => {
                let notification = if command == Command::SendRRData {
                    if !is_target {
                        self.pending_until = None;
                    }
                    Notification::SendRRDataReceived { items }
                } else {
                    Notification::SendUnitDataReceived { items }
                };
                effects.push(Effect::Notify(notification));
            }
            Err(e) => {
                warn!(error = %e, "malformed command data");
                if is_target {
                    push_write(effects, error_reply(&header, status::MALFORMED_PACKET));
                } else {
                    self.pending_until = None;
                    effects.push(Effect::Notify(Notification::SessionRegistrationFailed {
                        code: status::MALFORMED_PACKET,
                        message: encapsulation::status_message(status::MALFORMED_PACKET),
                    }));
                }
            }
        }
    }

    /// Builds the RegisterSession request and moves the session to establishing
    pub fn register(&self) -> Result<(SessionState, Bytes)> {
        if self.role != Role::Originator {
            return Err(Error::invalid_state("only an originator registers a session"));
        }
        if self.tcp != LinkState::Established {
            return Err(Error::invalid_state("TCP connection not established"));
        }
        if self.session != LinkState::Unconnected {
            return Err(Error::invalid_state("session already registered or registering"));
        }

        let packet = encapsulation::register_session(0)?;
        let mut next = self.clone();
        next.session = LinkState::Establishing;
        Ok((next, packet))
    }

    /// Wraps `payload` for sending
    ///
    /// Connected sends advance the 16-bit sequence count (wrapping to 0) and
    /// produce SendUnitData. Unconnected sends produce SendRRData; an
    /// originator may only have one of those outstanding at a time.
    pub fn send(
        &self,
        payload: &[u8],
        connected: bool,
        timeout_secs: u16,
        now: Instant,
    ) -> Result<(SessionState, Bytes)> {
        let handle = match (self.session, self.session_handle) {
            (LinkState::Established, Some(handle)) => handle,
            _ => return Err(Error::SessionNotEstablished),
        };

        let mut next = self.clone();
        let packet = if connected {
            if self.connection.state != LinkState::Established {
                return Err(Error::NoConnectionEstablished);
            }
            next.connection.seq_num = self.connection.seq_num.wrapping_add(1);
            encapsulation::send_unit_data(handle, payload, next.connection.id, next.connection.seq_num)?
        } else {
            if self.role == Role::Originator {
                if self.has_pending_request(now) {
                    return Err(Error::RequestOutstanding);
                }
                let wait = Duration::from_secs(u64::from(timeout_secs.max(1)));
                next.pending_until = Some(now + wait);
            }
            encapsulation::send_rr_data(handle, payload, timeout_secs)?
        };

        Ok((next, packet))
    }

    /// UnregisterSession packet, if there is a session to unregister
    pub fn unregister(&self) -> Result<Option<Bytes>> {
        match (self.session, self.session_handle) {
            (LinkState::Established, Some(handle)) if self.tcp == LinkState::Established => {
                Ok(Some(encapsulation::unregister_session(handle)?))
            }
            _ => Ok(None),
        }
    }
}

fn push_write(effects: &mut Vec<Effect>, packet: Result<Bytes>) {
    match packet {
        Ok(bytes) => effects.push(Effect::Write(bytes)),
        Err(e) => warn!(error = %e, "failed to build reply packet"),
    }
}

/// Reply echoing the request's command and context with an error status
fn error_reply(request: &EncapsulationHeader, code: u32) -> Result<Bytes> {
    EncapsulationHeader {
        command: request.command,
        length: 0,
        session_handle: request.session_handle,
        status: code,
        sender_context: request.sender_context,
        options: 0,
        data: Bytes::new(),
    }
    .to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encapsulation::{header, ItemType};

    fn frame(packet: Bytes) -> Event {
        Event::Frame(header::parse(&packet).unwrap())
    }

    fn registered_originator(handle: u32) -> SessionState {
        let (state, _) = SessionState::originator().step(Event::TcpConnected);
        let (state, _) = state.register().unwrap();
        let reply = header::build(Command::RegisterSession.code(), handle, &[1, 0, 0, 0]).unwrap();
        state.step(frame(reply)).0
    }

    fn notifications(effects: &[Effect]) -> Vec<&Notification> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Notify(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_connection_flow() {
        let state = SessionState::originator();
        assert_eq!(state.tcp(), LinkState::Unconnected);

        let (state, _) = state.step(Event::TcpConnecting);
        assert_eq!(state.tcp(), LinkState::Establishing);
        let (state, _) = state.step(Event::TcpConnected);

        let (state, packet) = state.register().unwrap();
        assert_eq!(state.session(), LinkState::Establishing);
        assert_eq!(header::parse(&packet).unwrap().command(), Some(Command::RegisterSession));

        let reply = header::build(Command::RegisterSession.code(), 0xABCD, &[1, 0, 0, 0]).unwrap();
        let (state, effects) = state.step(frame(reply));
        assert!(state.is_established());
        assert_eq!(state.session_handle(), Some(0xABCD));
        assert_eq!(
            notifications(&effects),
            vec![&Notification::SessionRegistered { session_handle: 0xABCD }]
        );
    }

    #[test]
    fn test_registration_failure() {
        let (state, _) = SessionState::originator().step(Event::TcpConnected);
        let (state, _) = state.register().unwrap();

        let mut reply = header::parse(&header::build(0x65, 0, &[1, 0, 0, 0]).unwrap()).unwrap();
        reply.status = status::UNSUPPORTED_PROTOCOL_REVISION;
        let (state, effects) = state.step(Event::Frame(reply));

        assert_eq!(state.session(), LinkState::Unconnected);
        assert_eq!(state.last_error().map(|e| e.code), Some(0x69));
        match notifications(&effects)[..] {
            [Notification::SessionRegistrationFailed { code, message }] => {
                assert_eq!(*code, 0x69);
                assert!(message.contains("protocol revision"));
            }
            ref other => panic!("unexpected notifications {:?}", other),
        }
    }

    #[test]
    fn test_invalid_transitions() {
        let state = SessionState::originator();
        assert!(matches!(state.register(), Err(Error::InvalidState(_))));
        assert!(matches!(
            state.send(&[0x0E], false, 10, Instant::now()),
            Err(Error::SessionNotEstablished)
        ));
        assert!(state.unregister().unwrap().is_none());

        let established = registered_originator(1);
        assert!(matches!(established.register(), Err(Error::InvalidState(_))));
        assert!(matches!(
            established.send(&[0x0E], true, 10, Instant::now()),
            Err(Error::NoConnectionEstablished)
        ));
        assert!(matches!(SessionState::target(1).register(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_unconnected_send_single_outstanding() {
        let state = registered_originator(7);
        let now = Instant::now();

        let (state, packet) = state.send(&[0x0E, 0x00], false, 10, now).unwrap();
        let parsed = header::parse(&packet).unwrap();
        assert_eq!(parsed.command(), Some(Command::SendRRData));
        assert_eq!(parsed.session_handle, 7);
        assert!(state.has_pending_request(now));

        assert!(matches!(
            state.send(&[0x0E, 0x00], false, 10, now),
            Err(Error::RequestOutstanding)
        ));
        // the previous request expires after its timeout
        assert!(state.send(&[0x0E], false, 10, now + Duration::from_secs(11)).is_ok());

        let reply = encapsulation::send_rr_data(7, &[0x8E, 0, 0, 0], 10).unwrap();
        let (state, effects) = state.step(frame(reply));
        assert!(!state.has_pending_request(now));
        match notifications(&effects)[..] {
            [Notification::SendRRDataReceived { items }] => {
                assert_eq!(items.len(), 2);
                assert_eq!(items[1].item_type(), Some(ItemType::Ucmm));
            }
            ref other => panic!("unexpected notifications {:?}", other),
        }

        let (state, _) = state.send(&[0x0E], false, 10, now).unwrap();
        let (state, _) = state.step(Event::RequestTimedOut);
        assert!(!state.has_pending_request(now));
    }

    #[test]
    fn test_sequence_number_wraps() {
        let (mut state, _) = registered_originator(3).step(Event::ConnectionOpened { connection_id: 0x55 });
        assert_eq!(state.connection().state, LinkState::Established);

        let (next, packet) = state.send(&[0x4C], true, 0, Instant::now()).unwrap();
        assert_eq!(next.connection().seq_num, 1);
        let items = encapsulation::parse_command_data(&header::parse(&packet).unwrap().data).unwrap();
        assert_eq!(&items[0].data[..], &0x55u32.to_le_bytes());
        assert_eq!(&items[1].data[..2], &[0x01, 0x00]);

        state.connection.seq_num = 0xFFFF;
        let (next, packet) = state.send(&[0x4C], true, 0, Instant::now()).unwrap();
        assert_eq!(next.connection().seq_num, 0);
        let items = encapsulation::parse_command_data(&header::parse(&packet).unwrap().data).unwrap();
        assert_eq!(&items[1].data[..2], &[0x00, 0x00]);

        // connected sends never count as outstanding requests
        assert!(!next.has_pending_request(Instant::now()));
    }

    #[test]
    fn test_connection_lifecycle() {
        let state = registered_originator(3);
        let (state, _) = state.step(Event::ConnectionOpening);
        assert_eq!(state.connection().state, LinkState::Establishing);
        let (state, _) = state.step(Event::ConnectionFailed);
        assert_eq!(state.connection(), ConnectionState::default());

        let (state, _) = state.step(Event::ConnectionOpened { connection_id: 9 });
        let (state, _) = state.step(Event::ConnectionClosed);
        assert_eq!(state.connection().state, LinkState::Unconnected);
    }

    #[test]
    fn test_unregister_and_close() {
        let state = registered_originator(5);
        let packet = state.unregister().unwrap().expect("established session");
        assert_eq!(header::parse(&packet).unwrap().command(), Some(Command::UnregisterSession));

        let (state, effects) = state.step(Event::UnregisterWritten);
        assert!(effects.is_empty());
        assert_eq!(state.session(), LinkState::Unconnected);

        let (state, effects) = registered_originator(5).step(Event::TcpClosed);
        assert_eq!(state.tcp(), LinkState::Unconnected);
        assert_eq!(state.session(), LinkState::Unconnected);
        assert_eq!(effects, vec![Effect::Notify(Notification::Closed)]);
    }

    #[test]
    fn test_peer_unregisters() {
        let packet = encapsulation::unregister_session(5).unwrap();
        let (state, effects) = registered_originator(5).step(frame(packet.clone()));
        assert_eq!(state.session(), LinkState::Unconnected);
        assert_eq!(effects, vec![Effect::Notify(Notification::SessionUnregistered)]);

        let (target, _) = SessionState::target(5).step(frame(encapsulation::register_session(0).unwrap()));
        let (_, effects) = target.step(frame(packet));
        assert_eq!(effects.last(), Some(&Effect::Shutdown));
    }

    #[test]
    fn test_unhandled_command() {
        let packet = header::build(Command::ListIdentity.code(), 0, &[]).unwrap();
        let (_, effects) = SessionState::originator().step(frame(packet));
        assert!(matches!(
            notifications(&effects)[..],
            [Notification::UnhandledCommand { header }] if header.command == 0x63
        ));
    }

    #[test]
    fn test_target_registration() {
        let state = SessionState::target(0x10);
        assert_eq!(state.tcp(), LinkState::Established);
        assert_eq!(state.session(), LinkState::Unconnected);

        let (state, effects) = state.step(frame(encapsulation::register_session(0).unwrap()));
        assert_eq!(state.session_handle(), Some(0x10));
        match &effects[..] {
            [Effect::Write(reply), Effect::Notify(Notification::SessionRegistered { session_handle: 0x10 })] => {
                let reply = header::parse(reply).unwrap();
                assert_eq!(reply.command(), Some(Command::RegisterSession));
                assert_eq!(reply.session_handle, 0x10);
                assert_eq!(reply.status, 0);
                assert_eq!(&reply.data[..], &[1, 0, 0, 0]);
            }
            other => panic!("unexpected effects {:?}", other),
        }
    }

    #[test]
    fn test_target_rejects_protocol_version() {
        let request = header::build(Command::RegisterSession.code(), 0, &[2, 0, 0, 0]).unwrap();
        let (state, effects) = SessionState::target(1).step(frame(request));
        assert!(!state.is_established());
        match &effects[..] {
            [Effect::Write(reply)] => assert_eq!(header::parse(reply).unwrap().status, 0x69),
            other => panic!("unexpected effects {:?}", other),
        }
    }

    #[test]
    fn test_target_rejects_unknown_session() {
        let request = encapsulation::send_rr_data(99, &[0x0E, 0x00], 10).unwrap();
        let (_, effects) = SessionState::target(1).step(frame(request.clone()));
        match &effects[..] {
            [Effect::Write(reply)] => assert_eq!(header::parse(reply).unwrap().status, 0x64),
            other => panic!("unexpected effects {:?}", other),
        }

        let (target, _) = SessionState::target(1).step(frame(encapsulation::register_session(0).unwrap()));
        let (_, effects) = target.step(frame(request));
        assert!(matches!(effects[..], [Effect::Write(_)]));
    }

    #[test]
    fn test_target_reply_not_limited_to_one_outstanding() {
        let (target, _) = SessionState::target(1).step(frame(encapsulation::register_session(0).unwrap()));
        let now = Instant::now();
        let (target, _) = target.send(&[0x8E, 0, 0, 0], false, 50, now).unwrap();
        assert!(target.send(&[0x8E, 0, 0, 0], false, 50, now).is_ok());
    }

    #[test]
    fn test_malformed_command_data_reported() {
        let state = registered_originator(2);
        let packet = header::build(Command::SendRRData.code(), 2, &[0, 0, 0]).unwrap();
        let (_, effects) = state.step(frame(packet));
        assert!(matches!(
            notifications(&effects)[..],
            [Notification::SessionRegistrationFailed { code: 0x03, .. }]
        ));
    }
}
