use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::cip::connection_manager::{self, ForwardOpenParams, ForwardOpenReply};
use crate::cip::message_router::{self, service, CipPath, MessageRouterReply};
use crate::cip::CONNECTION_MANAGER_CLASS;
use crate::core::{Error, OriginatorConfig, Result};
use crate::encapsulation::{CpfItem, ItemType};
use crate::protocol::{Effect, EncapsulationCodec, Event, Notification, SessionState};
use crate::util::{resolve_ipv4, with_timeout};

use super::{apply_effects, configure_stream, FrameSink};

/// Requests handled by the session task
enum SessionCommand {
    Send {
        payload: Bytes,
        connected: bool,
        timeout_secs: u16,
        reply: oneshot::Sender<Result<()>>,
    },
    Apply {
        event: Event,
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionState>,
    },
    Close {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// An open class 3 connection
#[derive(Debug, Clone, Copy)]
struct OpenConnection {
    serial: u16,
    timeout_ms: u64,
}

/// EtherNet/IP client
///
/// Owns at most one TCP connection at a time. The socket and its
/// [`SessionState`] live in a spawned task; this handle talks to it over a
/// command channel and observes it through [`Notification`]s.
pub struct Originator {
    config: OriginatorConfig,
    notify: broadcast::Sender<Notification>,
    commands: Option<mpsc::Sender<SessionCommand>>,
    task: Option<JoinHandle<()>>,
    connection_serial: u16,
    open_connection: Option<OpenConnection>,
}

impl Originator {
    /// Creates a disconnected originator
    pub fn new(config: OriginatorConfig) -> Self {
        let (notify, _) = broadcast::channel(config.notification_capacity.max(1));
        Originator {
            config,
            notify,
            commands: None,
            task: None,
            connection_serial: rand::thread_rng().gen(),
            open_connection: None,
        }
    }

    /// Receiver for every notification published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notify.subscribe()
    }

    /// Connects to `host` and registers a session
    ///
    /// Returns the session handle, or `None` if the target refused the
    /// registration or closed the socket. DNS and TCP failures are returned
    /// before anything is sent; no answer within `timeout` is an
    /// [`Error::Timeout`].
    pub async fn connect(&mut self, host: &str, timeout: Duration) -> Result<Option<u32>> {
        if self.is_running() {
            return Err(Error::invalid_state("already connected"));
        }

        let ip = resolve_ipv4(host).await?;
        let addr = SocketAddr::from((ip, self.config.port));
        info!(%addr, "connecting");

        let mut stream = with_timeout(timeout, "TCP connect", async {
            TcpStream::connect(addr)
                .await
                .map_err(|e| Error::network(format!("Failed to connect to {}: {}", addr, e)))
        })
        .await?;
        configure_stream(&stream, self.config.tcp_keepalive)?;

        let (state, _) = SessionState::originator().step(Event::TcpConnecting);
        let (state, _) = state.step(Event::TcpConnected);
        let (state, packet) = state.register()?;

        // subscribe before the request goes out so the reply cannot be missed
        let mut notifications = self.notify.subscribe();
        stream.write_all(&packet).await?;

        let (tx, rx) = mpsc::channel(32);
        self.task = Some(tokio::spawn(run_session(stream, state, rx, self.notify.clone())));
        self.commands = Some(tx);
        self.open_connection = None;

        let outcome = with_timeout(timeout, "session registration", async {
            loop {
                match notifications.recv().await {
                    Ok(Notification::SessionRegistered { session_handle }) => {
                        return Ok(Some(session_handle))
                    }
                    Ok(Notification::SessionRegistrationFailed { code, message }) => {
                        warn!(code, %message, "session registration failed");
                        return Ok(None);
                    }
                    Ok(Notification::Closed) | Err(RecvError::Closed) => return Ok(None),
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                }
            }
        })
        .await;

        match outcome {
            Ok(Some(handle)) => {
                info!(%addr, handle, "session established");
                Ok(Some(handle))
            }
            other => {
                self.shutdown().await;
                other
            }
        }
    }

    /// Sends `payload` on the session
    ///
    /// Connected sends go out as SendUnitData on the open connection;
    /// unconnected ones as SendRRData with `timeout_secs`. Completes once the
    /// packet has been written.
    pub async fn send(&self, payload: &[u8], connected: bool, timeout_secs: u16) -> Result<()> {
        let payload = Bytes::copy_from_slice(payload);
        self.call(|reply| SessionCommand::Send {
            payload,
            connected,
            timeout_secs,
            reply,
        })
        .await
    }

    /// Sends an unconnected request and waits for the SendRRData reply
    pub async fn request(&self, payload: &[u8], timeout: Duration) -> Result<Vec<CpfItem>> {
        let mut notifications = self.notify.subscribe();
        self.send(payload, false, self.config.rr_timeout_secs).await?;

        let result = with_timeout(timeout, "SendRRData reply", async {
            loop {
                match notifications.recv().await {
                    Ok(Notification::SendRRDataReceived { items }) => return Ok(items),
                    Ok(Notification::SessionRegistrationFailed { code, message }) => {
                        return Err(Error::protocol(format!(
                            "encapsulation status 0x{:02X}: {}",
                            code, message
                        )))
                    }
                    Ok(Notification::Closed) | Err(RecvError::Closed) => {
                        return Err(Error::network("connection closed while awaiting reply"))
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                }
            }
        })
        .await;

        if let Err(Error::Timeout(_)) = result {
            let _ = self.apply(Event::RequestTimedOut).await;
        }
        result
    }

    /// Opens a class 3 connection through the Connection Manager
    ///
    /// The connection serial and originator identity in `params` are replaced
    /// with this originator's own. Returns the O->T connection id used for
    /// connected sends.
    pub async fn forward_open(&mut self, mut params: ForwardOpenParams) -> Result<u32> {
        if self.open_connection.is_some() {
            return Err(Error::invalid_state("a connection is already open"));
        }

        params.connection_serial = self.next_connection_serial();
        params.vendor_id = self.config.vendor_id;
        params.originator_serial = self.config.originator_serial;

        let payload = connection_manager::build_forward_open_with(&params)?;
        let request = connection_manager_request(service::FORWARD_OPEN, &payload)?;

        self.apply(Event::ConnectionOpening).await?;
        let result = async {
            let data = self.unconnected_request(&request).await?;
            ForwardOpenReply::parse(&data)
        }
        .await;

        match result {
            Ok(reply) => {
                self.apply(Event::ConnectionOpened {
                    connection_id: reply.ot_connection_id,
                })
                .await?;
                self.open_connection = Some(OpenConnection {
                    serial: params.connection_serial,
                    timeout_ms: params.timeout_ms,
                });
                debug!(
                    ot = reply.ot_connection_id,
                    to = reply.to_connection_id,
                    serial = params.connection_serial,
                    "connection opened"
                );
                Ok(reply.ot_connection_id)
            }
            Err(e) => {
                warn!(error = %e, "ForwardOpen failed");
                let _ = self.apply(Event::ConnectionFailed).await;
                Err(e)
            }
        }
    }

    /// Closes the connection opened by [`Originator::forward_open`]
    pub async fn forward_close(&mut self) -> Result<()> {
        let open = self.open_connection.take().ok_or(Error::NoConnectionEstablished)?;

        let payload = connection_manager::build_forward_close(
            open.timeout_ms,
            self.config.vendor_id,
            self.config.originator_serial,
            open.serial,
        )?;
        let request = connection_manager_request(service::FORWARD_CLOSE, &payload)?;

        let result = self.unconnected_request(&request).await.map(|_| ());
        self.apply(Event::ConnectionClosed).await?;
        result
    }

    /// Unregisters the session and closes the socket
    ///
    /// Does not wait for any acknowledgement from the target.
    pub async fn close(&mut self) -> Result<()> {
        let commands = match self.commands.take() {
            Some(commands) => commands,
            None => return Ok(()),
        };
        self.open_connection = None;

        let (tx, rx) = oneshot::channel();
        let result = match commands.send(SessionCommand::Close { reply: tx }).await {
            Ok(()) => rx.await.unwrap_or(Ok(())),
            Err(_) => Ok(()),
        };

        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        result
    }

    /// Current session and connection state
    pub async fn snapshot(&self) -> Result<SessionState> {
        if !self.is_running() {
            return Ok(SessionState::originator());
        }
        let (tx, rx) = oneshot::channel();
        if self.sender()?.send(SessionCommand::Snapshot { reply: tx }).await.is_err() {
            return Ok(SessionState::originator());
        }
        // a task that stopped meanwhile has already reset to unconnected
        Ok(rx.await.unwrap_or_default())
    }

    fn is_running(&self) -> bool {
        self.commands.as_ref().map_or(false, |c| !c.is_closed())
    }

    fn sender(&self) -> Result<&mpsc::Sender<SessionCommand>> {
        self.commands.as_ref().ok_or(Error::SessionNotEstablished)
    }

    fn next_connection_serial(&mut self) -> u16 {
        self.connection_serial = self.connection_serial.wrapping_add(1);
        self.connection_serial
    }

    async fn call(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<()>>) -> SessionCommand,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender()?
            .send(make(tx))
            .await
            .map_err(|_| Error::SessionNotEstablished)?;
        rx.await.map_err(|_| Error::network("session task dropped the request"))?
    }

    async fn apply(&self, event: Event) -> Result<()> {
        self.call(|reply| SessionCommand::Apply { event, reply }).await
    }

    /// Round trip of a Message Router request, returning the reply data
    async fn unconnected_request(&self, request: &[u8]) -> Result<Bytes> {
        let wait = Duration::from_secs(u64::from(self.config.rr_timeout_secs.max(1)));
        let items = self.request(request, wait).await?;
        let item = items
            .iter()
            .find(|item| item.item_type() == Some(ItemType::Ucmm))
            .ok_or_else(|| Error::malformed_cpf("reply carries no UCMM item"))?;
        MessageRouterReply::parse(&item.data)?.into_result()
    }

    /// Stops the session task without unregistering
    async fn shutdown(&mut self) {
        self.commands = None;
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

fn connection_manager_request(service: u8, payload: &[u8]) -> Result<Bytes> {
    let path = CipPath::new(CONNECTION_MANAGER_CLASS, 1, 0).to_epath()?;
    message_router::build_request(service, &path, payload)
}

/// Session task: the only owner of the socket and the state
async fn run_session(
    stream: TcpStream,
    mut state: SessionState,
    mut commands: mpsc::Receiver<SessionCommand>,
    notify: broadcast::Sender<Notification>,
) {
    let (mut sink, mut frames) = Framed::new(stream, EncapsulationCodec::new()).split();
    let mut publish = |notification: Notification| {
        let _ = notify.send(notification);
    };

    loop {
        tokio::select! {
            command = commands.recv() => {
                let command = match command {
                    Some(command) => command,
                    None => {
                        debug!("originator handle dropped");
                        break;
                    }
                };

                match command {
                    SessionCommand::Send { payload, connected, timeout_secs, reply } => {
                        let result = send_packet(&mut state, &mut sink, &payload, connected, timeout_secs).await;
                        let _ = reply.send(result);
                    }
                    SessionCommand::Apply { event, reply } => {
                        let (next, effects) = std::mem::take(&mut state).step(event);
                        state = next;
                        let result = apply_effects(effects, &mut sink, &mut publish).await.map(|_| ());
                        let _ = reply.send(result);
                    }
                    SessionCommand::Snapshot { reply } => {
                        let _ = reply.send(state.clone());
                    }
                    SessionCommand::Close { reply } => {
                        let result = unregister(&mut state, &mut sink).await;
                        let _ = reply.send(result);
                        break;
                    }
                }
            }

            frame = frames.next() => {
                match frame {
                    Some(Ok(header)) => {
                        let (next, effects) = std::mem::take(&mut state).step(Event::Frame(header));
                        state = next;
                        match apply_effects(effects, &mut sink, &mut publish).await {
                            Ok(true) => {}
                            Ok(false) | Err(_) => break,
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "socket error");
                        break;
                    }
                    None => {
                        debug!("connection closed by target");
                        break;
                    }
                }
            }
        }
    }

    drop(commands);
    let _ = sink.close().await;
    let (_, effects) = state.step(Event::TcpClosed);
    for effect in effects {
        if let Effect::Notify(notification) = effect {
            publish(notification);
        }
    }
}

async fn send_packet(
    state: &mut SessionState,
    sink: &mut FrameSink,
    payload: &[u8],
    connected: bool,
    timeout_secs: u16,
) -> Result<()> {
    let (next, packet) = state.send(payload, connected, timeout_secs, Instant::now())?;
    sink.send(packet).await?;
    *state = next;
    Ok(())
}

async fn unregister(state: &mut SessionState, sink: &mut FrameSink) -> Result<()> {
    if let Some(packet) = state.unregister()? {
        sink.send(packet).await?;
        let (next, _) = std::mem::take(state).step(Event::UnregisterWritten);
        *state = next;
        debug!("session unregistered");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Config;
    use crate::encapsulation::{self, header, Command};
    use crate::protocol::LinkState;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Reads one whole encapsulation packet from a raw socket
    async fn read_packet(socket: &mut TcpStream) -> header::EncapsulationHeader {
        let mut head = [0u8; 24];
        socket.read_exact(&mut head).await.unwrap();
        let length = u16::from_le_bytes([head[2], head[3]]) as usize;
        let mut packet = head.to_vec();
        packet.resize(24 + length, 0);
        socket.read_exact(&mut packet[24..]).await.unwrap();
        header::parse(&packet).unwrap()
    }

    async fn scripted_target() -> (SocketAddr, JoinHandle<Vec<header::EncapsulationHeader>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut seen = Vec::new();

            let register = read_packet(&mut socket).await;
            let reply = header::build(Command::RegisterSession.code(), 0x2A, &register.data).unwrap();
            socket.write_all(&reply).await.unwrap();
            seen.push(register);

            loop {
                let mut head = [0u8; 24];
                if socket.read_exact(&mut head).await.is_err() {
                    break;
                }
                let length = u16::from_le_bytes([head[2], head[3]]) as usize;
                let mut packet = head.to_vec();
                packet.resize(24 + length, 0);
                socket.read_exact(&mut packet[24..]).await.unwrap();
                seen.push(header::parse(&packet).unwrap());
            }
            seen
        });
        (addr, task)
    }

    fn config_for(addr: SocketAddr) -> OriginatorConfig {
        OriginatorConfig {
            port: addr.port(),
            ..Config::default().originator
        }
    }

    #[tokio::test]
    async fn test_send_before_connect() {
        let originator = Originator::new(OriginatorConfig::default());
        assert!(matches!(
            originator.send(&[0x0E], false, 10).await,
            Err(Error::SessionNotEstablished)
        ));
        assert_eq!(originator.snapshot().await.unwrap().tcp(), LinkState::Unconnected);
    }

    #[tokio::test]
    async fn test_connected_send_requires_connection() {
        let (addr, target) = scripted_target().await;
        let mut originator = Originator::new(config_for(addr));
        assert_eq!(
            originator.connect("127.0.0.1", Duration::from_secs(5)).await.unwrap(),
            Some(0x2A)
        );

        assert!(matches!(
            originator.send(&[0x4C], true, 0).await,
            Err(Error::NoConnectionEstablished)
        ));
        assert!(matches!(
            originator.forward_close().await,
            Err(Error::NoConnectionEstablished)
        ));

        originator.close().await.unwrap();
        let seen = target.await.unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].command(), Some(Command::UnregisterSession));
        assert_eq!(seen[1].session_handle, 0x2A);
    }

    #[tokio::test]
    async fn test_second_unconnected_send_rejected() {
        let (addr, target) = scripted_target().await;
        let mut originator = Originator::new(config_for(addr));
        originator.connect("127.0.0.1", Duration::from_secs(5)).await.unwrap();

        originator.send(&[0x0E, 0x00], false, 10).await.unwrap();
        assert!(matches!(
            originator.send(&[0x0E, 0x00], false, 10).await,
            Err(Error::RequestOutstanding)
        ));

        originator.close().await.unwrap();
        let seen = target.await.unwrap();
        assert_eq!(seen[1].command(), Some(Command::SendRRData));
        let items = encapsulation::parse_command_data(&seen[1].data).unwrap();
        assert_eq!(&items[1].data[..], &[0x0E, 0x00]);
    }

    #[tokio::test]
    async fn test_request_timeout_clears_outstanding() {
        let (addr, target) = scripted_target().await;
        let mut originator = Originator::new(config_for(addr));
        originator.connect("127.0.0.1", Duration::from_secs(5)).await.unwrap();

        let result = originator.request(&[0x0E, 0x00], Duration::from_millis(100)).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        originator.send(&[0x0E, 0x00], false, 10).await.unwrap();

        originator.close().await.unwrap();
        assert_eq!(target.await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_connection_serial_wraps() {
        let mut originator = Originator::new(OriginatorConfig::default());
        originator.connection_serial = 0xFFFF;
        assert_eq!(originator.next_connection_serial(), 0);
        assert_eq!(originator.next_connection_serial(), 1);
    }

    #[tokio::test]
    async fn test_closed_notification_on_target_hangup() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let target = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let register = read_packet(&mut socket).await;
            let reply = header::build(Command::RegisterSession.code(), 9, &register.data).unwrap();
            socket.write_all(&reply).await.unwrap();
        });

        let mut originator = Originator::new(config_for(addr));
        let mut notifications = originator.subscribe();
        originator.connect("127.0.0.1", Duration::from_secs(5)).await.unwrap();
        target.await.unwrap();

        loop {
            if notifications.recv().await.unwrap() == Notification::Closed {
                break;
            }
        }
        let state = originator.snapshot().await.unwrap();
        assert_eq!(state.session(), LinkState::Unconnected);
        assert!(matches!(
            originator.send(&[0x0E], false, 10).await,
            Err(Error::SessionNotEstablished)
        ));
    }
}
