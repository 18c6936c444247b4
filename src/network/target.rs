use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use crate::cip::message_router::{self, general_status};
use crate::cip::ServiceTable;
use crate::core::Result;
use crate::encapsulation::CpfItem;
use crate::protocol::{Effect, EncapsulationCodec, Event, Notification, SessionState};

use super::{apply_effects, FrameSink};

/// Per-connection target task
///
/// Serves one accepted socket until the peer unregisters, hangs up, or the
/// socket fails.
pub(super) async fn run_target(
    stream: TcpStream,
    peer: SocketAddr,
    session_handle: u32,
    handlers: Arc<ServiceTable>,
    notify: broadcast::Sender<(SocketAddr, Notification)>,
    reply_timeout_secs: u16,
) {
    let (mut sink, mut frames) = Framed::new(stream, EncapsulationCodec::new()).split();
    let mut state = SessionState::target(session_handle);
    let mut publish = |notification: Notification| {
        let _ = notify.send((peer, notification));
    };

    'frames: while let Some(frame) = frames.next().await {
        let header = match frame {
            Ok(header) => header,
            Err(e) => {
                warn!(%peer, error = %e, "socket error");
                break;
            }
        };

        let (next, effects) = std::mem::take(&mut state).step(Event::Frame(header));
        state = next;

        let requests: Vec<Vec<CpfItem>> = effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Notify(Notification::SendRRDataReceived { items }) => Some(items.clone()),
                _ => None,
            })
            .collect();

        match apply_effects(effects, &mut sink, &mut publish).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(%peer, "session unregistered, closing");
                break;
            }
            Err(_) => break,
        }

        for items in requests {
            for item in items.iter().filter(|item| !item.data.is_empty()) {
                let reply = respond(&handlers, &item.data);
                if let Err(e) = send_reply(&mut state, &mut sink, &reply, reply_timeout_secs).await {
                    warn!(%peer, error = %e, "failed to send reply");
                    break 'frames;
                }
            }
        }
    }

    let _ = sink.close().await;
    let (_, effects) = state.step(Event::TcpClosed);
    for effect in effects {
        if let Effect::Notify(notification) = effect {
            publish(notification);
        }
    }
    debug!(%peer, "target connection closed");
}

/// Builds the Message Router reply for one request
///
/// Requests that cannot be parsed or have no handler get an error status
/// rather than tearing down the connection.
fn respond(handlers: &ServiceTable, data: &[u8]) -> Bytes {
    let request = match message_router::parse_request(data) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "malformed CIP request");
            let service = data.first().copied().unwrap_or_default();
            return message_router::build_error_reply(service, general_status::PATH_SEGMENT_ERROR);
        }
    };
    trace!(service = request.service, path = ?request.path, "dispatching request");

    handlers.dispatch(&request).unwrap_or_else(|e| {
        warn!(service = request.service, error = %e, "request not served");
        message_router::build_error_reply(request.service, general_status::SERVICE_NOT_SUPPORTED)
    })
}

async fn send_reply(
    state: &mut SessionState,
    sink: &mut FrameSink,
    reply: &[u8],
    timeout_secs: u16,
) -> Result<()> {
    let (next, packet) = state.send(reply, false, timeout_secs, Instant::now())?;
    sink.send(packet).await?;
    *state = next;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cip::message_router::{service, CipPacket, CipPath, MessageRouterReply};

    fn table() -> ServiceTable {
        ServiceTable::new()
            .with_handler(service::GET_ATTRIBUTE_SINGLE, |_: &CipPacket| Some(vec![0xAA, 0xBB]))
    }

    #[test]
    fn test_respond_with_handler() {
        let path = CipPath::new(1, 1, 7).to_epath().unwrap();
        let request = message_router::build_request(service::GET_ATTRIBUTE_SINGLE, &path, &[]).unwrap();
        let reply = MessageRouterReply::parse(&respond(&table(), &request)).unwrap();
        assert_eq!(reply.service, 0x8E);
        assert_eq!(reply.status, 0);
        assert_eq!(&reply.data[..], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_respond_without_handler() {
        let path = CipPath::new(1, 1, 0).to_epath().unwrap();
        let request = message_router::build_request(service::GET_ATTRIBUTE_ALL, &path, &[]).unwrap();
        let reply = MessageRouterReply::parse(&respond(&table(), &request)).unwrap();
        assert_eq!(reply.service, 0x81);
        assert_eq!(reply.status, general_status::SERVICE_NOT_SUPPORTED);
    }

    #[test]
    fn test_respond_to_malformed_request() {
        // path claims 4 words but carries 2 bytes
        let reply = MessageRouterReply::parse(&respond(&table(), &[0x0E, 0x04, 0x20, 0x01])).unwrap();
        assert_eq!(reply.service, 0x8E);
        assert_eq!(reply.status, general_status::PATH_SEGMENT_ERROR);
    }
}
