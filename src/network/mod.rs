//! TCP transport
//!
//! Actors that own one socket each and drive a [`SessionState`] from socket
//! and caller events: the [`Originator`] client, and the [`Server`] which
//! runs a target actor per accepted connection.
//!
//! [`SessionState`]: crate::protocol::SessionState

mod originator;
mod server;
mod target;

pub use self::originator::Originator;
pub use self::server::Server;

use std::time::Duration;

use bytes::Bytes;
use futures::stream::SplitSink;
use futures::SinkExt;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::warn;

use crate::core::{Error, Result};
use crate::protocol::{Effect, EncapsulationCodec, Notification};

type FrameSink = SplitSink<Framed<TcpStream, EncapsulationCodec>, Bytes>;

/// Applies socket options to a freshly connected or accepted stream
fn configure_stream(stream: &TcpStream, keepalive: Option<Duration>) -> Result<()> {
    stream
        .set_nodelay(true)
        .map_err(|e| Error::network(format!("Failed to set TCP_NODELAY: {}", e)))?;

    if let Some(time) = keepalive {
        SockRef::from(stream)
            .set_tcp_keepalive(&TcpKeepalive::new().with_time(time))
            .map_err(|e| Error::network(format!("Failed to set keepalive: {}", e)))?;
    }
    Ok(())
}

/// Carries out the effects of one transition
///
/// Returns `false` once the socket should be closed.
async fn apply_effects(
    effects: Vec<Effect>,
    sink: &mut FrameSink,
    publish: &mut impl FnMut(Notification),
) -> Result<bool> {
    let mut keep_open = true;
    for effect in effects {
        match effect {
            Effect::Notify(notification) => publish(notification),
            Effect::Write(packet) => {
                if let Err(e) = sink.send(packet).await {
                    warn!(error = %e, "write failed");
                    return Err(e);
                }
            }
            Effect::Shutdown => keep_open = false,
        }
    }
    Ok(keep_open)
}
