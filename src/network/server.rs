use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::cip::ServiceTable;
use crate::core::{Error, Result, ServerConfig};
use crate::protocol::Notification;

use super::configure_stream;
use super::target::run_target;

/// EtherNet/IP target listening for originators
///
/// Each accepted connection gets its own target task and session handle.
/// Notifications from every connection are published tagged with the peer
/// address.
pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    handlers: Arc<ServiceTable>,
    notify: broadcast::Sender<(SocketAddr, Notification)>,
    next_handle: u32,
}

impl Server {
    /// Binds the listening socket
    pub async fn bind(config: ServerConfig, handlers: ServiceTable) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|e| Error::network(format!("Failed to bind {}: {}", config.bind_addr, e)))?;
        let (notify, _) = broadcast::channel(config.notification_capacity.max(1));

        Ok(Server {
            config,
            listener,
            handlers: Arc::new(handlers),
            notify,
            next_handle: 1,
        })
    }

    /// Returns the local socket address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| Error::network(format!("Failed to get local address: {}", e)))
    }

    /// Receiver for notifications from all connections
    pub fn subscribe(&self) -> broadcast::Receiver<(SocketAddr, Notification)> {
        self.notify.subscribe()
    }

    /// Accepts connections until the listener fails
    pub async fn run(mut self) -> Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), "target listening");

        loop {
            let (stream, peer) = self
                .listener
                .accept()
                .await
                .map_err(|e| Error::network(format!("Failed to accept connection: {}", e)))?;

            if let Err(e) = configure_stream(&stream, None) {
                warn!(%peer, error = %e, "rejecting connection");
                continue;
            }

            let handle = self.allocate_handle();
            info!(%peer, handle, "accepted connection");
            tokio::spawn(run_target(
                stream,
                peer,
                handle,
                Arc::clone(&self.handlers),
                self.notify.clone(),
                self.config.reply_timeout_secs,
            ));
        }
    }

    /// Next session handle; zero is never handed out
    fn allocate_handle(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        handle
    }
}
