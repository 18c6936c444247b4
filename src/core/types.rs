use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for both roles
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Client-side settings
    #[serde(default)]
    pub originator: OriginatorConfig,
    /// Server-side settings
    #[serde(default)]
    pub server: ServerConfig,
}

/// Configuration for an originator (client) session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OriginatorConfig {
    /// TCP port of the target
    pub port: u16,
    /// Bound on TCP connect and on session registration
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub connect_timeout: Duration,
    /// Timeout field written into SendRRData, in seconds
    pub rr_timeout_secs: u16,
    /// TCP keepalive interval, disabled when absent
    #[serde(serialize_with = "super::serde::serialize_opt_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_opt_duration")]
    pub tcp_keepalive: Option<Duration>,
    /// Vendor id announced in connection manager requests
    pub vendor_id: u16,
    /// Serial number announced in connection manager requests
    pub originator_serial: u32,
    /// Capacity of the notification broadcast channel
    pub notification_capacity: usize,
}

impl Default for OriginatorConfig {
    fn default() -> Self {
        OriginatorConfig {
            port: super::EIP_PORT,
            connect_timeout: Duration::from_secs(10),
            rr_timeout_secs: 10,
            tcp_keepalive: Some(Duration::from_secs(30)),
            vendor_id: super::DEFAULT_VENDOR_ID,
            originator_serial: super::DEFAULT_ORIGINATOR_SERIAL,
            notification_capacity: 64,
        }
    }
}

/// Configuration for a target (server)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Local address to listen on
    pub bind_addr: SocketAddr,
    /// Timeout field written into SendRRData replies, in seconds
    pub reply_timeout_secs: u16,
    /// Capacity of the notification broadcast channel
    pub notification_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], super::EIP_PORT)),
            reply_timeout_secs: 50,
            notification_capacity: 64,
        }
    }
}

impl Config {
    /// Checks values that serde alone cannot reject
    pub fn validate(&self) -> super::Result<()> {
        if self.originator.connect_timeout.is_zero() {
            return Err(super::Error::config("connect_timeout must be non-zero"));
        }
        if self.originator.vendor_id == 0 || self.originator.originator_serial == 0 {
            return Err(super::Error::config("vendor_id and originator_serial must be non-zero"));
        }
        if self.originator.notification_capacity == 0 || self.server.notification_capacity == 0 {
            return Err(super::Error::config("notification_capacity must be non-zero"));
        }
        Ok(())
    }
}
