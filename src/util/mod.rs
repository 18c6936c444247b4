//! Utility module
//!
//! Timeouts and host name resolution shared by the network layer.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tracing::debug;
use trust_dns_resolver::TokioAsyncResolver;

use crate::core::{Error, Result};

/// Runs `fut`, failing with [`Error::Timeout`] if it does not finish in `duration`
pub async fn with_timeout<T, F>(duration: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(format!(
            "{} did not complete within {:?}",
            what, duration
        ))),
    }
}

/// Resolves `host` to its first IPv4 address
///
/// Dotted-quad literals are returned as-is without touching the resolver.
pub async fn resolve_ipv4(host: &str) -> Result<Ipv4Addr> {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(addr)) => return Ok(addr),
        Ok(IpAddr::V6(addr)) => {
            return Err(Error::dns(format!("{} is not an IPv4 address", addr)));
        }
        Err(_) => {}
    }

    let resolver = TokioAsyncResolver::tokio_from_system_conf()
        .map_err(|e| Error::dns(format!("Failed to create resolver: {}", e)))?;
    let lookup = resolver
        .lookup_ip(host)
        .await
        .map_err(|e| Error::dns(format!("Failed to resolve {}: {}", host, e)))?;

    let addr = lookup
        .iter()
        .find_map(|ip| match ip {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| Error::dns(format!("No IPv4 address found for {}", host)))?;

    debug!(%host, %addr, "resolved host");
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout() {
        let value = with_timeout(Duration::from_secs(1), "ready", async { Ok(5) })
            .await
            .unwrap();
        assert_eq!(value, 5);

        let err = with_timeout(Duration::from_millis(10), "sleep", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Timeout(ref msg) if msg.starts_with("sleep")));
    }

    #[tokio::test]
    async fn test_with_timeout_passes_errors_through() {
        let err = with_timeout::<(), _>(Duration::from_secs(1), "failing", async {
            Err(Error::SessionNotEstablished)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::SessionNotEstablished));
    }

    #[tokio::test]
    async fn test_resolve_literal() {
        assert_eq!(resolve_ipv4("192.168.1.10").await.unwrap(), Ipv4Addr::new(192, 168, 1, 10));
        assert!(matches!(resolve_ipv4("::1").await, Err(Error::Dns(_))));
    }
}
