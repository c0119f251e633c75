//! Host address resolution

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use envoy_wire::HostId;
use tokio::net::lookup_host;

use crate::error::{MessengerError, MessengerResult};

/// Resolve `address` to one socket address, preferring IPv4.
pub(crate) async fn resolve(address: &str) -> MessengerResult<SocketAddr> {
    let resolved: Vec<SocketAddr> = lookup_host(address)
        .await
        .map_err(|e| MessengerError::Resolve {
            address: address.to_string(),
            reason: e.to_string(),
        })?
        .collect();

    resolved
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| resolved.first())
        .copied()
        .ok_or_else(|| MessengerError::Resolve {
            address: address.to_string(),
            reason: "no addresses found".to_string(),
        })
}

/// Host id for a resolved or bound address; a wildcard IP is reported as
/// loopback so that the id can be dialed.
pub(crate) fn host_id(addr: SocketAddr) -> HostId {
    let ip = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    HostId::new(SocketAddr::new(ip, addr.port()))
}

/// Resolve `address` straight to a host id
pub(crate) async fn resolve_host(address: &str) -> MessengerResult<HostId> {
    resolve(address).await.map(host_id)
}
