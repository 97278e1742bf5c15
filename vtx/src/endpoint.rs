//! Endpoint parsing and address resolution.
//!
//! Endpoints take the form `scheme://host:port` where `host` is `"*"`
//! (wildcard), a dotted quad, or a DNS name. Hostnames resolve at peering
//! creation time. All formatting helpers return owned strings.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;

use crate::error::VtxError;

/// Wildcard host in endpoints: bind on any interface, connect by broadcast.
pub const WILDCARD: &str = "*";

/// A parsed `scheme://host:port` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn parse(text: &str) -> Result<Endpoint, VtxError> {
        let (scheme, rest) = text
            .split_once("://")
            .ok_or_else(|| VtxError::InvalidEndpoint(text.to_string()))?;
        if scheme.is_empty() {
            return Err(VtxError::InvalidEndpoint(text.to_string()));
        }
        let (host, port) = split_address(rest)?;
        Ok(Endpoint {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
        })
    }

    /// The `host:port` part, as it travels on the control mailbox.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_wildcard(&self) -> bool {
        self.host == WILDCARD
    }
}

/// Split `host:port`, validating the port.
pub fn split_address(address: &str) -> Result<(&str, u16), VtxError> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| VtxError::InvalidEndpoint(address.to_string()))?;
    if host.is_empty() {
        return Err(VtxError::InvalidEndpoint(address.to_string()));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| VtxError::InvalidEndpoint(address.to_string()))?;
    Ok((host, port))
}

/// Resolve `host:port` to an IPv4 socket address. DNS names go through the
/// system resolver.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, VtxError> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)));
    }
    (host, port)
        .to_socket_addrs()
        .map_err(|_| VtxError::InvalidEndpoint(format!("{host}:{port}")))?
        .find(|addr| addr.is_ipv4())
        .ok_or_else(|| VtxError::InvalidEndpoint(format!("{host}:{port}")))
}

/// Broadcast address of the first broadcast-capable, non-loopback
/// interface, falling back to the limited broadcast address.
pub fn broadcast(port: u16) -> SocketAddr {
    if let Ok(addrs) = getifaddrs() {
        for ifa in addrs {
            if !ifa.flags.contains(InterfaceFlags::IFF_BROADCAST)
                || ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK)
            {
                continue;
            }
            if let Some(bcast) = ifa.broadcast
                && let Some(sin) = bcast.as_sockaddr_in()
            {
                return SocketAddr::V4(SocketAddrV4::new(sin.ip(), port));
            }
        }
    }
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, port))
}

/// Format a socket address as the `n.n.n.n:port` peering key.
pub fn format_addr(addr: &SocketAddr) -> String {
    format!("{}:{}", addr.ip(), addr.port())
}

/// Host part of a `host:port` address, for sender metadata.
pub fn host_part(address: &str) -> &str {
    address.rsplit_once(':').map_or(address, |(host, _)| host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        let ep = Endpoint::parse("udp://127.0.0.1:32000").unwrap();
        assert_eq!(ep.scheme, "udp");
        assert_eq!(ep.host, "127.0.0.1");
        assert_eq!(ep.port, 32000);
        assert_eq!(ep.address(), "127.0.0.1:32000");
        assert!(!ep.is_wildcard());

        let ep = Endpoint::parse("tcp://*:9000").unwrap();
        assert!(ep.is_wildcard());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Endpoint::parse("udp//host:1").is_err());
        assert!(Endpoint::parse("://host:1").is_err());
        assert!(Endpoint::parse("udp://host").is_err());
        assert!(Endpoint::parse("udp://host:notaport").is_err());
        assert!(Endpoint::parse("udp://:1234").is_err());
    }

    #[test]
    fn test_resolve_dotted_quad() {
        let addr = resolve("127.0.0.1", 32000).unwrap();
        assert_eq!(format_addr(&addr), "127.0.0.1:32000");
    }

    #[test]
    fn test_resolve_localhost_name() {
        let addr = resolve("localhost", 80).unwrap();
        assert!(addr.is_ipv4());
    }

    #[test]
    fn test_host_part() {
        assert_eq!(host_part("192.168.0.9:32000"), "192.168.0.9");
        assert_eq!(host_part("naked"), "naked");
    }
}
