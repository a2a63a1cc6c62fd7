//! Address and destination types for network flows

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Network type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl Default for Network {
    fn default() -> Self {
        Network::Tcp
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// Host part of a destination: an IP literal or a domain name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ip(IpAddr),
    Domain(String),
}

impl Address {
    /// Parse a host string: IP literal when it parses as one, domain otherwise
    pub fn parse(host: &str) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => Address::Ip(ip),
            Err(_) => Address::Domain(host.to_string()),
        }
    }

    pub fn is_domain(&self) -> bool {
        matches!(self, Address::Domain(_))
    }

    pub fn as_ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ip(ip) => Some(*ip),
            Address::Domain(_) => None,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Ip(ip) => write!(f, "{}", ip),
            Address::Domain(domain) => write!(f, "{}", domain),
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        Address::Ip(ip)
    }
}

impl From<&str> for Address {
    fn from(host: &str) -> Self {
        Address::parse(host)
    }
}

/// A fully specified flow destination: network, host and port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub network: Network,
    pub address: Address,
    pub port: u16,
}

impl Destination {
    pub fn tcp(address: impl Into<Address>, port: u16) -> Self {
        Self {
            network: Network::Tcp,
            address: address.into(),
            port,
        }
    }

    pub fn udp(address: impl Into<Address>, port: u16) -> Self {
        Self {
            network: Network::Udp,
            address: address.into(),
            port,
        }
    }

    pub fn from_socket_addr(network: Network, addr: SocketAddr) -> Self {
        Self {
            network,
            address: Address::Ip(addr.ip()),
            port: addr.port(),
        }
    }

    /// A destination is dispatchable only with a known network and a
    /// non-zero port.
    pub fn is_valid(&self) -> bool {
        self.port != 0
    }

    /// Socket address of an IP destination; `None` for domains.
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.address.as_ip().map(|ip| SocketAddr::new(ip, self.port))
    }

    /// `host:port` rendering used for session metadata.
    pub fn net_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Shared sentinel used by the UDP multiplexer when the inbound carries
    /// no usable source address. Port 0 can never be a real source, so the
    /// sentinel cannot collide with live entries.
    pub fn udp_any() -> Self {
        Destination::udp(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.network, self.address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parse() {
        assert_eq!(
            Address::parse("1.2.3.4"),
            Address::Ip("1.2.3.4".parse().unwrap())
        );
        assert_eq!(
            Address::parse("example.com"),
            Address::Domain("example.com".to_string())
        );
    }

    #[test]
    fn test_destination_validity() {
        assert!(Destination::tcp("example.com", 443).is_valid());
        assert!(!Destination::tcp("example.com", 0).is_valid());
        assert!(!Destination::udp_any().is_valid());
    }

    #[test]
    fn test_udp_addr() {
        let dest = Destination::udp("8.8.8.8", 53);
        assert_eq!(dest.udp_addr(), Some("8.8.8.8:53".parse().unwrap()));
        assert_eq!(Destination::udp("dns.example", 53).udp_addr(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Destination::tcp("example.com", 80).to_string(),
            "tcp:example.com:80"
        );
        assert_eq!(Destination::tcp("example.com", 80).net_addr(), "example.com:80");
    }
}
