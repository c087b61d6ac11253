//! Destinations reached through the tunnel
//!
//! Provides:
//! - SOCKS5 negotiation (RFC 1928), run by the server inside a bound tunnel
//! - Target addresses and the destination whitelist
//! - Outbound connects with errors mapped to SOCKS5 reply codes

mod socks5;

pub use socks5::{negotiate, send_reply, serve_socks5, Reply};

use crate::transport::{configure_tcp, TransportConfig};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid SOCKS version: {0}")]
    InvalidSocksVersion(u8),

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("Address type not supported: {0}")]
    UnsupportedAddressType(u8),

    #[error("No acceptable authentication method")]
    AuthenticationFailed,

    #[error("Destination not allowed: {0}")]
    NotAllowed(String),

    #[error("Connection refused")]
    ConnectionRefused,

    #[error("Host unreachable: {0}")]
    HostUnreachable(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// Proxy target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address and port
    Ipv4([u8; 4], u16),
    /// IPv6 address and port
    Ipv6([u8; 16], u16),
    /// Domain name and port
    Domain(String, u16),
}

impl Address {
    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(_, port) => *port,
            Address::Ipv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }

    /// Host part without brackets or port
    pub fn host(&self) -> String {
        match self {
            Address::Ipv4(ip, _) => Ipv4Addr::from(*ip).to_string(),
            Address::Ipv6(ip, _) => Ipv6Addr::from(*ip).to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Ipv6(..) => write!(f, "[{}]:{}", self.host(), self.port()),
            _ => write!(f, "{}:{}", self.host(), self.port()),
        }
    }
}

impl FromStr for Address {
    type Err = ProxyError;

    /// Parse `host:port`, with IPv6 hosts in brackets
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProxyError::InvalidAddress(s.to_string());
        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }

        Ok(match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => Address::Ipv4(ip.octets(), port),
            Ok(IpAddr::V6(ip)) => Address::Ipv6(ip.octets(), port),
            Err(_) => Address::Domain(host.to_string(), port),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct WhitelistEntry {
    host: String,
    port: Option<u16>,
}

/// Destinations the server may connect to
///
/// Entries are `host` (any port) or `host:port`; an empty list allows
/// everything. Hosts compare case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    entries: Vec<WhitelistEntry>,
}

impl Whitelist {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries = entries
            .into_iter()
            .filter_map(|entry| Self::parse_entry(entry.as_ref().trim()))
            .collect();
        Self { entries }
    }

    fn parse_entry(entry: &str) -> Option<WhitelistEntry> {
        if entry.is_empty() {
            return None;
        }
        let bracketed = entry.starts_with('[');
        let with_port = if bracketed {
            entry.contains("]:")
        } else {
            entry.matches(':').count() == 1
        };

        if with_port {
            if let Some((host, port)) = entry.rsplit_once(':') {
                if let Ok(port) = port.parse::<u16>() {
                    return Some(WhitelistEntry {
                        host: host.trim_start_matches('[').trim_end_matches(']').to_lowercase(),
                        port: Some(port),
                    });
                }
            }
        }
        Some(WhitelistEntry {
            host: entry.trim_start_matches('[').trim_end_matches(']').to_lowercase(),
            port: None,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `address` may be reached
    pub fn allows(&self, address: &Address) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        let host = address.host().to_lowercase();
        self.entries
            .iter()
            .any(|e| e.host == host && e.port.map_or(true, |p| p == address.port()))
    }
}

/// Connect to a proxy target
pub async fn connect_target(address: &Address, config: &TransportConfig) -> Result<TcpStream, ProxyError> {
    let target = address.to_string();
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&target))
        .await
        .map_err(|_| ProxyError::HostUnreachable(format!("{}: timed out", target)))?
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::ConnectionRefused => ProxyError::ConnectionRefused,
            _ => ProxyError::HostUnreachable(format!("{}: {}", target, e)),
        })?;
    configure_tcp(&stream, config);
    Ok(stream)
}

/// Connect a port-mapping tunnel to its fixed target and relay until
/// either side closes
pub async fn serve_port_mapping<S>(
    mut stream: S,
    target: &str,
    whitelist: &Whitelist,
    config: &TransportConfig,
) -> Result<(u64, u64), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let address: Address = target.parse()?;
    if !whitelist.allows(&address) {
        return Err(ProxyError::NotAllowed(address.to_string()));
    }
    let mut remote = connect_target(&address, config).await?;
    debug!("Port mapping connected to {}", address);
    Ok(tokio::io::copy_bidirectional(&mut stream, &mut remote).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_addresses() {
        assert_eq!(
            "10.0.0.1:80".parse::<Address>().unwrap(),
            Address::Ipv4([10, 0, 0, 1], 80)
        );
        let v6: Address = "[::1]:443".parse().unwrap();
        assert_eq!(v6.to_string(), "[::1]:443");
        assert_eq!(
            "Example.com:22".parse::<Address>().unwrap(),
            Address::Domain("Example.com".into(), 22)
        );
        assert!("example.com".parse::<Address>().is_err());
        assert!(":80".parse::<Address>().is_err());
    }

    #[test]
    fn test_whitelist() {
        let open = Whitelist::default();
        assert!(open.allows(&"anything.net:1".parse().unwrap()));

        let list = Whitelist::new(["example.com", "10.0.0.1:22", "[::1]:8080", ""]);
        assert!(list.allows(&"EXAMPLE.com:443".parse().unwrap()));
        assert!(list.allows(&"example.com:80".parse().unwrap()));
        assert!(list.allows(&"10.0.0.1:22".parse().unwrap()));
        assert!(!list.allows(&"10.0.0.1:23".parse().unwrap()));
        assert!(list.allows(&"[::1]:8080".parse().unwrap()));
        assert!(!list.allows(&"other.org:443".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_port_mapping_whitelist() {
        let (_client, server) = tokio::io::duplex(64);
        let whitelist = Whitelist::new(["db.internal:5432"]);
        let result =
            serve_port_mapping(server, "127.0.0.1:5432", &whitelist, &TransportConfig::default()).await;
        assert!(matches!(result, Err(ProxyError::NotAllowed(_))));
    }
}
