//! Tunnel target header
//!
//! The first encrypted bytes a client sends on a bound connection name what
//! the tunnel is for: `1` for SOCKS5 (negotiated inside the tunnel), or `2`
//! followed by `u16 len || "host:port"` for a fixed port mapping.

use super::TunnelError;
use bytes::{BufMut, BytesMut};

const KIND_SOCKS5: u8 = 1;
const KIND_PORT_MAPPING: u8 = 2;

/// Longest accepted `host:port` string
pub const MAX_TARGET_LEN: usize = 1024;

/// What a bound tunnel connection carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelTarget {
    /// SOCKS5 negotiation runs at the server end
    Socks5,
    /// Fixed destination, `host:port`
    PortMapping(String),
}

impl TunnelTarget {
    pub fn encode(&self) -> Result<BytesMut, TunnelError> {
        let mut buf = BytesMut::new();
        match self {
            TunnelTarget::Socks5 => buf.put_u8(KIND_SOCKS5),
            TunnelTarget::PortMapping(target) => {
                if target.is_empty() || target.len() > MAX_TARGET_LEN {
                    return Err(TunnelError::InvalidTarget(format!(
                        "target length {}",
                        target.len()
                    )));
                }
                buf.put_u8(KIND_PORT_MAPPING);
                buf.put_u16(target.len() as u16);
                buf.extend_from_slice(target.as_bytes());
            }
        }
        Ok(buf)
    }

    /// Kind byte of an encoded target
    pub(crate) fn is_known_kind(kind: u8) -> bool {
        matches!(kind, KIND_SOCKS5 | KIND_PORT_MAPPING)
    }

    pub(crate) fn needs_address(kind: u8) -> bool {
        kind == KIND_PORT_MAPPING
    }

    pub(crate) fn port_mapping(raw: &[u8]) -> Result<Self, TunnelError> {
        let target = std::str::from_utf8(raw)
            .map_err(|_| TunnelError::InvalidTarget("target is not UTF-8".into()))?;
        Ok(TunnelTarget::PortMapping(target.to_string()))
    }
}

impl std::fmt::Display for TunnelTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelTarget::Socks5 => write!(f, "socks5"),
            TunnelTarget::PortMapping(target) => write!(f, "port-mapping {}", target),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding() {
        assert_eq!(&TunnelTarget::Socks5.encode().unwrap()[..], &[1]);

        let encoded = TunnelTarget::PortMapping("example.com:22".into()).encode().unwrap();
        assert_eq!(encoded[0], 2);
        assert_eq!(u16::from_be_bytes([encoded[1], encoded[2]]), 14);
        assert_eq!(&encoded[3..], b"example.com:22");
    }

    #[test]
    fn test_invalid_targets() {
        assert!(TunnelTarget::PortMapping(String::new()).encode().is_err());
        assert!(TunnelTarget::port_mapping(&[0xff, 0xfe]).is_err());
        assert!(!TunnelTarget::is_known_kind(3));
    }
}
