//! SOCKS5 negotiation (RFC 1928)
//!
//! Runs at the server end of a SOCKS5 tunnel: the client's local listener
//! forwards raw SOCKS5 bytes, so greeting, request and reply all travel
//! inside the encrypted channel. Only the no-auth method and CONNECT are
//! supported.

use super::{connect_target, Address, ProxyError, Whitelist};
use crate::transport::TransportConfig;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// SOCKS5 version
const SOCKS_VERSION: u8 = 0x05;

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum AuthMethod {
    NoAuth = 0x00,
    NoAcceptable = 0xFF,
}

/// SOCKS5 commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            _ => Err(ProxyError::UnsupportedCommand(value)),
        }
    }
}

/// Address types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum AddressType {
    Ipv4 = 0x01,
    Domain = 0x03,
    Ipv6 = 0x04,
}

impl TryFrom<u8> for AddressType {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(AddressType::Ipv4),
            0x03 => Ok(AddressType::Domain),
            0x04 => Ok(AddressType::Ipv6),
            _ => Err(ProxyError::UnsupportedAddressType(value)),
        }
    }
}

/// Reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl From<&ProxyError> for Reply {
    fn from(error: &ProxyError) -> Self {
        match error {
            ProxyError::NotAllowed(_) => Reply::ConnectionNotAllowed,
            ProxyError::ConnectionRefused => Reply::ConnectionRefused,
            ProxyError::HostUnreachable(_) => Reply::HostUnreachable,
            ProxyError::UnsupportedCommand(_) => Reply::CommandNotSupported,
            ProxyError::UnsupportedAddressType(_) => Reply::AddressTypeNotSupported,
            _ => Reply::GeneralFailure,
        }
    }
}

/// Read the greeting and CONNECT request, returning the target
///
/// Method selection is answered here. Request failures get their error
/// reply before the error is returned; success replies are left to the
/// caller, which knows the bound address.
pub async fn negotiate<S>(stream: &mut S) -> Result<Address, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    // Read greeting
    let mut buf = [0u8; 258];
    stream.read_exact(&mut buf[..2]).await?;

    if buf[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(buf[0]));
    }

    let nmethods = buf[1] as usize;
    stream.read_exact(&mut buf[..nmethods]).await?;

    let method = if buf[..nmethods].contains(&(AuthMethod::NoAuth as u8)) {
        AuthMethod::NoAuth
    } else {
        AuthMethod::NoAcceptable
    };
    stream.write_all(&[SOCKS_VERSION, method as u8]).await?;
    stream.flush().await?;

    if method == AuthMethod::NoAcceptable {
        return Err(ProxyError::AuthenticationFailed);
    }

    // Read request
    stream.read_exact(&mut buf[..4]).await?;

    if buf[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(buf[0]));
    }

    let command = buf[1];
    // buf[2] is reserved
    let addr_type = match AddressType::try_from(buf[3]) {
        Ok(t) => t,
        Err(e) => {
            send_reply(stream, Reply::AddressTypeNotSupported, None).await?;
            return Err(e);
        }
    };

    let address = match addr_type {
        AddressType::Ipv4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            Address::Ipv4(ip, stream.read_u16().await?)
        }
        AddressType::Domain => {
            stream.read_exact(&mut buf[..1]).await?;
            let len = buf[0] as usize;
            stream.read_exact(&mut buf[..len]).await?;
            let domain = String::from_utf8_lossy(&buf[..len]).to_string();
            Address::Domain(domain, stream.read_u16().await?)
        }
        AddressType::Ipv6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            Address::Ipv6(ip, stream.read_u16().await?)
        }
    };

    match Command::try_from(command) {
        Ok(Command::Connect) => {
            debug!("SOCKS5 CONNECT to {}", address);
            Ok(address)
        }
        Ok(Command::Bind | Command::UdpAssociate) | Err(_) => {
            send_reply(stream, Reply::CommandNotSupported, None).await?;
            Err(ProxyError::UnsupportedCommand(command))
        }
    }
}

/// Send a reply carrying `bound` (or 0.0.0.0:0)
pub async fn send_reply<S>(stream: &mut S, reply: Reply, bound: Option<SocketAddr>) -> Result<(), ProxyError>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![SOCKS_VERSION, reply as u8, 0x00];
    match bound {
        Some(SocketAddr::V6(addr)) => {
            buf.push(AddressType::Ipv6 as u8);
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
        Some(SocketAddr::V4(addr)) => {
            buf.push(AddressType::Ipv4 as u8);
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
        None => {
            buf.push(AddressType::Ipv4 as u8);
            buf.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        }
    }
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Negotiate SOCKS5 on `stream`, connect to the requested target and relay
/// until either side closes
pub async fn serve_socks5<S>(
    mut stream: S,
    whitelist: &Whitelist,
    config: &TransportConfig,
) -> Result<(u64, u64), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let address = negotiate(&mut stream).await?;

    let connected = if whitelist.allows(&address) {
        connect_target(&address, config).await
    } else {
        Err(ProxyError::NotAllowed(address.to_string()))
    };

    let mut target = match connected {
        Ok(target) => target,
        Err(e) => {
            send_reply(&mut stream, Reply::from(&e), None).await?;
            return Err(e);
        }
    };

    send_reply(&mut stream, Reply::Succeeded, target.local_addr().ok()).await?;
    let moved = tokio::io::copy_bidirectional(&mut stream, &mut target).await?;
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_request() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let server_task = tokio::spawn(async move { negotiate(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x03, 11];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let address = server_task.await.unwrap().unwrap();
        assert_eq!(address, Address::Domain("example.com".into(), 443));
    }

    #[tokio::test]
    async fn test_no_acceptable_method() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let server_task = tokio::spawn(async move { negotiate(&mut server).await });

        // Username/password only
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0xFF]);
        assert!(matches!(
            server_task.await.unwrap(),
            Err(ProxyError::AuthenticationFailed)
        ));
    }

    #[tokio::test]
    async fn test_bind_not_supported() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let server_task = tokio::spawn(async move { negotiate(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], Reply::CommandNotSupported as u8);
        assert!(server_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_whitelist_denies() {
        let (mut client, server) = tokio::io::duplex(1024);
        let whitelist = Whitelist::new(["allowed.example"]);
        let server_task = tokio::spawn(async move {
            serve_socks5(server, &whitelist, &TransportConfig::default()).await
        });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], Reply::ConnectionNotAllowed as u8);
        assert!(matches!(server_task.await.unwrap(), Err(ProxyError::NotAllowed(_))));
    }

    #[tokio::test]
    async fn test_serve_relays_to_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let (mut client, server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            serve_socks5(server, &Whitelist::default(), &TransportConfig::default()).await
        });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();

        let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        request.extend_from_slice(&target_addr.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], Reply::Succeeded as u8);

        client.write_all(b"echo").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"echo");
    }
}
