//! Transport layer
//!
//! Provides:
//! - TCP connect with timeout and TCP_NODELAY
//! - TLS: server acceptor (PEM or self-signed) and client connector
//! - `PrefixedStream`, which replays bytes already read while classifying
//! - `HeldStream`, which keeps a socket open after its wrappers are dropped
//! - Server URLs (`tcp://host:port`, `tls://host:port`)

mod held;
mod prefixed;
mod tcp;
mod tls;

pub use held::HeldStream;
pub use prefixed::PrefixedStream;
pub use tcp::{connect_tcp, configure_tcp};
pub use tls::{looks_like_tls, TlsClient, TlsServer, DEFAULT_ALPN};

use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout")]
    Timeout,
}

/// Any bidirectional byte stream the tunnel can run over
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Type-erased connection (plain TCP or TLS)
pub type BoxedStream = Box<dyn AsyncStream>;

/// Transport configuration
#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    /// Set TCP_NODELAY on new sockets
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            nodelay: true,
        }
    }
}

/// How a client reaches a server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Tls,
}

/// A server endpoint, `tcp://host:port` or `tls://host:port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUrl {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl ServerUrl {
    /// `host:port`, suitable for `TcpStream::connect`
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Open a connection, wrapping it in TLS for `tls://` URLs
    pub async fn connect(
        &self,
        config: &TransportConfig,
        tls: &TlsClient,
    ) -> Result<BoxedStream, TransportError> {
        let tcp = connect_tcp(&self.address(), config).await?;
        match self.scheme {
            Scheme::Tcp => Ok(Box::new(tcp)),
            Scheme::Tls => {
                let stream = tokio::time::timeout(config.connect_timeout, tls.connect(&self.host, tcp))
                    .await
                    .map_err(|_| TransportError::Timeout)??;
                Ok(Box::new(stream))
            }
        }
    }
}

impl FromStr for ServerUrl {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransportError::InvalidUrl(s.to_string());

        let (scheme, rest) = s.split_once("://").ok_or_else(invalid)?;
        let scheme = match scheme {
            "tcp" => Scheme::Tcp,
            "tls" => Scheme::Tls,
            _ => return Err(invalid()),
        };

        let rest = rest.trim_end_matches('/');
        let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for ServerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            Scheme::Tcp => "tcp",
            Scheme::Tls => "tls",
        };
        write!(f, "{}://{}", scheme, self.address())
    }
}
