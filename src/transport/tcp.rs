//! Raw TCP connections

use super::{TransportConfig, TransportError};
use tokio::net::TcpStream;
use tracing::trace;

/// Apply socket options to a new connection
pub fn configure_tcp(stream: &TcpStream, config: &TransportConfig) {
    if config.nodelay {
        stream.set_nodelay(true).ok();
    }
}

/// Connect to `addr` within the configured timeout
pub async fn connect_tcp(addr: &str, config: &TransportConfig) -> Result<TcpStream, TransportError> {
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", addr, e)))?;

    configure_tcp(&stream, config);
    trace!("Connected to {}", addr);
    Ok(stream)
}
