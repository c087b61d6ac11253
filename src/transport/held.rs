//! Socket shared between a connection handler and its owner
//!
//! Classification wraps, rewinds and sometimes TLS-wraps the raw socket, and
//! may be cancelled halfway through by a timeout. A `HeldStream` keeps the
//! socket itself in a shared slot, so dropping a wrapper never closes the
//! connection: the owner takes it back with [`HeldStream::take`] and decides
//! when it goes.

use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub struct HeldStream<S> {
    slot: Arc<Mutex<Option<S>>>,
}

impl<S> HeldStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(inner))),
        }
    }

    /// Another handle on the same socket
    pub fn handle(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }

    /// Remove the socket; every handle reads EOF afterwards
    pub fn take(&self) -> Option<S> {
        self.slot.lock().take()
    }
}

fn released() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stream released")
}

impl<S: AsyncRead + Unpin> AsyncRead for HeldStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.slot.lock().as_mut() {
            Some(inner) => Pin::new(inner).poll_read(cx, buf),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for HeldStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.slot.lock().as_mut() {
            Some(inner) => Pin::new(inner).poll_write(cx, buf),
            None => Poll::Ready(Err(released())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.slot.lock().as_mut() {
            Some(inner) => Pin::new(inner).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.slot.lock().as_mut() {
            Some(inner) => Pin::new(inner).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_dropped_handle_keeps_socket_open() {
        let (mut peer, ours) = tokio::io::duplex(64);
        let held = HeldStream::new(ours);

        let mut handle = held.handle();
        handle.write_all(b"hi").await.unwrap();
        drop(handle);

        let mut buf = [0u8; 2];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        // Still open: the peer's write lands in the held socket
        peer.write_all(b"ok").await.unwrap();
        let mut inner = HeldStream::take(&held).unwrap();
        inner.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    }

    #[tokio::test]
    async fn test_taken_socket_releases_handles() {
        let (_peer, ours) = tokio::io::duplex(64);
        let held = HeldStream::new(ours);
        let mut handle = held.handle();
        assert!(HeldStream::take(&held).is_some());
        assert!(HeldStream::take(&held).is_none());

        let mut buf = [0u8; 1];
        assert_eq!(handle.read(&mut buf).await.unwrap(), 0);
        assert!(handle.write_all(b"x").await.is_err());
    }
}
