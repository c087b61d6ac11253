//! Encrypted data channel of one bound connection
//!
//! Each direction is a single cascade stream: the target header and every
//! frame are encrypted in order, so reader and writer keep their cascade and
//! frame sequence number for the life of the connection.

use super::frame::{Frame, FrameAuth, FrameDirection, FrameType, MAX_PAYLOAD_SIZE};
use super::target::MAX_TARGET_LEN;
use super::{TunnelError, TunnelTarget};
use crate::crypto::{CascadeCipher, Direction};
use crate::obfuscation::PaddingConfig;
use crate::protocol::{SessionId, SessionKeys};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

const READ_CHUNK: usize = 16 * 1024;

/// Which end of the tunnel a channel belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// Build the reader and writer for a connection bound to `id`
///
/// The client writes with the client cascade and reads with the server
/// cascade; the server the other way round.
pub fn open_channel<R, W>(
    side: Side,
    keys: &SessionKeys,
    id: &SessionId,
    reader: R,
    writer: W,
    padding: PaddingConfig,
) -> Result<(TunnelReader<R>, TunnelWriter<W>), TunnelError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (rx_cipher, tx_cipher, rx_dir, tx_dir) = match side {
        Side::Client => (
            keys.server_cascade(id, Direction::Decrypt)?,
            keys.client_cascade(id, Direction::Encrypt)?,
            FrameDirection::ServerToClient,
            FrameDirection::ClientToServer,
        ),
        Side::Server => (
            keys.client_cascade(id, Direction::Decrypt)?,
            keys.server_cascade(id, Direction::Encrypt)?,
            FrameDirection::ClientToServer,
            FrameDirection::ServerToClient,
        ),
    };

    let reader = TunnelReader {
        inner: reader,
        cipher: rx_cipher,
        auth: FrameAuth::new(id.auth_key(), rx_dir),
        seq: 0,
        buf: BytesMut::with_capacity(READ_CHUNK),
        eof: false,
    };
    let writer = TunnelWriter {
        inner: writer,
        cipher: tx_cipher,
        auth: FrameAuth::new(id.auth_key(), tx_dir),
        seq: 0,
        padding,
    };
    Ok((reader, writer))
}

/// Decrypting, frame-parsing half
pub struct TunnelReader<R> {
    inner: R,
    cipher: CascadeCipher,
    auth: FrameAuth,
    seq: u64,
    /// Decrypted bytes not yet consumed
    buf: BytesMut,
    eof: bool,
}

impl<R: AsyncRead + Unpin> TunnelReader<R> {
    /// Pull one more chunk from the socket; false at EOF
    async fn fill(&mut self) -> Result<bool, TunnelError> {
        if self.eof {
            return Ok(false);
        }
        let mut chunk = vec![0u8; READ_CHUNK];
        let n = self.inner.read(&mut chunk).await?;
        if n == 0 {
            self.eof = true;
            return Ok(false);
        }
        self.cipher.process(&mut chunk[..n]);
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(true)
    }

    async fn read_plain(&mut self, len: usize) -> Result<Bytes, TunnelError> {
        while self.buf.len() < len {
            if !self.fill().await? {
                return Err(TunnelError::Closed);
            }
        }
        Ok(self.buf.split_to(len).freeze())
    }

    /// Read the target header sent ahead of the first frame
    pub async fn read_target(&mut self) -> Result<TunnelTarget, TunnelError> {
        let kind = self.read_plain(1).await?[0];
        if !TunnelTarget::is_known_kind(kind) {
            return Err(TunnelError::InvalidTarget(format!("unknown kind {}", kind)));
        }
        if !TunnelTarget::needs_address(kind) {
            return Ok(TunnelTarget::Socks5);
        }

        let len = self.read_plain(2).await?;
        let len = u16::from_be_bytes([len[0], len[1]]) as usize;
        if len == 0 || len > MAX_TARGET_LEN {
            return Err(TunnelError::InvalidTarget(format!("target length {}", len)));
        }
        let raw = self.read_plain(len).await?;
        TunnelTarget::port_mapping(&raw)
    }

    /// Read the next frame; `None` on a clean EOF between frames
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, TunnelError> {
        loop {
            if let Some(frame) = Frame::decode(&mut self.buf, &self.auth, self.seq)? {
                self.seq += 1;
                trace!("Received {:?} frame, {} bytes", frame.frame_type, frame.payload.len());
                return Ok(Some(frame));
            }
            if !self.fill().await? {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(TunnelError::Closed)
                };
            }
        }
    }

    /// Next data payload, skipping decoys; `None` once the peer closed
    pub async fn read_data(&mut self) -> Result<Option<Bytes>, TunnelError> {
        while let Some(frame) = self.read_frame().await? {
            match frame.frame_type {
                FrameType::Data => return Ok(Some(frame.payload)),
                FrameType::Decoy => continue,
                FrameType::Close => return Ok(None),
            }
        }
        Ok(None)
    }
}

/// Framing, encrypting half
pub struct TunnelWriter<W> {
    inner: W,
    cipher: CascadeCipher,
    auth: FrameAuth,
    seq: u64,
    padding: PaddingConfig,
}

impl<W: AsyncWrite + Unpin> TunnelWriter<W> {
    async fn write_encrypted(&mut self, mut plain: BytesMut) -> Result<(), TunnelError> {
        self.cipher.process(&mut plain);
        self.inner.write_all(&plain).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Send the target header
    pub async fn send_target(&mut self, target: &TunnelTarget) -> Result<(), TunnelError> {
        let encoded = target.encode()?;
        self.write_encrypted(encoded).await
    }

    /// Encode, encrypt and send one frame
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), TunnelError> {
        let encoded = frame.encode(&self.auth, self.seq)?;
        self.seq += 1;
        trace!("Sending {:?} frame, {} bytes", frame.frame_type, encoded.len());
        self.write_encrypted(encoded).await
    }

    fn padding_len(&self) -> u16 {
        self.padding.frame_padding().min(u16::MAX as usize) as u16
    }

    /// Send `data` as one or more padded data frames
    pub async fn send_data(&mut self, data: &[u8]) -> Result<(), TunnelError> {
        for chunk in data.chunks(MAX_PAYLOAD_SIZE) {
            let frame = Frame::data(Bytes::copy_from_slice(chunk)).with_padding(self.padding_len());
            self.write_frame(&frame).await?;
        }
        Ok(())
    }

    /// Send a decoy frame of random size
    pub async fn send_decoy(&mut self) -> Result<(), TunnelError> {
        let len = self.padding_len().max(1);
        self.write_frame(&Frame::decoy(len)).await
    }

    /// Tell the peer our local side reached EOF
    pub async fn send_close(&mut self) -> Result<(), TunnelError> {
        let frame = Frame::close().with_padding(self.padding_len());
        self.write_frame(&frame).await
    }

    /// Shut down the underlying socket's write side
    pub async fn shutdown(&mut self) -> Result<(), TunnelError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
