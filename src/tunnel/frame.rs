//! Frame encoding/decoding for the session data channel
//!
//! Frame format (plaintext, before the cascade):
//! ```text
//! +--------+--------+--------+--------+--------+
//! |  Kind  | Payload Len (2B)| Padding Len (2B)|
//! +--------+--------+--------+--------+--------+
//! |              Payload                       |
//! +--------+--------+--------+--------+--------+
//! |              Padding                       |
//! +--------+--------+--------+--------+--------+
//! |              Tag (8B)                      |
//! +--------+--------+--------+--------+--------+
//! ```
//!
//! `tag = HMAC(auth_key, direction || seq || kind || payload)[..8]`, where
//! `seq` counts frames per direction from zero.

use super::TunnelError;
use crate::crypto::{ct_eq, hmac_sha256};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use zeroize::Zeroizing;

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 5;

/// Truncated frame tag size
pub const FRAME_TAG_SIZE: usize = 8;

/// Maximum payload per frame (16 KiB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024;

/// Frame kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Relayed bytes
    Data = 0x00,
    /// Padding only, discarded after the tag check
    Decoy = 0x01,
    /// Sender's local side reached EOF
    Close = 0x02,
}

impl TryFrom<u8> for FrameType {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(FrameType::Data),
            0x01 => Ok(FrameType::Decoy),
            0x02 => Ok(FrameType::Close),
            _ => Err(TunnelError::InvalidFrame(format!(
                "Unknown frame type: {}",
                value
            ))),
        }
    }
}

/// Direction byte mixed into every frame tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameDirection {
    ClientToServer = 0,
    ServerToClient = 1,
}

/// Tags frames for one direction of one connection
pub struct FrameAuth {
    key: Zeroizing<[u8; 32]>,
    direction: FrameDirection,
}

impl FrameAuth {
    pub fn new(key: &[u8; 32], direction: FrameDirection) -> Self {
        Self {
            key: Zeroizing::new(*key),
            direction,
        }
    }

    pub fn direction(&self) -> FrameDirection {
        self.direction
    }

    fn tag(&self, seq: u64, kind: FrameType, payload: &[u8]) -> [u8; FRAME_TAG_SIZE] {
        let mac = hmac_sha256(
            &*self.key,
            &[&[self.direction as u8], &seq.to_be_bytes(), &[kind as u8], payload],
        );
        let mut tag = [0u8; FRAME_TAG_SIZE];
        tag.copy_from_slice(&mac[..FRAME_TAG_SIZE]);
        tag
    }
}

/// A data-channel frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Bytes,
    /// Random bytes appended after the payload
    pub padding_len: u16,
}

impl Frame {
    /// Create a data frame
    pub fn data(payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Data,
            payload,
            padding_len: 0,
        }
    }

    /// Create a decoy frame made only of padding
    pub fn decoy(padding_len: u16) -> Self {
        Self {
            frame_type: FrameType::Decoy,
            payload: Bytes::new(),
            padding_len,
        }
    }

    /// Create a close frame
    pub fn close() -> Self {
        Self {
            frame_type: FrameType::Close,
            payload: Bytes::new(),
            padding_len: 0,
        }
    }

    pub fn with_padding(mut self, padding_len: u16) -> Self {
        self.padding_len = padding_len;
        self
    }

    /// Encode frame `seq` to plaintext bytes
    pub fn encode(&self, auth: &FrameAuth, seq: u64) -> Result<BytesMut, TunnelError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(TunnelError::FrameTooLarge(payload_len, MAX_PAYLOAD_SIZE));
        }

        let mut buf = BytesMut::with_capacity(self.encoded_size());
        buf.put_u8(self.frame_type as u8);
        buf.put_u16(payload_len as u16);
        buf.put_u16(self.padding_len);
        buf.extend_from_slice(&self.payload);

        if self.padding_len > 0 {
            buf.extend_from_slice(&crate::obfuscation::random_padding(self.padding_len as usize));
        }

        buf.extend_from_slice(&auth.tag(seq, self.frame_type, &self.payload));
        Ok(buf)
    }

    /// Decode frame `seq` from plaintext bytes
    ///
    /// Returns `Ok(None)` until a whole frame is buffered.
    pub fn decode(buf: &mut BytesMut, auth: &FrameAuth, seq: u64) -> Result<Option<Self>, TunnelError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Peek at header to get lengths
        let frame_type = FrameType::try_from(buf[0])?;
        let payload_len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
        let padding_len = u16::from_be_bytes([buf[3], buf[4]]);

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(TunnelError::FrameTooLarge(payload_len, MAX_PAYLOAD_SIZE));
        }
        if frame_type != FrameType::Data && payload_len > 0 {
            return Err(TunnelError::InvalidFrame(format!(
                "{:?} frame with payload",
                frame_type
            )));
        }

        let total_len = FRAME_HEADER_SIZE + payload_len + padding_len as usize + FRAME_TAG_SIZE;
        if buf.len() < total_len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();
        buf.advance(padding_len as usize);
        let tag = buf.split_to(FRAME_TAG_SIZE);

        if !ct_eq(&auth.tag(seq, frame_type, &payload), &tag) {
            return Err(TunnelError::TagMismatch);
        }

        Ok(Some(Self {
            frame_type,
            payload,
            padding_len,
        }))
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len() + self.padding_len as usize + FRAME_TAG_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth(direction: FrameDirection) -> FrameAuth {
        FrameAuth::new(&[7u8; 32], direction)
    }

    #[test]
    fn test_frame_encode_decode() {
        let tx = auth(FrameDirection::ClientToServer);
        let original = Frame::data(Bytes::from_static(b"Hello, World!")).with_padding(100);
        let mut encoded = original.encode(&tx, 3).unwrap();
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE + 13 + 100 + FRAME_TAG_SIZE);

        let decoded = Frame::decode(&mut encoded, &tx, 3).unwrap().unwrap();
        assert_eq!(decoded.frame_type, FrameType::Data);
        assert_eq!(decoded.payload, original.payload);
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let tx = auth(FrameDirection::ServerToClient);
        let encoded = Frame::decoy(40).encode(&tx, 0).unwrap();

        let mut partial = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(Frame::decode(&mut partial, &tx, 0).unwrap().is_none());

        partial.extend_from_slice(&encoded[encoded.len() - 1..]);
        let frame = Frame::decode(&mut partial, &tx, 0).unwrap().unwrap();
        assert_eq!(frame.frame_type, FrameType::Decoy);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_tag_binds_seq_and_direction() {
        let tx = auth(FrameDirection::ClientToServer);
        let encoded = Frame::close().encode(&tx, 5).unwrap();

        let mut wrong_seq = encoded.clone();
        assert!(matches!(
            Frame::decode(&mut wrong_seq, &tx, 6),
            Err(TunnelError::TagMismatch)
        ));

        let mut wrong_dir = encoded.clone();
        assert!(matches!(
            Frame::decode(&mut wrong_dir, &auth(FrameDirection::ServerToClient), 5),
            Err(TunnelError::TagMismatch)
        ));
    }

    #[test]
    fn test_oversized_and_unknown_rejected() {
        let tx = auth(FrameDirection::ClientToServer);
        let big = Frame::data(Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE + 1]));
        assert!(matches!(big.encode(&tx, 0), Err(TunnelError::FrameTooLarge(..))));

        let mut unknown = BytesMut::from(&[9u8, 0, 0, 0, 0][..]);
        assert!(Frame::decode(&mut unknown, &tx, 0).is_err());
    }
}
