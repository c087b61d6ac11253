//! Random padding for handshake and data frames

use rand::Rng;

/// Largest handshake tail
pub const MAX_HANDSHAKE_TAIL: usize = 5000;

/// Default bound on data-frame padding
pub const DEFAULT_MAX_PADDING: usize = 5000;

/// Tail length of a handshake message, read from bits 64..80 of its MAC
///
/// Both ends compute it from the same MAC, so the receiver knows how many
/// bytes to discard without a length field on the wire.
pub fn handshake_tail_len(mac: &[u8; 32]) -> usize {
    u16::from_be_bytes([mac[8], mac[9]]) as usize % (MAX_HANDSHAKE_TAIL + 1)
}

/// `len` random bytes
pub fn random_padding(len: usize) -> Vec<u8> {
    let mut padding = vec![0u8; len];
    rand::thread_rng().fill(&mut padding[..]);
    padding
}

/// Padding configuration for data frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaddingConfig {
    /// Padding per frame is drawn uniformly from `0..=max_padding`
    pub max_padding: usize,
}

impl Default for PaddingConfig {
    fn default() -> Self {
        Self {
            max_padding: DEFAULT_MAX_PADDING,
        }
    }
}

impl PaddingConfig {
    pub fn disabled() -> Self {
        Self { max_padding: 0 }
    }

    /// Draw the padding length for one frame
    pub fn frame_padding(&self) -> usize {
        if self.max_padding == 0 {
            return 0;
        }
        rand::thread_rng().gen_range(0..=self.max_padding)
    }
}
