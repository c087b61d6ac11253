//! Tunnel layer - the session-bound data channel
//!
//! Provides:
//! - Frame encoding/decoding with per-frame tags
//! - Target header (SOCKS5 or port mapping)
//! - Cascade-encrypted reader/writer halves
//! - Relay between a channel and a local stream, with decoys and delays

mod channel;
mod frame;
mod relay;
mod target;

pub use channel::{open_channel, Side, TunnelReader, TunnelWriter};
pub use frame::{
    Frame, FrameAuth, FrameDirection, FrameType, FRAME_HEADER_SIZE, FRAME_TAG_SIZE,
    MAX_PAYLOAD_SIZE,
};
pub use relay::{relay, spawn_relay, RelayOptions, RelayStats};
pub use target::{TunnelTarget, MAX_TARGET_LEN};

use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Frame tag mismatch")]
    TagMismatch,

    #[error("Invalid tunnel target: {0}")]
    InvalidTarget(String),

    #[error("Tunnel closed")]
    Closed,

    #[error("Relay idle timeout")]
    IdleTimeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
}
