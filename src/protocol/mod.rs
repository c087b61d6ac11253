//! Handshake protocol and session key material
//!
//! The four-message handshake authenticates both peers without either side
//! naming itself on the wire:
//!
//! ```text
//! 1  C -> S  IV || mask(ephemeral client pub) || tag || tail
//! 2  S -> C  IV || mask(ephemeral server pub) || KEMenc(server offer) || KEMenc(server proof) || tag || tail
//! 3  C -> S  KEMenc(client offer || echoed server code || client code || timeout hint) || tag || tail
//! 4  S -> C  KEMenc(client code) || tag || tail
//! ```
//!
//! Completion yields [`SessionKeys`], from which both sides mint identical
//! sequences of single-use [`SessionId`]s for later connections.

mod driver;
mod handshake;
mod identity;
mod keys;
mod pool;

pub use driver::{run_handshake, HandshakeOptions};
pub use handshake::{
    tag_message, verify_message, ClientHandshake, HandshakeMachine, ServerHandshake, Step,
    CIPHER_ID_LEN, IV_LEN, IV_SEED_LEN, KEY_BLOB_LEN, MESSAGE1_LEN, MESSAGE2_LEN, MESSAGE3_LEN,
    MESSAGE4_LEN, MAX_TIMEOUT_HINT, SECURITY_CODE_LEN, TAG_LEN, TIMEOUT_HINT_LEN,
};
pub use identity::{parse_client_key, ClientId, ClientIdentity, ServerIdentity, CLIENT_ID_LEN};
pub use keys::{KeyMaterial, SessionId, SessionKeys, OPENER_LEN, SESSION_POOL, TOKEN_LEN};
pub use pool::CryptoPool;

#[cfg(test)]
pub(crate) use keys::{test_material, test_pair};

use thiserror::Error;

/// Handshake errors
///
/// None of these are ever reported to the peer; the connection is closed or
/// handed to the decoy responder instead.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("No registered identity matches the message tag")]
    UnknownIdentity,

    #[error("Message tag mismatch")]
    TagMismatch,

    #[error("Replayed handshake message")]
    ReplayDetected,

    #[error("Wrong handshake response")]
    WrongHandshakeResponse,

    #[error("Decode error: {0}")]
    Decode(&'static str),

    #[error("Handshake step called in state {0}")]
    InvalidState(&'static str),

    #[error("Handshake timed out")]
    Timeout,

    #[error("Crypto worker failed: {0}")]
    Worker(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
