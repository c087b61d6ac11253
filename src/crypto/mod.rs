//! Cryptographic primitives for Shade Tunnel
//!
//! This module provides:
//! - ML-KEM-768 key encapsulation with an AEAD payload (`KEMenc`/`KEMdec`)
//! - The fixed registry of symmetric primitives and their cascade composition
//! - The combination catalog shared by both peers
//! - HMAC-SHA256 / SHA-256 helpers and deterministic generators
//! - Secure random number generation

mod aead;
mod cascade;
mod catalog;
mod drbg;
mod kem;
mod mac;
mod rc6;
mod registry;

pub use aead::PayloadCipher;
pub use cascade::CascadeCipher;
pub use catalog::{Catalog, Combination, MAX_CASCADE_LEN};
pub use drbg::DeterministicRng;
pub use kem::{
    kem_ciphertext_len, KemKeyPair, KemPublicKey, KEM_CIPHERTEXT_LEN, KEM_OVERHEAD,
    KEM_PUBLIC_KEY_LEN,
};
pub use mac::{ct_eq, hmac_sha256, sha256, tag_id, MAC_LEN};
pub use rc6::{Rc6, Rc6Wide};
pub use registry::{Direction, Engine, Family, Primitive, MAX_IV_FOOTPRINT, MAX_KEY_FOOTPRINT};

use thiserror::Error;

/// Length of symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decapsulation failed")]
    Decapsulation,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Cipher setup failed for {0}")]
    CipherSetup(&'static str),
}

/// Generate cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).expect("Failed to generate random bytes");
}

/// Generate a fixed-size array of random bytes
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    random_bytes(&mut out);
    out
}
