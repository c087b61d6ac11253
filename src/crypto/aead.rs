//! AEAD sealing for KEM payloads
//!
//! Every `KEMenc` blob carries its plaintext under ChaCha20-Poly1305 keyed by
//! the freshly encapsulated shared secret. The key is never reused, so a fixed
//! all-zero nonce is sufficient.

use super::{CryptoError, KEY_LEN, NONCE_LEN, TAG_LEN};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};

/// Single-use AEAD cipher keyed by a KEM shared secret
pub struct PayloadCipher {
    key: LessSafeKey,
}

impl PayloadCipher {
    /// Create a new cipher from a 32-byte key
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::InvalidKeyLength);
        }
        let unbound_key =
            UnboundKey::new(&CHACHA20_POLY1305, key).map_err(|_| CryptoError::InvalidKeyLength)?;

        Ok(Self {
            key: LessSafeKey::new(unbound_key),
        })
    }

    /// Encrypt data, returning ciphertext with appended tag
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut buffer = Vec::with_capacity(plaintext.len() + TAG_LEN);
        buffer.extend_from_slice(plaintext);

        self.key
            .seal_in_place_append_tag(Self::nonce(), Aad::empty(), &mut buffer)
            .map_err(|_| CryptoError::Encryption("seal failed".to_string()))?;

        Ok(buffer)
    }

    /// Decrypt data, verifying the auth tag
    pub fn open(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut buffer = ciphertext.to_vec();

        let plaintext = self
            .key
            .open_in_place(Self::nonce(), Aad::empty(), &mut buffer)
            .map_err(|_| CryptoError::Decapsulation)?;

        Ok(plaintext.to_vec())
    }

    fn nonce() -> Nonce {
        Nonce::assume_unique_for_key([0u8; NONCE_LEN])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let key = [0x42u8; KEY_LEN];
        let cipher = PayloadCipher::new(&key).unwrap();

        let plaintext = b"security code";
        let sealed = cipher.seal(plaintext).unwrap();
        assert_eq!(sealed.len(), plaintext.len() + TAG_LEN);

        let opened = cipher.open(&sealed).unwrap();
        assert_eq!(&opened, plaintext);
    }

    #[test]
    fn test_tamper_detection() {
        let key = [0x42u8; KEY_LEN];
        let cipher = PayloadCipher::new(&key).unwrap();

        let mut sealed = cipher.seal(b"Hello, World!").unwrap();
        sealed[0] ^= 0xFF;

        assert!(matches!(cipher.open(&sealed), Err(CryptoError::Decapsulation)));
    }

    #[test]
    fn test_wrong_key_length() {
        assert!(PayloadCipher::new(&[0u8; 16]).is_err());
    }
}
