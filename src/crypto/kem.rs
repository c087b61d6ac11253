//! ML-KEM-768 key pairs and `KEMenc`/`KEMdec`
//!
//! The handshake needs public-key *encryption* of fixed-size payloads. Each
//! call encapsulates a fresh shared secret to the recipient and seals the
//! payload under it, so the output is always
//! `KEM_CIPHERTEXT_LEN + plaintext.len() + TAG_LEN` bytes.

use super::{sha256, CryptoError, PayloadCipher, TAG_LEN};
use ml_kem::kem::{Decapsulate, DecapsulationKey, Encapsulate, EncapsulationKey};
use ml_kem::{Ciphertext, Encoded, EncodedSizeUser, KemCore, MlKem768, MlKem768Params, B32};
use rand::rngs::OsRng;
use std::fmt;
use zeroize::Zeroizing;

/// Encoded ML-KEM-768 encapsulation key length
pub const KEM_PUBLIC_KEY_LEN: usize = 1184;

/// ML-KEM-768 ciphertext length
pub const KEM_CIPHERTEXT_LEN: usize = 1088;

/// Bytes added by `KEMenc` on top of the plaintext
pub const KEM_OVERHEAD: usize = KEM_CIPHERTEXT_LEN + TAG_LEN;

type Ek = EncapsulationKey<MlKem768Params>;
type Dk = DecapsulationKey<MlKem768Params>;

/// Size of `KEMenc` output for a plaintext of `plaintext_len` bytes
pub const fn kem_ciphertext_len(plaintext_len: usize) -> usize {
    KEM_OVERHEAD + plaintext_len
}

/// ML-KEM-768 public (encapsulation) key
#[derive(Clone, PartialEq, Eq)]
pub struct KemPublicKey(Vec<u8>);

impl KemPublicKey {
    /// Create from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEM_PUBLIC_KEY_LEN {
            return Err(CryptoError::InvalidKeyLength);
        }
        Ok(Self(bytes.to_vec()))
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// SHA-256 of the encoded key
    pub fn fingerprint(&self) -> [u8; 32] {
        sha256(&[&self.0])
    }

    /// Encrypt `plaintext` to this key (`KEMenc`)
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let encoded = Encoded::<Ek>::try_from(self.0.as_slice())
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        let ek = Ek::from_bytes(&encoded);

        let (ct, shared) = ek
            .encapsulate(&mut OsRng)
            .map_err(|_| CryptoError::Encryption("encapsulation failed".to_string()))?;

        let sealed = PayloadCipher::new(shared.as_slice())?.seal(plaintext)?;

        let mut out = Vec::with_capacity(kem_ciphertext_len(plaintext.len()));
        out.extend_from_slice(ct.as_slice());
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(&self.0)
    }

    /// Decode from base64
    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s.trim())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Debug for KemPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KemPublicKey({}...)", &self.to_base64()[..8])
    }
}

/// ML-KEM-768 key pair
///
/// The decapsulation key is held only in encoded form and is zeroed on drop.
#[derive(Clone)]
pub struct KemKeyPair {
    public: KemPublicKey,
    secret: Zeroizing<Vec<u8>>,
}

impl KemKeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let (dk, ek) = MlKem768::generate(&mut OsRng);
        Self::from_parts(&dk, &ek)
    }

    /// Derive a key pair deterministically from a 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let d = B32::from(sha256(&[b"shade-kem-d", seed]));
        let z = B32::from(sha256(&[b"shade-kem-z", seed]));
        let (dk, ek) = MlKem768::generate_deterministic(&d, &z);
        Self::from_parts(&dk, &ek)
    }

    fn from_parts(dk: &Dk, ek: &Ek) -> Self {
        Self {
            public: KemPublicKey(ek.as_bytes().as_slice().to_vec()),
            secret: Zeroizing::new(dk.as_bytes().as_slice().to_vec()),
        }
    }

    /// Public half of the pair
    pub fn public(&self) -> &KemPublicKey {
        &self.public
    }

    /// Decrypt a `KEMenc` blob (`KEMdec`)
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if ciphertext.len() < KEM_OVERHEAD {
            return Err(CryptoError::Decapsulation);
        }
        let (ct, sealed) = ciphertext.split_at(KEM_CIPHERTEXT_LEN);

        let encoded = Encoded::<Dk>::try_from(self.secret.as_slice())
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        let dk = Dk::from_bytes(&encoded);

        let ct = Ciphertext::<MlKem768>::try_from(ct).map_err(|_| CryptoError::Decapsulation)?;
        let shared = dk.decapsulate(&ct).map_err(|_| CryptoError::Decapsulation)?;

        let plaintext = PayloadCipher::new(shared.as_slice())?.open(sealed)?;
        Ok(Zeroizing::new(plaintext))
    }
}

impl fmt::Debug for KemKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KemKeyPair")
            .field("public", &self.public)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let kp = KemKeyPair::generate();
        assert_eq!(kp.public().as_bytes().len(), KEM_PUBLIC_KEY_LEN);
    }

    #[test]
    fn test_encrypt_decrypt() {
        let kp = KemKeyPair::generate();
        let ct = kp.public().encrypt(b"ephemeral material").unwrap();
        assert_eq!(ct.len(), kem_ciphertext_len(18));

        let pt = kp.decrypt(&ct).unwrap();
        assert_eq!(pt.as_slice(), b"ephemeral material");
    }

    #[test]
    fn test_corruption_fails_decapsulation() {
        let kp = KemKeyPair::generate();
        let mut ct = kp.public().encrypt(&[7u8; 64]).unwrap();
        ct[10] ^= 0x01;
        assert!(matches!(kp.decrypt(&ct), Err(CryptoError::Decapsulation)));

        let ct = kp.public().encrypt(&[7u8; 64]).unwrap();
        let other = KemKeyPair::generate();
        assert!(matches!(other.decrypt(&ct), Err(CryptoError::Decapsulation)));
    }

    #[test]
    fn test_seeded_keypair_is_deterministic() {
        let a = KemKeyPair::from_seed(&[9u8; 32]);
        let b = KemKeyPair::from_seed(&[9u8; 32]);
        let c = KemKeyPair::from_seed(&[8u8; 32]);
        assert_eq!(a.public(), b.public());
        assert_ne!(a.public(), c.public());
    }

    #[test]
    fn test_public_key_base64() {
        let kp = KemKeyPair::generate();
        let b64 = kp.public().to_base64();
        let recovered = KemPublicKey::from_base64(&b64).unwrap();
        assert_eq!(kp.public(), &recovered);
    }
}
