//! Registry of named symmetric primitives
//!
//! The protocol draws on a fixed set of fourteen ciphers. Each one is a
//! variant of [`Primitive`] exposing its key size, IV size and family, and
//! builds an [`Engine`] that processes bytes strictly in stream order. Block
//! ciphers run in full-block CFB mode (the IV is the initial feedback
//! register); stream ciphers XOR their keystream.

use super::{CryptoError, Rc6, Rc6Wide};
use cipher::generic_array::GenericArray;
use cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use skein::digest::consts::{U128, U32, U64};
use skein::{Digest, Skein1024, Skein256, Skein512};

/// Processing direction of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// Capacity families constrained by the combination catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Rc6,
    SkeinStream,
    Threefish,
    Independent,
}

/// A named symmetric primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Aes256,
    Twofish,
    Serpent,
    Camellia256,
    Rc6,
    Rc6Wide,
    Threefish256,
    Threefish512,
    Threefish1024,
    SkeinStream256,
    SkeinStream512,
    SkeinStream1024,
    ChaCha20,
    XSalsa20,
}

/// Largest key any three primitives can consume together
pub const MAX_KEY_FOOTPRINT: usize = 3 * Primitive::max_key_size();

/// Largest IV any three primitives can consume together
pub const MAX_IV_FOOTPRINT: usize = 3 * Primitive::max_iv_size();

impl Primitive {
    /// Every primitive, in catalog enumeration order
    pub const ALL: [Primitive; 14] = [
        Primitive::Aes256,
        Primitive::Twofish,
        Primitive::Serpent,
        Primitive::Camellia256,
        Primitive::Rc6,
        Primitive::Rc6Wide,
        Primitive::Threefish256,
        Primitive::Threefish512,
        Primitive::Threefish1024,
        Primitive::SkeinStream256,
        Primitive::SkeinStream512,
        Primitive::SkeinStream1024,
        Primitive::ChaCha20,
        Primitive::XSalsa20,
    ];

    /// Registry name
    pub const fn name(self) -> &'static str {
        match self {
            Primitive::Aes256 => "AES-256",
            Primitive::Twofish => "Twofish",
            Primitive::Serpent => "Serpent",
            Primitive::Camellia256 => "Camellia-256",
            Primitive::Rc6 => "RC6",
            Primitive::Rc6Wide => "RC6-64",
            Primitive::Threefish256 => "Threefish-256",
            Primitive::Threefish512 => "Threefish-512",
            Primitive::Threefish1024 => "Threefish-1024",
            Primitive::SkeinStream256 => "SkeinStream-256",
            Primitive::SkeinStream512 => "SkeinStream-512",
            Primitive::SkeinStream1024 => "SkeinStream-1024",
            Primitive::ChaCha20 => "ChaCha20",
            Primitive::XSalsa20 => "XSalsa20",
        }
    }

    /// Key size in bytes
    pub const fn key_size(self) -> usize {
        match self {
            Primitive::Threefish512 | Primitive::SkeinStream512 => 64,
            Primitive::Threefish1024 | Primitive::SkeinStream1024 => 128,
            _ => 32,
        }
    }

    /// IV size in bytes (the CFB register for block ciphers)
    pub const fn iv_size(self) -> usize {
        match self {
            Primitive::Aes256
            | Primitive::Twofish
            | Primitive::Serpent
            | Primitive::Camellia256
            | Primitive::Rc6 => 16,
            Primitive::Rc6Wide | Primitive::Threefish256 => 32,
            Primitive::Threefish512 => 64,
            Primitive::Threefish1024 => 128,
            Primitive::SkeinStream256 | Primitive::SkeinStream512 => 32,
            Primitive::SkeinStream1024 => 64,
            Primitive::ChaCha20 => 12,
            Primitive::XSalsa20 => 24,
        }
    }

    /// Capacity family
    pub const fn family(self) -> Family {
        match self {
            Primitive::Rc6 | Primitive::Rc6Wide => Family::Rc6,
            Primitive::Threefish256 | Primitive::Threefish512 | Primitive::Threefish1024 => {
                Family::Threefish
            }
            Primitive::SkeinStream256
            | Primitive::SkeinStream512
            | Primitive::SkeinStream1024 => Family::SkeinStream,
            _ => Family::Independent,
        }
    }

    const fn max_key_size() -> usize {
        let mut max = 0;
        let mut i = 0;
        while i < Self::ALL.len() {
            let size = Self::ALL[i].key_size();
            if size > max {
                max = size;
            }
            i += 1;
        }
        max
    }

    const fn max_iv_size() -> usize {
        let mut max = 0;
        let mut i = 0;
        while i < Self::ALL.len() {
            let size = Self::ALL[i].iv_size();
            if size > max {
                max = size;
            }
            i += 1;
        }
        max
    }

    fn setup_error<E>(self) -> impl FnOnce(E) -> CryptoError {
        move |_| CryptoError::CipherSetup(self.name())
    }

    /// Build an engine from exact-size key and IV slices
    pub fn engine(self, key: &[u8], iv: &[u8], direction: Direction) -> Result<Engine, CryptoError> {
        if key.len() != self.key_size() || iv.len() != self.iv_size() {
            return Err(CryptoError::InvalidKeyLength);
        }
        let inner = match self {
            Primitive::Aes256 => Inner::Cfb(Cfb::new(
                BlockCore::Aes(Box::new(aes::Aes256::new_from_slice(key).map_err(self.setup_error())?)),
                iv,
                direction,
            )),
            Primitive::Twofish => Inner::Cfb(Cfb::new(
                BlockCore::Twofish(Box::new(twofish::Twofish::new_from_slice(key).map_err(self.setup_error())?)),
                iv,
                direction,
            )),
            Primitive::Serpent => Inner::Cfb(Cfb::new(
                BlockCore::Serpent(Box::new(serpent::Serpent::new_from_slice(key).map_err(self.setup_error())?)),
                iv,
                direction,
            )),
            Primitive::Camellia256 => Inner::Cfb(Cfb::new(
                BlockCore::Camellia(Box::new(
                    camellia::Camellia256::new_from_slice(key).map_err(self.setup_error())?,
                )),
                iv,
                direction,
            )),
            Primitive::Rc6 => Inner::Cfb(Cfb::new(BlockCore::Rc6(Rc6::new(key)), iv, direction)),
            Primitive::Rc6Wide => {
                Inner::Cfb(Cfb::new(BlockCore::Rc6Wide(Rc6Wide::new(key)), iv, direction))
            }
            Primitive::Threefish256 => {
                let key: [u8; 32] = key.try_into().map_err(self.setup_error())?;
                Inner::Cfb(Cfb::new(
                    BlockCore::Threefish256(Box::new(threefish::Threefish256::new_with_tweak(
                        &key,
                        &[0u8; 16],
                    ))),
                    iv,
                    direction,
                ))
            }
            Primitive::Threefish512 => {
                let key: [u8; 64] = key.try_into().map_err(self.setup_error())?;
                Inner::Cfb(Cfb::new(
                    BlockCore::Threefish512(Box::new(threefish::Threefish512::new_with_tweak(
                        &key,
                        &[0u8; 16],
                    ))),
                    iv,
                    direction,
                ))
            }
            Primitive::Threefish1024 => {
                let key: [u8; 128] = key.try_into().map_err(self.setup_error())?;
                Inner::Cfb(Cfb::new(
                    BlockCore::Threefish1024(Box::new(threefish::Threefish1024::new_with_tweak(
                        &key,
                        &[0u8; 16],
                    ))),
                    iv,
                    direction,
                ))
            }
            Primitive::SkeinStream256 => {
                let mut h = Skein256::<U32>::new();
                Digest::update(&mut h, key);
                Digest::update(&mut h, iv);
                Inner::Skein(SkeinKeystream::new(SkeinPrefix::S256(h), 32))
            }
            Primitive::SkeinStream512 => {
                let mut h = Skein512::<U64>::new();
                Digest::update(&mut h, key);
                Digest::update(&mut h, iv);
                Inner::Skein(SkeinKeystream::new(SkeinPrefix::S512(h), 64))
            }
            Primitive::SkeinStream1024 => {
                let mut h = Skein1024::<U128>::new();
                Digest::update(&mut h, key);
                Digest::update(&mut h, iv);
                Inner::Skein(SkeinKeystream::new(SkeinPrefix::S1024(h), 128))
            }
            Primitive::ChaCha20 => Inner::ChaCha(Box::new(
                chacha20::ChaCha20::new_from_slices(key, iv).map_err(self.setup_error())?,
            )),
            Primitive::XSalsa20 => Inner::XSalsa(Box::new(
                salsa20::XSalsa20::new_from_slices(key, iv).map_err(self.setup_error())?,
            )),
        };

        Ok(Engine {
            primitive: self,
            inner,
        })
    }
}

impl std::fmt::Display for Primitive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Stateful instance of one primitive in one direction
pub struct Engine {
    primitive: Primitive,
    inner: Inner,
}

impl Engine {
    /// The primitive this engine runs
    pub fn primitive(&self) -> Primitive {
        self.primitive
    }

    /// Transform `data` in place, continuing from the previous call
    pub fn process(&mut self, data: &mut [u8]) {
        match &mut self.inner {
            Inner::Cfb(cfb) => cfb.process(data),
            Inner::Skein(ks) => ks.apply(data),
            Inner::ChaCha(c) => c.apply_keystream(data),
            Inner::XSalsa(c) => c.apply_keystream(data),
        }
    }
}

enum Inner {
    Cfb(Cfb),
    Skein(SkeinKeystream),
    ChaCha(Box<chacha20::ChaCha20>),
    XSalsa(Box<salsa20::XSalsa20>),
}

enum BlockCore {
    Aes(Box<aes::Aes256>),
    Twofish(Box<twofish::Twofish>),
    Serpent(Box<serpent::Serpent>),
    Camellia(Box<camellia::Camellia256>),
    Rc6(Rc6),
    Rc6Wide(Rc6Wide),
    Threefish256(Box<threefish::Threefish256>),
    Threefish512(Box<threefish::Threefish512>),
    Threefish1024(Box<threefish::Threefish1024>),
}

impl BlockCore {
    fn encrypt(&self, block: &mut [u8]) {
        match self {
            BlockCore::Aes(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
            BlockCore::Twofish(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
            BlockCore::Serpent(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
            BlockCore::Camellia(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
            BlockCore::Rc6(c) => c.encrypt_block(block),
            BlockCore::Rc6Wide(c) => c.encrypt_block(block),
            BlockCore::Threefish256(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
            BlockCore::Threefish512(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
            BlockCore::Threefish1024(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
        }
    }
}

/// Full-block cipher feedback mode, processed byte by byte
struct Cfb {
    core: BlockCore,
    register: Vec<u8>,
    keystream: Vec<u8>,
    pos: usize,
    direction: Direction,
}

impl Cfb {
    fn new(core: BlockCore, iv: &[u8], direction: Direction) -> Self {
        Self {
            core,
            register: iv.to_vec(),
            keystream: vec![0u8; iv.len()],
            pos: iv.len(),
            direction,
        }
    }

    fn process(&mut self, data: &mut [u8]) {
        let block = self.register.len();
        for byte in data.iter_mut() {
            if self.pos == block {
                self.keystream.copy_from_slice(&self.register);
                self.core.encrypt(&mut self.keystream);
                self.pos = 0;
            }
            let input = *byte;
            let output = input ^ self.keystream[self.pos];
            self.register[self.pos] = match self.direction {
                Direction::Encrypt => output,
                Direction::Decrypt => input,
            };
            *byte = output;
            self.pos += 1;
        }
    }
}

impl Drop for Cfb {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.register.zeroize();
        self.keystream.zeroize();
    }
}

#[derive(Clone)]
enum SkeinPrefix {
    S256(Skein256<U32>),
    S512(Skein512<U64>),
    S1024(Skein1024<U128>),
}

/// Counter-mode keystream: block `i` is `Skein(key || iv || i)`
struct SkeinKeystream {
    prefix: SkeinPrefix,
    counter: u64,
    block: Vec<u8>,
    pos: usize,
}

impl SkeinKeystream {
    fn new(prefix: SkeinPrefix, block_len: usize) -> Self {
        Self {
            prefix,
            counter: 0,
            block: vec![0u8; block_len],
            pos: block_len,
        }
    }

    fn refill(&mut self) {
        let counter = self.counter.to_le_bytes();
        match &self.prefix {
            SkeinPrefix::S256(h) => {
                let mut h = h.clone();
                Digest::update(&mut h, counter);
                self.block.copy_from_slice(&h.finalize());
            }
            SkeinPrefix::S512(h) => {
                let mut h = h.clone();
                Digest::update(&mut h, counter);
                self.block.copy_from_slice(&h.finalize());
            }
            SkeinPrefix::S1024(h) => {
                let mut h = h.clone();
                Digest::update(&mut h, counter);
                self.block.copy_from_slice(&h.finalize());
            }
        }
        self.counter = self.counter.wrapping_add(1);
        self.pos = 0;
    }

    fn apply(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            if self.pos == self.block.len() {
                self.refill();
            }
            *byte ^= self.block[self.pos];
            self.pos += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn material(p: Primitive) -> (Vec<u8>, Vec<u8>) {
        let key: Vec<u8> = (0..p.key_size()).map(|i| i as u8).collect();
        let iv: Vec<u8> = (0..p.iv_size()).map(|i| (i as u8).wrapping_mul(7)).collect();
        (key, iv)
    }

    #[test]
    fn test_every_primitive_round_trips() {
        for p in Primitive::ALL {
            let (key, iv) = material(p);
            let plaintext: Vec<u8> = (0..1000u32).map(|i| (i * 31 % 251) as u8).collect();

            let mut enc = p.engine(&key, &iv, Direction::Encrypt).unwrap();
            let mut dec = p.engine(&key, &iv, Direction::Decrypt).unwrap();

            let mut data = plaintext.clone();
            // Uneven chunking must not change the stream
            enc.process(&mut data[..7]);
            enc.process(&mut data[7..300]);
            enc.process(&mut data[300..]);
            assert_ne!(data, plaintext, "{} produced identity output", p);

            dec.process(&mut data[..500]);
            dec.process(&mut data[500..]);
            assert_eq!(data, plaintext, "{} failed to round trip", p);
        }
    }

    #[test]
    fn test_wrong_sizes_rejected() {
        let p = Primitive::Aes256;
        assert!(p.engine(&[0u8; 16], &[0u8; 16], Direction::Encrypt).is_err());
        assert!(p.engine(&[0u8; 32], &[0u8; 12], Direction::Encrypt).is_err());
    }

    #[test]
    fn test_footprints() {
        assert_eq!(MAX_KEY_FOOTPRINT, 3 * 128);
        assert_eq!(MAX_IV_FOOTPRINT, 3 * 128);
    }

    #[test]
    fn test_families() {
        let count = |f| Primitive::ALL.iter().filter(|p| p.family() == f).count();
        assert_eq!(count(Family::Rc6), 2);
        assert_eq!(count(Family::Threefish), 3);
        assert_eq!(count(Family::SkeinStream), 3);
    }
}
