//! Cascade cipher
//!
//! Composes the primitives of one [`Combination`] into a single stream
//! transform. Key and IV material are sliced off sequentially in list order,
//! each primitive taking exactly its own sizes. Encryption applies the
//! primitives in list order; decryption applies them in reverse.

use super::{Combination, CryptoError, Direction, Engine};

/// Stream transform over an ordered list of primitive engines
pub struct CascadeCipher {
    engines: Vec<Engine>,
    direction: Direction,
}

impl CascadeCipher {
    /// Build a cascade from key and IV material
    ///
    /// `keys` and `ivs` may be longer than the combination needs; the excess
    /// is ignored.
    pub fn new(
        combination: &Combination,
        keys: &[u8],
        ivs: &[u8],
        direction: Direction,
    ) -> Result<Self, CryptoError> {
        if keys.len() < combination.key_footprint() || ivs.len() < combination.iv_footprint() {
            return Err(CryptoError::InvalidKeyLength);
        }

        let mut engines = Vec::with_capacity(combination.primitives().len());
        let (mut key_off, mut iv_off) = (0, 0);
        for primitive in combination.primitives() {
            let key = &keys[key_off..key_off + primitive.key_size()];
            let iv = &ivs[iv_off..iv_off + primitive.iv_size()];
            engines.push(primitive.engine(key, iv, direction)?);
            key_off += primitive.key_size();
            iv_off += primitive.iv_size();
        }

        Ok(Self { engines, direction })
    }

    /// Transform `data` in place, continuing the stream
    pub fn process(&mut self, data: &mut [u8]) {
        match self.direction {
            Direction::Encrypt => {
                for engine in self.engines.iter_mut() {
                    engine.process(data);
                }
            }
            Direction::Decrypt => {
                for engine in self.engines.iter_mut().rev() {
                    engine.process(data);
                }
            }
        }
    }

    /// Transform a copy of `data`
    pub fn process_to_vec(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        self.process(&mut out);
        out
    }

    /// Direction this cascade runs in
    pub fn direction(&self) -> Direction {
        self.direction
    }
}

impl std::fmt::Debug for CascadeCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.engines.iter().map(|e| e.primitive().name()).collect();
        f.debug_struct("CascadeCipher")
            .field("primitives", &names)
            .field("direction", &self.direction)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Catalog, Primitive, MAX_IV_FOOTPRINT, MAX_KEY_FOOTPRINT};

    fn material() -> (Vec<u8>, Vec<u8>) {
        let keys: Vec<u8> = (0..MAX_KEY_FOOTPRINT).map(|i| (i * 13) as u8).collect();
        let ivs: Vec<u8> = (0..MAX_IV_FOOTPRINT).map(|i| (i * 29 + 5) as u8).collect();
        (keys, ivs)
    }

    fn pair(combo: &Combination) -> (CascadeCipher, CascadeCipher) {
        let (keys, ivs) = material();
        (
            CascadeCipher::new(combo, &keys, &ivs, Direction::Encrypt).unwrap(),
            CascadeCipher::new(combo, &keys, &ivs, Direction::Decrypt).unwrap(),
        )
    }

    #[test]
    fn test_empty_and_single_byte() {
        let combo = Catalog::global().by_id(1234);
        let (mut enc, mut dec) = pair(combo);

        let mut empty: [u8; 0] = [];
        enc.process(&mut empty);
        dec.process(&mut empty);

        let mut one = [0x42u8];
        enc.process(&mut one);
        dec.process(&mut one);
        assert_eq!(one, [0x42]);
    }

    #[test]
    fn test_sample_of_catalog_round_trips() {
        let catalog = Catalog::global();
        let plaintext: Vec<u8> = (0..777u32).map(|i| (i % 256) as u8).collect();
        for index in (0..catalog.len()).step_by(97) {
            let combo = catalog.get(index).unwrap();
            let (mut enc, mut dec) = pair(combo);

            let ct = enc.process_to_vec(&plaintext);
            assert_ne!(ct, plaintext, "{}", combo);

            let mut pt = ct.clone();
            dec.process(&mut pt[..100]);
            dec.process(&mut pt[100..]);
            assert_eq!(pt, plaintext, "{}", combo);
        }
    }

    #[test]
    fn test_large_stream_in_chunks() {
        let combo = Combination::new(vec![
            Primitive::ChaCha20,
            Primitive::Aes256,
            Primitive::XSalsa20,
        ])
        .unwrap();
        let (mut enc, mut dec) = pair(&combo);

        let total = 10 * 1024 * 1024 + 17;
        let chunk: Vec<u8> = (0..65_536u32).map(|i| (i % 251) as u8).collect();
        let mut done = 0;
        while done < total {
            let n = chunk.len().min(total - done);
            let mut buf = chunk[..n].to_vec();
            enc.process(&mut buf);
            dec.process(&mut buf);
            assert_eq!(buf, chunk[..n]);
            done += n;
        }
    }

    #[test]
    fn test_order_matters() {
        let ab = Combination::new(vec![Primitive::Aes256, Primitive::Twofish]).unwrap();
        let ba = Combination::new(vec![Primitive::Twofish, Primitive::Aes256]).unwrap();
        let (mut enc_ab, _) = pair(&ab);
        let (mut enc_ba, _) = pair(&ba);
        let data = [0u8; 64];
        assert_ne!(enc_ab.process_to_vec(&data), enc_ba.process_to_vec(&data));
    }

    #[test]
    fn test_short_material_rejected() {
        let combo = Combination::new(vec![Primitive::Threefish1024]).unwrap();
        let result = CascadeCipher::new(&combo, &[0u8; 64], &[0u8; 128], Direction::Encrypt);
        assert!(matches!(result, Err(CryptoError::InvalidKeyLength)));
    }
}
