//! Session key material and single-use session ids
//!
//! A completed handshake leaves both peers with the same [`KeyMaterial`].
//! From it each side builds [`SessionKeys`], seeding four generators:
//!
//! - client-session, from the client security code (id tokens)
//! - server-session, from the server security code (per-id auth keys)
//! - client-IV, from the client IV seed
//! - server-IV, from the server IV seed
//!
//! Ids are minted by advancing all four together, so the n-th id is the
//! same on both sides.

use crate::crypto::{
    ct_eq, hmac_sha256, Catalog, CascadeCipher, CryptoError, DeterministicRng, Direction,
    MAX_IV_FOOTPRINT,
};
use super::MAX_TIMEOUT_HINT;
use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;
use zeroize::Zeroizing;

/// Number of unused ids each side keeps ahead of consumption
pub const SESSION_POOL: usize = 100;

/// Length of the opaque id token
pub const TOKEN_LEN: usize = 16;

/// Length of the truncated opener tag
const OPENER_TAG_LEN: usize = 8;

/// Length of a resumption opener on the wire
pub const OPENER_LEN: usize = TOKEN_LEN + OPENER_TAG_LEN;

const LABEL_CLIENT_SESSION: &[u8] = b"client-session";
const LABEL_SERVER_SESSION: &[u8] = b"server-session";
const LABEL_CLIENT_IV: &[u8] = b"client-iv";
const LABEL_SERVER_IV: &[u8] = b"server-iv";

/// Everything the handshake agrees on
#[derive(Clone)]
pub struct KeyMaterial {
    pub client_keys: Zeroizing<Vec<u8>>,
    pub server_keys: Zeroizing<Vec<u8>>,
    pub client_cipher: u16,
    pub server_cipher: u16,
    pub client_code: Zeroizing<[u8; 32]>,
    pub server_code: Zeroizing<[u8; 32]>,
    pub client_iv_seed: Zeroizing<[u8; 32]>,
    pub server_iv_seed: Zeroizing<[u8; 32]>,
    /// Relay idle timeout requested by the client, in seconds (0 = none)
    pub timeout_hint: u64,
}

struct Generators {
    client_session: DeterministicRng,
    server_session: DeterministicRng,
    client_iv: DeterministicRng,
    server_iv: DeterministicRng,
    next_index: u64,
}

/// Negotiated session: cascade keys, cipher ids and id generators
pub struct SessionKeys {
    client_keys: Zeroizing<Vec<u8>>,
    server_keys: Zeroizing<Vec<u8>>,
    client_cipher: u16,
    server_cipher: u16,
    timeout_hint: u64,
    generators: Mutex<Generators>,
}

impl SessionKeys {
    /// Seed the generators; the security codes and IV seeds are dropped
    /// (and zeroed) when `material` goes out of scope
    pub fn new(material: KeyMaterial) -> Self {
        let generators = Generators {
            client_session: DeterministicRng::new(LABEL_CLIENT_SESSION, &*material.client_code),
            server_session: DeterministicRng::new(LABEL_SERVER_SESSION, &*material.server_code),
            client_iv: DeterministicRng::new(LABEL_CLIENT_IV, &*material.client_iv_seed),
            server_iv: DeterministicRng::new(LABEL_SERVER_IV, &*material.server_iv_seed),
            next_index: 0,
        };

        Self {
            client_keys: material.client_keys.clone(),
            server_keys: material.server_keys.clone(),
            client_cipher: material.client_cipher,
            server_cipher: material.server_cipher,
            timeout_hint: material.timeout_hint,
            generators: Mutex::new(generators),
        }
    }

    /// Mint the next session id
    pub fn mint(&self) -> SessionId {
        let mut g = self.generators.lock();
        let index = g.next_index;
        g.next_index += 1;

        SessionId {
            index,
            token: g.client_session.array(),
            client_iv: Zeroizing::new(g.client_iv.bytes(MAX_IV_FOOTPRINT)),
            server_iv: Zeroizing::new(g.server_iv.bytes(MAX_IV_FOOTPRINT)),
            auth_key: Zeroizing::new(g.server_session.array()),
        }
    }

    /// Number of ids minted so far
    pub fn minted(&self) -> u64 {
        self.generators.lock().next_index
    }

    /// Cascade protecting the client-to-server direction of a connection
    pub fn client_cascade(&self, id: &SessionId, direction: Direction) -> Result<CascadeCipher, CryptoError> {
        let combination = Catalog::global().by_id(self.client_cipher);
        CascadeCipher::new(combination, &self.client_keys, &id.client_iv, direction)
    }

    /// Cascade protecting the server-to-client direction of a connection
    pub fn server_cascade(&self, id: &SessionId, direction: Direction) -> Result<CascadeCipher, CryptoError> {
        let combination = Catalog::global().by_id(self.server_cipher);
        CascadeCipher::new(combination, &self.server_keys, &id.server_iv, direction)
    }

    pub fn client_cipher(&self) -> u16 {
        self.client_cipher
    }

    pub fn server_cipher(&self) -> u16 {
        self.server_cipher
    }

    pub fn client_keys(&self) -> &[u8] {
        &self.client_keys
    }

    pub fn server_keys(&self) -> &[u8] {
        &self.server_keys
    }

    /// Relay idle timeout agreed for this session
    pub fn relay_idle(&self) -> Option<Duration> {
        (self.timeout_hint > 0).then(|| Duration::from_secs(self.timeout_hint.min(MAX_TIMEOUT_HINT)))
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("client_cipher", &Catalog::global().by_id(self.client_cipher).to_string())
            .field("server_cipher", &Catalog::global().by_id(self.server_cipher).to_string())
            .finish_non_exhaustive()
    }
}

/// Single-use session id
///
/// The token travels in clear in the opener; the IVs and auth key never
/// leave the peers.
pub struct SessionId {
    index: u64,
    token: [u8; TOKEN_LEN],
    client_iv: Zeroizing<Vec<u8>>,
    server_iv: Zeroizing<Vec<u8>>,
    auth_key: Zeroizing<[u8; 32]>,
}

impl SessionId {
    /// Position of this id in the minted sequence
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn token(&self) -> &[u8; TOKEN_LEN] {
        &self.token
    }

    /// Key of the opener tag and of every data frame tag
    pub fn auth_key(&self) -> &[u8; 32] {
        &self.auth_key
    }

    fn opener_tag(&self) -> [u8; OPENER_TAG_LEN] {
        let mac = hmac_sha256(&*self.auth_key, &[b"open", &self.token]);
        let mut tag = [0u8; OPENER_TAG_LEN];
        tag.copy_from_slice(&mac[..OPENER_TAG_LEN]);
        tag
    }

    /// Opener bytes: `token || HMAC(auth_key, "open" || token)[..8]`
    pub fn opener(&self) -> [u8; OPENER_LEN] {
        let mut out = [0u8; OPENER_LEN];
        out[..TOKEN_LEN].copy_from_slice(&self.token);
        out[TOKEN_LEN..].copy_from_slice(&self.opener_tag());
        out
    }

    /// Check the tag half of an opener
    pub fn verify_opener(&self, tag: &[u8]) -> bool {
        ct_eq(&self.opener_tag(), tag)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionId")
            .field("index", &self.index)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn test_material() -> KeyMaterial {
    use crate::crypto::{random_array, MAX_KEY_FOOTPRINT};
    let mut client_keys = vec![0u8; MAX_KEY_FOOTPRINT];
    let mut server_keys = vec![0u8; MAX_KEY_FOOTPRINT];
    crate::crypto::random_bytes(&mut client_keys);
    crate::crypto::random_bytes(&mut server_keys);
    KeyMaterial {
        client_keys: Zeroizing::new(client_keys),
        server_keys: Zeroizing::new(server_keys),
        client_cipher: u16::from_be_bytes(random_array()),
        server_cipher: u16::from_be_bytes(random_array()),
        client_code: Zeroizing::new(random_array()),
        server_code: Zeroizing::new(random_array()),
        client_iv_seed: Zeroizing::new(random_array()),
        server_iv_seed: Zeroizing::new(random_array()),
        timeout_hint: 0,
    }
}

/// Client and server views of one freshly negotiated session
#[cfg(test)]
pub(crate) fn test_pair() -> (SessionKeys, SessionKeys) {
    let material = test_material();
    (SessionKeys::new(material.clone()), SessionKeys::new(material))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_sides_mint_same_ids() {
        let material = test_material();
        let client = SessionKeys::new(material.clone());
        let server = SessionKeys::new(material);

        for i in 0..5 {
            let a = client.mint();
            let b = server.mint();
            assert_eq!(a.index(), i);
            assert_eq!(a.token(), b.token());
            assert_eq!(a.opener(), b.opener());
            assert_eq!(a.auth_key(), b.auth_key());
        }
        assert_eq!(client.minted(), 5);
    }

    #[test]
    fn test_ids_are_distinct() {
        let keys = SessionKeys::new(test_material());
        let a = keys.mint();
        let b = keys.mint();
        assert_ne!(a.token(), b.token());
        assert_ne!(a.auth_key(), b.auth_key());
    }

    #[test]
    fn test_opener_verification() {
        let keys = SessionKeys::new(test_material());
        let id = keys.mint();
        let opener = id.opener();
        assert!(id.verify_opener(&opener[TOKEN_LEN..]));

        let mut forged = opener;
        forged[OPENER_LEN - 1] ^= 1;
        assert!(!id.verify_opener(&forged[TOKEN_LEN..]));
    }

    #[test]
    fn test_cascades_pair_up() {
        let material = test_material();
        let client = SessionKeys::new(material.clone());
        let server = SessionKeys::new(material);
        let (cid, sid) = (client.mint(), server.mint());

        let mut up = client.client_cascade(&cid, Direction::Encrypt).unwrap();
        let mut up_rx = server.client_cascade(&sid, Direction::Decrypt).unwrap();
        let mut down = server.server_cascade(&sid, Direction::Encrypt).unwrap();
        let mut down_rx = client.server_cascade(&cid, Direction::Decrypt).unwrap();

        let mut data = b"through the tunnel".to_vec();
        up.process(&mut data);
        up_rx.process(&mut data);
        assert_eq!(data, b"through the tunnel");

        down.process(&mut data);
        down_rx.process(&mut data);
        assert_eq!(data, b"through the tunnel");
    }

    #[test]
    fn test_relay_idle_hint() {
        let mut material = test_material();
        assert!(SessionKeys::new(material.clone()).relay_idle().is_none());
        material.timeout_hint = 30;
        assert_eq!(
            SessionKeys::new(material.clone()).relay_idle(),
            Some(Duration::from_secs(30))
        );
        material.timeout_hint = u64::MAX;
        assert_eq!(
            SessionKeys::new(material).relay_idle(),
            Some(Duration::from_secs(MAX_TIMEOUT_HINT))
        );
    }
}
