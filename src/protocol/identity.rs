//! Long-term identities
//!
//! A client is a fixed 16-byte id plus an ML-KEM key pair derived from a
//! 32-byte seed. The server holds its own key pair and the public key of
//! every authorized client. Clients learn the server through its "client
//! key": the base64 SHA-256 fingerprint of the server public key, which both
//! masks the ephemeral keys in messages 1 and 2 and keys the server's tags.

use crate::crypto::{random_array, CryptoError, KemKeyPair, KemPublicKey};
use base64::Engine;
use std::collections::HashMap;
use zeroize::Zeroizing;

/// Length of a client id
pub const CLIENT_ID_LEN: usize = 16;

/// Client id bytes; also the key of every client-side handshake tag
pub type ClientId = [u8; CLIENT_ID_LEN];

/// Client long-term identity
#[derive(Clone)]
pub struct ClientIdentity {
    id: ClientId,
    keypair: KemKeyPair,
}

impl ClientIdentity {
    /// Derive the identity from its id and seed
    pub fn from_seed(id: ClientId, seed: &[u8; 32]) -> Self {
        Self {
            id,
            keypair: KemKeyPair::from_seed(seed),
        }
    }

    /// Create a fresh identity, returning it with its seed
    pub fn generate() -> (Self, Zeroizing<[u8; 32]>) {
        let seed = Zeroizing::new(random_array::<32>());
        (Self::from_seed(random_array(), &seed), seed)
    }

    /// Client id
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Long-term key pair
    pub fn keypair(&self) -> &KemKeyPair {
        &self.keypair
    }

    /// Long-term public key, as registered on the server
    pub fn public(&self) -> &KemPublicKey {
        self.keypair.public()
    }
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("id", &encode_id(&self.id))
            .finish()
    }
}

/// Server long-term identity and the registry of authorized clients
pub struct ServerIdentity {
    keypair: KemKeyPair,
    fingerprint: [u8; 32],
    clients: HashMap<ClientId, KemPublicKey>,
}

impl ServerIdentity {
    /// Wrap a server key pair with an empty client registry
    pub fn new(keypair: KemKeyPair) -> Self {
        let fingerprint = keypair.public().fingerprint();
        Self {
            keypair,
            fingerprint,
            clients: HashMap::new(),
        }
    }

    /// Derive the server key pair from a seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::new(KemKeyPair::from_seed(seed))
    }

    /// Authorize a client
    pub fn add_client(&mut self, id: ClientId, public: KemPublicKey) {
        self.clients.insert(id, public);
    }

    /// Builder form of [`add_client`](Self::add_client)
    pub fn with_client(mut self, id: ClientId, public: KemPublicKey) -> Self {
        self.add_client(id, public);
        self
    }

    /// Registered public key of a client
    pub fn client(&self, id: &ClientId) -> Option<&KemPublicKey> {
        self.clients.get(id)
    }

    /// Iterate over all registered client ids
    pub fn client_ids(&self) -> impl Iterator<Item = &ClientId> {
        self.clients.keys()
    }

    /// Number of authorized clients
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Long-term key pair
    pub fn keypair(&self) -> &KemKeyPair {
        &self.keypair
    }

    /// SHA-256 of the server public key
    pub fn fingerprint(&self) -> &[u8; 32] {
        &self.fingerprint
    }

    /// The client key string handed to clients out of band
    pub fn client_key(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.fingerprint)
    }
}

/// Parse a client key string into the server fingerprint
pub fn parse_client_key(s: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(s.trim())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength)
}

fn encode_id(id: &ClientId) -> String {
    base64::engine::general_purpose::STANDARD.encode(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_identity_is_reproducible() {
        let (identity, seed) = ClientIdentity::generate();
        let again = ClientIdentity::from_seed(*identity.id(), &seed);
        assert_eq!(identity.public(), again.public());
    }

    #[test]
    fn test_client_key_round_trip() {
        let server = ServerIdentity::from_seed(&[3u8; 32]);
        let parsed = parse_client_key(&server.client_key()).unwrap();
        assert_eq!(&parsed, server.fingerprint());
        assert!(parse_client_key("c2hvcnQ=").is_err());
    }

    #[test]
    fn test_registry() {
        let (client, _) = ClientIdentity::generate();
        let server =
            ServerIdentity::from_seed(&[1u8; 32]).with_client(*client.id(), client.public().clone());
        assert_eq!(server.client_count(), 1);
        assert_eq!(server.client(client.id()), Some(client.public()));
        assert!(server.client(&[0u8; CLIENT_ID_LEN]).is_none());
    }
}
