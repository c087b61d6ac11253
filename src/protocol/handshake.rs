//! Handshake state machines
//!
//! [`ClientHandshake`] and [`ServerHandshake`] are synchronous: the caller
//! reads the fixed part of each incoming message, hands it to
//! [`HandshakeMachine::check`] (cheap: tag and length only, returns the
//! tail length to discard), then calls [`HandshakeMachine::advance`] (KEM
//! work, meant for the crypto pool) to get the next message to write.
//!
//! Every message ends with `tag || tail`. The tag is the first 8 bytes of
//! HMAC-SHA256 over the message body, keyed by the client id for client
//! messages and by the server fingerprint for server messages. Bytes 8..10
//! of the same MAC fix the tail length, so nothing about the tail is sent.

use super::{ClientId, ClientIdentity, HandshakeError, KeyMaterial, ServerIdentity, SessionKeys};
use crate::crypto::{
    ct_eq, hmac_sha256, kem_ciphertext_len, random_array, random_bytes, tag_id, Catalog,
    CryptoError, Direction, KemKeyPair, KemPublicKey, Primitive, KEM_PUBLIC_KEY_LEN, MAC_LEN,
    MAX_KEY_FOOTPRINT,
};
use crate::obfuscation::{handshake_tail_len, random_padding};
use crate::session::ReplayGuard;
use std::sync::Arc;
use tracing::{debug, trace};
use zeroize::Zeroizing;

/// Masking IV length (the first 16 bytes seed the AES-CFB register)
pub const IV_LEN: usize = 32;

/// Truncated tag length
pub const TAG_LEN: usize = 8;

pub const SECURITY_CODE_LEN: usize = 32;
pub const IV_SEED_LEN: usize = 32;
pub const KEY_BLOB_LEN: usize = MAX_KEY_FOOTPRINT;
pub const CIPHER_ID_LEN: usize = 2;
pub const TIMEOUT_HINT_LEN: usize = 8;

/// Largest relay idle timeout (seconds) a client may request
pub const MAX_TIMEOUT_HINT: u64 = 24 * 60 * 60;

const MASK_REGISTER_LEN: usize = 16;

/// IV seed, key blob and cipher id offered by one side
const OFFER_LEN: usize = IV_SEED_LEN + KEY_BLOB_LEN + CIPHER_ID_LEN;

/// Server security code and its MAC over message 2 so far
const PROOF_LEN: usize = SECURITY_CODE_LEN + MAC_LEN;

/// Client offer, echoed server code, client code and timeout hint
const CONFIRM_LEN: usize = OFFER_LEN + 2 * SECURITY_CODE_LEN + TIMEOUT_HINT_LEN;

const MASKED_END: usize = IV_LEN + KEM_PUBLIC_KEY_LEN;
const OFFER_CT_LEN: usize = kem_ciphertext_len(OFFER_LEN);
const PROOF_CT_LEN: usize = kem_ciphertext_len(PROOF_LEN);

/// Fixed part of message 1
pub const MESSAGE1_LEN: usize = MASKED_END + TAG_LEN;

/// Fixed part of message 2
pub const MESSAGE2_LEN: usize = MASKED_END + OFFER_CT_LEN + PROOF_CT_LEN + TAG_LEN;

/// Fixed part of message 3
pub const MESSAGE3_LEN: usize = kem_ciphertext_len(CONFIRM_LEN) + TAG_LEN;

/// Fixed part of message 4
pub const MESSAGE4_LEN: usize = kem_ciphertext_len(SECURITY_CODE_LEN) + TAG_LEN;

/// Append the tag and random tail to a message body
pub fn tag_message(key: &[u8], mut body: Vec<u8>) -> Vec<u8> {
    let mac = hmac_sha256(key, &[&body]);
    body.extend_from_slice(&mac[..TAG_LEN]);
    body.extend_from_slice(&random_padding(handshake_tail_len(&mac)));
    body
}

/// Verify `body || tag`, returning the tail length on success
pub fn verify_message(key: &[u8], fixed: &[u8]) -> Option<usize> {
    if fixed.len() < TAG_LEN {
        return None;
    }
    let (body, tag) = fixed.split_at(fixed.len() - TAG_LEN);
    let mac = hmac_sha256(key, &[body]);
    ct_eq(&mac[..TAG_LEN], tag).then(|| handshake_tail_len(&mac))
}

/// AES-256-CFB keyed by the server fingerprint over an ephemeral public key
fn mask(fingerprint: &[u8; 32], iv: &[u8], data: &mut [u8], direction: Direction) -> Result<(), CryptoError> {
    let mut engine = Primitive::Aes256.engine(fingerprint, &iv[..MASK_REGISTER_LEN], direction)?;
    engine.process(data);
    Ok(())
}

/// Sequential reader over a decoded message
struct Fields<'a> {
    buf: &'a [u8],
}

impl<'a> Fields<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], HandshakeError> {
        if self.buf.len() < n {
            return Err(HandshakeError::Decode("message too short"));
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], HandshakeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}

fn random_key_blob() -> Zeroizing<Vec<u8>> {
    let mut keys = Zeroizing::new(vec![0u8; KEY_BLOB_LEN]);
    random_bytes(&mut keys);
    keys
}

fn masked_public(fingerprint: &[u8; 32], iv: &[u8], ephemeral: &KemKeyPair) -> Result<Vec<u8>, CryptoError> {
    let mut masked = ephemeral.public().as_bytes().to_vec();
    mask(fingerprint, iv, &mut masked, Direction::Encrypt)?;
    Ok(masked)
}

fn unmask_public(fingerprint: &[u8; 32], iv: &[u8], masked: &[u8]) -> Result<KemPublicKey, CryptoError> {
    let mut public = masked.to_vec();
    mask(fingerprint, iv, &mut public, Direction::Decrypt)?;
    KemPublicKey::from_bytes(&public)
}

/// Outcome of [`HandshakeMachine::advance`]
pub enum Step {
    /// Write this message, then wait for the peer
    Send(Vec<u8>),
    /// Handshake finished; write `reply` if there is one
    Complete {
        reply: Option<Vec<u8>>,
        keys: SessionKeys,
    },
}

/// Common driving interface of both handshake roles
pub trait HandshakeMachine: Send + 'static {
    /// Fixed length of the next incoming message, 0 when `advance` is due
    fn expected_len(&self) -> usize;

    /// Verify the fixed part of an incoming message; returns its tail length
    fn check(&mut self, fixed: &[u8]) -> Result<usize, HandshakeError>;

    /// Perform the expensive part of the current step
    fn advance(&mut self) -> Result<Step, HandshakeError>;

    /// Name of the current state, for logs
    fn state_name(&self) -> &'static str;
}

enum ClientState {
    Start,
    AwaitingMessage2 {
        ephemeral: KemKeyPair,
    },
    Message2Received {
        ephemeral: KemKeyPair,
        packet: Vec<u8>,
    },
    AwaitingMessage4 {
        ephemeral: KemKeyPair,
        material: Box<KeyMaterial>,
    },
    Message4Received {
        ephemeral: KemKeyPair,
        material: Box<KeyMaterial>,
        packet: Vec<u8>,
    },
    Complete,
    Failed,
}

impl ClientState {
    fn name(&self) -> &'static str {
        match self {
            ClientState::Start => "Start",
            ClientState::AwaitingMessage2 { .. } => "AwaitingMessage2",
            ClientState::Message2Received { .. } => "Message2Received",
            ClientState::AwaitingMessage4 { .. } => "AwaitingMessage4",
            ClientState::Message4Received { .. } => "Message4Received",
            ClientState::Complete => "Complete",
            ClientState::Failed => "Failed",
        }
    }
}

/// Initiator side of the handshake
pub struct ClientHandshake {
    identity: Arc<ClientIdentity>,
    server_fingerprint: [u8; 32],
    timeout_hint: u64,
    state: ClientState,
}

impl ClientHandshake {
    /// Start a handshake towards the server with the given fingerprint
    pub fn new(identity: Arc<ClientIdentity>, server_fingerprint: [u8; 32]) -> Self {
        Self {
            identity,
            server_fingerprint,
            timeout_hint: 0,
            state: ClientState::Start,
        }
    }

    /// Request a relay idle timeout (seconds) for the session, capped at
    /// [`MAX_TIMEOUT_HINT`]
    pub fn with_timeout_hint(mut self, seconds: u64) -> Self {
        self.timeout_hint = seconds.min(MAX_TIMEOUT_HINT);
        self
    }

    fn message1(&self, ephemeral: &KemKeyPair) -> Result<Vec<u8>, HandshakeError> {
        let iv: [u8; IV_LEN] = random_array();
        let mut body = Vec::with_capacity(MESSAGE1_LEN);
        body.extend_from_slice(&iv);
        body.extend_from_slice(&masked_public(&self.server_fingerprint, &iv, ephemeral)?);
        Ok(tag_message(self.identity.id(), body))
    }

    fn message3(&self, ephemeral: &KemKeyPair, packet: &[u8]) -> Result<(Vec<u8>, KeyMaterial), HandshakeError> {
        let mut fields = Fields::new(&packet[..packet.len() - TAG_LEN]);
        let iv = fields.take(IV_LEN)?;
        let server_ephemeral =
            unmask_public(&self.server_fingerprint, iv, fields.take(KEM_PUBLIC_KEY_LEN)?)?;

        let offer = ephemeral.decrypt(fields.take(OFFER_CT_LEN)?)?;
        let proof = self.identity.keypair().decrypt(fields.take(PROOF_CT_LEN)?)?;

        // The proof MAC covers message 2 up to the proof ciphertext
        let mut proof = Fields::new(&proof);
        let server_code = Zeroizing::new(proof.array::<SECURITY_CODE_LEN>()?);
        let expected = hmac_sha256(&*server_code, &[&packet[..MASKED_END + OFFER_CT_LEN]]);
        if !ct_eq(&expected, proof.take(MAC_LEN)?) {
            return Err(HandshakeError::WrongHandshakeResponse);
        }

        let mut offer = Fields::new(&offer);
        let server_iv_seed = Zeroizing::new(offer.array::<IV_SEED_LEN>()?);
        let server_keys = Zeroizing::new(offer.take(KEY_BLOB_LEN)?.to_vec());
        let server_cipher = u16::from_be_bytes(offer.array()?);

        let material = KeyMaterial {
            client_keys: random_key_blob(),
            server_keys,
            client_cipher: Catalog::random_id(),
            server_cipher,
            client_code: Zeroizing::new(random_array()),
            server_code,
            client_iv_seed: Zeroizing::new(random_array()),
            server_iv_seed,
            timeout_hint: self.timeout_hint,
        };

        let mut confirm = Zeroizing::new(Vec::with_capacity(CONFIRM_LEN));
        confirm.extend_from_slice(&*material.client_iv_seed);
        confirm.extend_from_slice(&material.client_keys);
        confirm.extend_from_slice(&material.client_cipher.to_be_bytes());
        confirm.extend_from_slice(&*material.server_code);
        confirm.extend_from_slice(&*material.client_code);
        confirm.extend_from_slice(&material.timeout_hint.to_be_bytes());

        let body = server_ephemeral.encrypt(&confirm)?;
        Ok((tag_message(self.identity.id(), body), material))
    }
}

impl HandshakeMachine for ClientHandshake {
    fn expected_len(&self) -> usize {
        match self.state {
            ClientState::AwaitingMessage2 { .. } => MESSAGE2_LEN,
            ClientState::AwaitingMessage4 { .. } => MESSAGE4_LEN,
            _ => 0,
        }
    }

    fn check(&mut self, fixed: &[u8]) -> Result<usize, HandshakeError> {
        if fixed.len() != self.expected_len() {
            return Err(HandshakeError::Decode("unexpected message length"));
        }
        match std::mem::replace(&mut self.state, ClientState::Failed) {
            ClientState::AwaitingMessage2 { ephemeral } => {
                let tail = verify_message(&self.server_fingerprint, fixed)
                    .ok_or(HandshakeError::WrongHandshakeResponse)?;
                trace!("Message 2 tag verified, tail {} bytes", tail);
                self.state = ClientState::Message2Received {
                    ephemeral,
                    packet: fixed.to_vec(),
                };
                Ok(tail)
            }
            ClientState::AwaitingMessage4 { ephemeral, material } => {
                let tail = verify_message(&self.server_fingerprint, fixed)
                    .ok_or(HandshakeError::WrongHandshakeResponse)?;
                self.state = ClientState::Message4Received {
                    ephemeral,
                    material,
                    packet: fixed.to_vec(),
                };
                Ok(tail)
            }
            other => {
                let name = other.name();
                self.state = other;
                Err(HandshakeError::InvalidState(name))
            }
        }
    }

    fn advance(&mut self) -> Result<Step, HandshakeError> {
        match std::mem::replace(&mut self.state, ClientState::Failed) {
            ClientState::Start => {
                let ephemeral = KemKeyPair::generate();
                let message = self.message1(&ephemeral)?;
                self.state = ClientState::AwaitingMessage2 { ephemeral };
                Ok(Step::Send(message))
            }
            ClientState::Message2Received { ephemeral, packet } => {
                let (message, material) = self.message3(&ephemeral, &packet)?;
                self.state = ClientState::AwaitingMessage4 {
                    ephemeral,
                    material: Box::new(material),
                };
                Ok(Step::Send(message))
            }
            ClientState::Message4Received {
                ephemeral,
                material,
                packet,
            } => {
                let code = ephemeral.decrypt(&packet[..packet.len() - TAG_LEN])?;
                if !ct_eq(&code, &*material.client_code) {
                    return Err(HandshakeError::WrongHandshakeResponse);
                }
                self.state = ClientState::Complete;
                debug!("Client handshake complete");
                Ok(Step::Complete {
                    reply: None,
                    keys: SessionKeys::new(*material),
                })
            }
            other => {
                let name = other.name();
                self.state = other;
                Err(HandshakeError::InvalidState(name))
            }
        }
    }

    fn state_name(&self) -> &'static str {
        self.state.name()
    }
}

/// What the server offered in message 2
struct ServerOffer {
    iv_seed: Zeroizing<[u8; IV_SEED_LEN]>,
    keys: Zeroizing<Vec<u8>>,
    cipher: u16,
    code: Zeroizing<[u8; SECURITY_CODE_LEN]>,
}

enum ServerState {
    AwaitingMessage1,
    Message1Received {
        client: ClientId,
        client_ephemeral: KemPublicKey,
    },
    AwaitingMessage3 {
        client: ClientId,
        client_ephemeral: KemPublicKey,
        ephemeral: KemKeyPair,
        offer: Box<ServerOffer>,
    },
    Message3Received {
        client: ClientId,
        client_ephemeral: KemPublicKey,
        ephemeral: KemKeyPair,
        offer: Box<ServerOffer>,
        packet: Vec<u8>,
    },
    Complete {
        client: ClientId,
    },
    Failed,
}

impl ServerState {
    fn name(&self) -> &'static str {
        match self {
            ServerState::AwaitingMessage1 => "AwaitingMessage1",
            ServerState::Message1Received { .. } => "Message1Received",
            ServerState::AwaitingMessage3 { .. } => "AwaitingMessage3",
            ServerState::Message3Received { .. } => "Message3Received",
            ServerState::Complete { .. } => "Complete",
            ServerState::Failed => "Failed",
        }
    }
}

/// Responder side of the handshake
pub struct ServerHandshake {
    identity: Arc<ServerIdentity>,
    replay: Arc<ReplayGuard>,
    state: ServerState,
}

impl ServerHandshake {
    /// Prepare to receive message 1
    pub fn new(identity: Arc<ServerIdentity>, replay: Arc<ReplayGuard>) -> Self {
        Self {
            identity,
            replay,
            state: ServerState::AwaitingMessage1,
        }
    }

    /// Client identified by message 1, once known
    pub fn peer(&self) -> Option<&ClientId> {
        match &self.state {
            ServerState::Message1Received { client, .. }
            | ServerState::AwaitingMessage3 { client, .. }
            | ServerState::Message3Received { client, .. }
            | ServerState::Complete { client } => Some(client),
            _ => None,
        }
    }

    /// Identity guessing: the first registered id whose tag verifies
    fn identify(&self, fixed: &[u8]) -> Option<(ClientId, usize)> {
        self.identity
            .client_ids()
            .find_map(|id| verify_message(id, fixed).map(|tail| (*id, tail)))
    }

    fn message2(
        &self,
        client: &ClientId,
        client_ephemeral: &KemPublicKey,
        ephemeral: &KemKeyPair,
        offer: &ServerOffer,
    ) -> Result<Vec<u8>, HandshakeError> {
        let fingerprint = self.identity.fingerprint();
        let iv: [u8; IV_LEN] = random_array();

        let mut body = Vec::with_capacity(MESSAGE2_LEN);
        body.extend_from_slice(&iv);
        body.extend_from_slice(&masked_public(fingerprint, &iv, ephemeral)?);

        let mut plain = Zeroizing::new(Vec::with_capacity(OFFER_LEN));
        plain.extend_from_slice(&*offer.iv_seed);
        plain.extend_from_slice(&offer.keys);
        plain.extend_from_slice(&offer.cipher.to_be_bytes());
        body.extend_from_slice(&client_ephemeral.encrypt(&plain)?);

        let mac = hmac_sha256(&*offer.code, &[&body]);
        let mut proof = Zeroizing::new(Vec::with_capacity(PROOF_LEN));
        proof.extend_from_slice(&*offer.code);
        proof.extend_from_slice(&mac);

        let client_public = self
            .identity
            .client(client)
            .ok_or(HandshakeError::UnknownIdentity)?;
        body.extend_from_slice(&client_public.encrypt(&proof)?);

        Ok(tag_message(fingerprint, body))
    }
}

impl HandshakeMachine for ServerHandshake {
    fn expected_len(&self) -> usize {
        match self.state {
            ServerState::AwaitingMessage1 => MESSAGE1_LEN,
            ServerState::AwaitingMessage3 { .. } => MESSAGE3_LEN,
            _ => 0,
        }
    }

    fn check(&mut self, fixed: &[u8]) -> Result<usize, HandshakeError> {
        if fixed.len() != self.expected_len() {
            return Err(HandshakeError::Decode("unexpected message length"));
        }
        match std::mem::replace(&mut self.state, ServerState::Failed) {
            ServerState::AwaitingMessage1 => {
                let (client, tail) = self.identify(fixed).ok_or(HandshakeError::UnknownIdentity)?;

                let tag = &fixed[MESSAGE1_LEN - TAG_LEN..];
                if !self.replay.check_and_insert(tag_id(tag)) {
                    return Err(HandshakeError::ReplayDetected);
                }

                let client_ephemeral = unmask_public(
                    self.identity.fingerprint(),
                    &fixed[..IV_LEN],
                    &fixed[IV_LEN..MASKED_END],
                )?;
                trace!("Message 1 matched a registered client, tail {} bytes", tail);
                self.state = ServerState::Message1Received {
                    client,
                    client_ephemeral,
                };
                Ok(tail)
            }
            ServerState::AwaitingMessage3 {
                client,
                client_ephemeral,
                ephemeral,
                offer,
            } => {
                let tail = verify_message(&client, fixed).ok_or(HandshakeError::TagMismatch)?;
                self.state = ServerState::Message3Received {
                    client,
                    client_ephemeral,
                    ephemeral,
                    offer,
                    packet: fixed.to_vec(),
                };
                Ok(tail)
            }
            other => {
                let name = other.name();
                self.state = other;
                Err(HandshakeError::InvalidState(name))
            }
        }
    }

    fn advance(&mut self) -> Result<Step, HandshakeError> {
        match std::mem::replace(&mut self.state, ServerState::Failed) {
            ServerState::Message1Received {
                client,
                client_ephemeral,
            } => {
                let ephemeral = KemKeyPair::generate();
                let offer = ServerOffer {
                    iv_seed: Zeroizing::new(random_array()),
                    keys: random_key_blob(),
                    cipher: Catalog::random_id(),
                    code: Zeroizing::new(random_array()),
                };
                let message = self.message2(&client, &client_ephemeral, &ephemeral, &offer)?;
                self.state = ServerState::AwaitingMessage3 {
                    client,
                    client_ephemeral,
                    ephemeral,
                    offer: Box::new(offer),
                };
                Ok(Step::Send(message))
            }
            ServerState::Message3Received {
                client,
                client_ephemeral,
                ephemeral,
                offer,
                packet,
            } => {
                let confirm = ephemeral.decrypt(&packet[..packet.len() - TAG_LEN])?;
                let mut fields = Fields::new(&confirm);
                let client_iv_seed = Zeroizing::new(fields.array::<IV_SEED_LEN>()?);
                let client_keys = Zeroizing::new(fields.take(KEY_BLOB_LEN)?.to_vec());
                let client_cipher = u16::from_be_bytes(fields.array()?);

                // The echoed code proves the client decrypted message 2
                if !ct_eq(fields.take(SECURITY_CODE_LEN)?, &*offer.code) {
                    return Err(HandshakeError::WrongHandshakeResponse);
                }
                let client_code = Zeroizing::new(fields.array::<SECURITY_CODE_LEN>()?);
                let timeout_hint = u64::from_be_bytes(fields.array()?);
                if timeout_hint > MAX_TIMEOUT_HINT {
                    return Err(HandshakeError::Decode("timeout hint out of range"));
                }

                let reply = tag_message(
                    self.identity.fingerprint(),
                    client_ephemeral.encrypt(&*client_code)?,
                );

                let offer = *offer;
                let material = KeyMaterial {
                    client_keys,
                    server_keys: offer.keys,
                    client_cipher,
                    server_cipher: offer.cipher,
                    client_code,
                    server_code: offer.code,
                    client_iv_seed,
                    server_iv_seed: offer.iv_seed,
                    timeout_hint,
                };

                self.state = ServerState::Complete { client };
                debug!("Server handshake complete");
                Ok(Step::Complete {
                    reply: Some(reply),
                    keys: SessionKeys::new(material),
                })
            }
            other => {
                let name = other.name();
                self.state = other;
                Err(HandshakeError::InvalidState(name))
            }
        }
    }

    fn state_name(&self) -> &'static str {
        self.state.name()
    }
}
