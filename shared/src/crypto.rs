//! Identities and message sealing.
//!
//! A sealed message is readable only by its recipient and proves which
//! identity sent it. Key agreement is X25519 between the sender's static key,
//! a fresh ephemeral key and the recipient's static key; the payload is
//! ChaCha20-Poly1305 under an HKDF-SHA256 derived key.
//!
//! Payload layout: `version(1) | sender(32) | ephemeral(32) | nonce(12) | ciphertext+tag`

use std::fmt;
use std::str::FromStr;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{Error, Result};

/// Sealed payload format version
pub const SEAL_VERSION: u8 = 1;

const SEAL_INFO: &[u8] = b"ntunnel-seal-v1";
const HEADER_LEN: usize = 1 + 32 + 32 + 12;

/// Public X25519 key naming a tunnel participant
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identity([u8; 32]);

impl Identity {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 12 hex characters, for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({}…)", self.short())
    }
}

impl FromStr for Identity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(Self(decode_key(s)?))
    }
}

/// X25519 keypair owned by an agent or client instance
#[derive(Clone)]
pub struct Keypair {
    secret: StaticSecret,
    identity: Identity,
}

impl Keypair {
    /// Generate a new keypair from OS randomness
    pub fn generate() -> Self {
        Self::from_secret_bytes(random_bytes())
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let identity = Identity(PublicKey::from(&secret).to_bytes());
        Self { secret, identity }
    }

    /// Parse a hex-encoded 32 byte secret
    pub fn from_hex(s: &str) -> Result<Self> {
        Ok(Self::from_secret_bytes(decode_key(s)?))
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret.to_bytes())
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    fn shared_secret(&self, peer: &Identity) -> [u8; 32] {
        self.secret
            .diffie_hellman(&PublicKey::from(peer.0))
            .to_bytes()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// Symmetric session derived for a single sealed message
struct Session {
    cipher: ChaCha20Poly1305,
}

impl Session {
    fn derive(ikm: &[u8], salt: &[u8]) -> Result<Self> {
        let mut key = [0u8; 32];
        Hkdf::<Sha256>::new(Some(salt), ikm)
            .expand(SEAL_INFO, &mut key)
            .map_err(|e| Error::Seal(format!("key derivation failed: {}", e)))?;
        Ok(Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
        })
    }

    fn encrypt(&self, nonce: &[u8; 12], plaintext: &[u8]) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|_| Error::Seal("encryption failed".into()))
    }

    fn decrypt(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Unwrap("authentication failed".into()))
    }
}

/// Opaque unit carried by the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedMessage {
    pub recipient: Identity,
    pub payload: Vec<u8>,
}

impl SealedMessage {
    /// Content-derived identifier: identical deliveries share it
    pub fn id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.recipient.as_bytes());
        hasher.update(&self.payload);
        hex::encode(hasher.finalize())
    }
}

/// Seal `plaintext` from `sender` so only `recipient` can open it
pub fn wrap(sender: &Keypair, recipient: &Identity, plaintext: &[u8]) -> Result<SealedMessage> {
    let ephemeral = Keypair::generate();
    let session = Session::derive(
        &agreement(sender, &ephemeral, recipient),
        ephemeral.identity.as_bytes(),
    )?;

    let mut nonce = [0u8; 12];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = session.encrypt(&nonce, plaintext)?;

    let mut payload = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    payload.push(SEAL_VERSION);
    payload.extend_from_slice(sender.identity.as_bytes());
    payload.extend_from_slice(ephemeral.identity.as_bytes());
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&ciphertext);

    Ok(SealedMessage {
        recipient: *recipient,
        payload,
    })
}

/// Open a message addressed to `own`, returning the plaintext and its sender
pub fn unwrap(own: &Keypair, message: &SealedMessage) -> Result<(Vec<u8>, Identity)> {
    if message.recipient != own.identity {
        return Err(Error::Unwrap("message addressed to another identity".into()));
    }

    let payload = &message.payload;
    if payload.len() < HEADER_LEN {
        return Err(Error::Unwrap(format!(
            "payload too short ({} bytes)",
            payload.len()
        )));
    }
    if payload[0] != SEAL_VERSION {
        return Err(Error::Unwrap(format!(
            "unknown seal version {}",
            payload[0]
        )));
    }

    let sender = Identity(key_at(payload, 1));
    let ephemeral = Identity(key_at(payload, 33));
    let nonce = &payload[65..HEADER_LEN];

    // DH is symmetric: own x sender == sender x own, own x ephemeral == ephemeral x own
    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(&own.shared_secret(&sender));
    ikm[32..].copy_from_slice(&own.shared_secret(&ephemeral));

    let session = Session::derive(&ikm, ephemeral.as_bytes())?;
    let plaintext = session.decrypt(nonce, &payload[HEADER_LEN..])?;
    Ok((plaintext, sender))
}

fn agreement(sender: &Keypair, ephemeral: &Keypair, recipient: &Identity) -> [u8; 64] {
    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(&sender.shared_secret(recipient));
    ikm[32..].copy_from_slice(&ephemeral.shared_secret(recipient));
    ikm
}

fn key_at(payload: &[u8], offset: usize) -> [u8; 32] {
    let mut key = [0u8; 32];
    key.copy_from_slice(&payload[offset..offset + 32]);
    key
}

fn decode_key(s: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(s.trim()).map_err(|e| Error::InvalidKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| Error::InvalidKey(format!("expected 32 bytes, got {}", b.len())))
}

fn random_bytes() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes
}
