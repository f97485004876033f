//! Session crypto: X25519 key agreement and XChaCha20-Poly1305 payloads.
//!
//! Each handshake pairs a fresh broker [`SessionKeypair`] with the peer's
//! ephemeral public key. The X25519 shared secret is expanded with
//! HKDF-SHA256 into [`SessionKeys`]: one key seals client requests and a
//! second, independent key seals broker replies. A reply nonce equals the
//! client's next request nonce, so the two directions must never share a key.
//!
//! # Nonces
//!
//! Nonces are 24 bytes and are compared as little-endian integers. The
//! caller owns uniqueness: the broker keeps one strictly increasing counter
//! per direction and never asks this module to invent a nonce mid-session.

use std::cmp::Ordering;
use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{
    BROKER_KEY_INFO, CLIENT_KEY_INFO, NONCE_LEN, PUBLIC_KEY_LEN, SESSION_KEY_LEN,
};
use crate::error::{BridgeError, Result};

/// X25519 keypair used for one handshake.
pub struct SessionKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl fmt::Debug for SessionKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeypair")
            .field("public", &encode_base64(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

impl SessionKeypair {
    /// Generate a keypair from the thread-local CSPRNG.
    pub fn generate() -> Self {
        let mut secret_bytes = [0u8; PUBLIC_KEY_LEN];
        rand::rng().fill_bytes(&mut secret_bytes);
        let secret = StaticSecret::from(secret_bytes);
        secret_bytes.zeroize();
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Raw public key bytes.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public.to_bytes()
    }

    /// Base64 public key, as sent on the wire.
    pub fn public_key_base64(&self) -> String {
        encode_base64(self.public.as_bytes())
    }
}

/// Symmetric key for one direction of a session. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for SessionKey {}

/// The pair of directional keys for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    /// Seals requests sent by the client.
    pub client_to_broker: SessionKey,
    /// Seals replies sent by the broker.
    pub broker_to_client: SessionKey,
}

/// Derive the session keys shared between `local` and the owner of `peer_public`.
///
/// Both sides obtain the same pair when each passes its own keypair and the
/// other's public key.
///
/// # Errors
///
/// [`BridgeError::InvalidPeerKey`] if the key is not 32 bytes or is a
/// low-order point (the exchange would not be contributory).
pub fn derive_session_keys(local: &SessionKeypair, peer_public: &[u8]) -> Result<SessionKeys> {
    let Ok(peer_bytes) = <[u8; PUBLIC_KEY_LEN]>::try_from(peer_public) else {
        return Err(BridgeError::InvalidPeerKey);
    };
    let shared = local.secret.diffie_hellman(&PublicKey::from(peer_bytes));
    if !shared.was_contributory() {
        return Err(BridgeError::InvalidPeerKey);
    }

    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    Ok(SessionKeys {
        client_to_broker: expand_key(&hk, CLIENT_KEY_INFO),
        broker_to_client: expand_key(&hk, BROKER_KEY_INFO),
    })
}

fn expand_key(hk: &Hkdf<Sha256>, info: &[u8]) -> SessionKey {
    let mut okm = [0u8; SESSION_KEY_LEN];
    hk.expand(info, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length, cannot fail");
    SessionKey(okm)
}

/// Seal `plaintext` under `key` and `nonce`.
pub fn encrypt(key: &SessionKey, nonce: &Nonce, plaintext: &[u8]) -> Vec<u8> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key.0));
    cipher
        .encrypt(XNonce::from_slice(&nonce.0), plaintext)
        .expect("payloads are bounded far below the AEAD length limit")
}

/// Open `ciphertext` sealed under `key` and `nonce`.
///
/// # Errors
///
/// [`BridgeError::AuthenticationFailed`] when the tag does not verify.
pub fn decrypt(key: &SessionKey, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key.0));
    cipher
        .decrypt(XNonce::from_slice(&nonce.0), ciphertext)
        .or(Err(BridgeError::AuthenticationFailed))
}

/// 24-byte nonce ordered as a little-endian integer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nonce([u8; NONCE_LEN]);

impl Nonce {
    /// Random starting nonce.
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Nonce from raw bytes.
    pub const fn from_bytes(bytes: [u8; NONCE_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }

    /// Decode a base64 nonce from the wire.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = decode_base64(encoded)?;
        let Ok(bytes) = <[u8; NONCE_LEN]>::try_from(bytes.as_slice()) else {
            return Err(BridgeError::Parse(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                bytes.len()
            )));
        };
        Ok(Self(bytes))
    }

    /// Base64 encoding for the wire.
    pub fn to_base64(&self) -> String {
        encode_base64(&self.0)
    }

    /// The next nonce (little-endian add with carry, wrapping at the top).
    #[must_use]
    pub fn increment(&self) -> Self {
        let mut next = self.0;
        for byte in &mut next {
            let (value, overflow) = byte.overflowing_add(1);
            *byte = value;
            if !overflow {
                break;
            }
        }
        Self(next)
    }
}

impl Ord for Nonce {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.iter().rev().cmp(other.0.iter().rev())
    }
}

impl PartialOrd for Nonce {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({})", self.to_base64())
    }
}

/// Standard base64 encoding.
pub fn encode_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Standard base64 decoding.
///
/// # Errors
///
/// [`BridgeError::Parse`] on invalid input.
pub fn decode_base64(encoded: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(encoded)
        .map_err(|e| BridgeError::Parse(format!("invalid base64: {e}")))
}
