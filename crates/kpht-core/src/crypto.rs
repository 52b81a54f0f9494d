//! NaCl `crypto_box` primitives for the encrypted phase of the protocol.
//!
//! KeePassXC encrypts every message after the key exchange with
//! X25519 + XSalsa20-Poly1305 ("box"): the shared key is derived from our
//! session private key and the daemon's public key, and a MAC covers the
//! ciphertext, so a payload only opens for the intended key pair.
//!
//! # Security Properties
//!
//! - **Fresh keys**: [`KeyPair::generate`] draws 32 bytes from the thread
//!   CSPRNG for every client; nothing here is persisted.
//! - **Unique nonces**: every seal uses a new random 192-bit nonce.
//! - **Fail closed**: [`open_sealed`] returns [`Error::DecryptionFailed`]
//!   and no plaintext if the MAC does not verify.
//! - **Zeroed key material**: private key bytes live in [`Zeroizing`] and are
//!   wiped on drop; `Debug` shows `[REDACTED]`.
//!
//! # Example
//!
//! ```
//! use kpht_core::crypto::{open_sealed, seal, KeyPair};
//!
//! let ours = KeyPair::generate();
//! let theirs = KeyPair::generate();
//!
//! let sealed = seal(b"hello", theirs.public(), ours.secret()).unwrap();
//! let opened = open_sealed(
//!     sealed.nonce(),
//!     sealed.ciphertext(),
//!     ours.public(),
//!     theirs.secret(),
//! )
//! .unwrap();
//! assert_eq!(opened, b"hello");
//! ```

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::Aead;
use crypto_box::SalsaBox;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Size of an X25519 key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of the XSalsa20 nonce in bytes.
pub const NONCE_SIZE: usize = 24;

/// Size of the Poly1305 tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Fill a fresh nonce from the thread CSPRNG.
///
/// Also used for the plaintext correlation nonce and the client ID suffix.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce);
    nonce
}

/// An X25519 public key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey([u8; KEY_SIZE]);

impl PublicKey {
    /// Create a public key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Decode a base64 public key as sent on the wire.
    ///
    /// Returns `None` for invalid base64 or a wrong length.
    pub fn from_base64(encoded: &str) -> Option<Self> {
        decode_key(encoded).map(|bytes| Self(*bytes))
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Base64 encoding used on the wire.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    fn to_box_key(self) -> crypto_box::PublicKey {
        crypto_box::PublicKey::from(self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

/// An X25519 private key, zeroed on drop.
#[derive(Clone)]
pub struct SecretKey(Zeroizing<[u8; KEY_SIZE]>);

impl SecretKey {
    /// Generate a new random private key.
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; KEY_SIZE]);
        rand::rng().fill_bytes(&mut bytes[..]);
        Self(bytes)
    }

    /// Create a private key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Decode a base64 private key (as persisted in the config file).
    pub fn from_base64(encoded: &str) -> Option<Self> {
        decode_key(encoded).map(Self)
    }

    /// Base64 encoding for persistence. Handle the result as a secret.
    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(STANDARD.encode(&self.0[..]))
    }

    /// Derive the matching public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(*self.to_box_key().public_key().as_bytes())
    }

    fn to_box_key(&self) -> crypto_box::SecretKey {
        crypto_box::SecretKey::from(*self.0)
    }
}

impl PartialEq for SecretKey {
    fn eq(&self, other: &Self) -> bool {
        self.0[..] == other.0[..]
    }
}

impl Eq for SecretKey {}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

fn decode_key(encoded: &str) -> Option<Zeroizing<[u8; KEY_SIZE]>> {
    let decoded = Zeroizing::new(STANDARD.decode(encoded.trim()).ok()?);
    let mut bytes = Zeroizing::new([0u8; KEY_SIZE]);
    if decoded.len() != KEY_SIZE {
        return None;
    }
    bytes.copy_from_slice(&decoded);
    Some(bytes)
}

/// A private/public key pair.
#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh key pair.
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::generate())
    }

    /// Rebuild a key pair around an existing private key.
    pub fn from_secret(secret: SecretKey) -> Self {
        let public = secret.public_key();
        Self { secret, public }
    }

    /// The private half.
    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    /// The public half.
    pub fn public(&self) -> &PublicKey {
        &self.public
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("secret", &self.secret)
            .field("public", &self.public)
            .finish()
    }
}

/// A sealed payload: the nonce and the ciphertext (including the MAC).
#[derive(Clone, PartialEq, Eq)]
pub struct SealedPayload {
    nonce: [u8; NONCE_SIZE],
    ciphertext: Vec<u8>,
}

impl SealedPayload {
    /// The nonce the payload was sealed with.
    pub fn nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.nonce
    }

    /// The ciphertext, MAC included.
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// `nonce || ciphertext`, the layout NaCl's "easy" API uses.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(NONCE_SIZE + self.ciphertext.len());
        data.extend_from_slice(&self.nonce);
        data.extend_from_slice(&self.ciphertext);
        data
    }
}

impl fmt::Debug for SealedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedPayload")
            .field("nonce_len", &NONCE_SIZE)
            .field("ciphertext_len", &self.ciphertext.len())
            .finish()
    }
}

/// Seal `plaintext` for `peer`, authenticated with `own`, under a fresh nonce.
pub fn seal(plaintext: &[u8], peer: &PublicKey, own: &SecretKey) -> Result<SealedPayload> {
    let nonce = generate_nonce();
    let salsa_box = SalsaBox::new(&peer.to_box_key(), &own.to_box_key());
    let ciphertext = salsa_box
        .encrypt(GenericArray::from_slice(&nonce), plaintext)
        .map_err(|e| Error::EncryptionFailed(e.to_string()))?;
    Ok(SealedPayload { nonce, ciphertext })
}

/// Open a payload sealed by `peer` for `own`.
///
/// Fails with [`Error::DecryptionFailed`] on a wrong nonce length, a MAC
/// mismatch, or mismatched keys.
pub fn open_sealed(
    nonce: &[u8],
    ciphertext: &[u8],
    peer: &PublicKey,
    own: &SecretKey,
) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_SIZE {
        return Err(Error::DecryptionFailed);
    }
    let salsa_box = SalsaBox::new(&peer.to_box_key(), &own.to_box_key());
    salsa_box
        .decrypt(GenericArray::from_slice(nonce), ciphertext)
        .map_err(|_| Error::DecryptionFailed)
}

/// The session's key pair plus the daemon's key once it is known.
#[derive(Debug)]
pub struct CryptoSession {
    keys: KeyPair,
    peer: Option<PublicKey>,
}

impl CryptoSession {
    /// Start a session with a freshly generated key pair.
    pub fn new() -> Self {
        Self::with_keys(KeyPair::generate())
    }

    /// Start a session with the given key pair.
    pub fn with_keys(keys: KeyPair) -> Self {
        Self { keys, peer: None }
    }

    /// Our public key, sent in the clear during the key exchange.
    pub fn public_key(&self) -> &PublicKey {
        self.keys.public()
    }

    /// Record the daemon's public key.
    pub fn set_peer_key(&mut self, peer: PublicKey) {
        self.peer = Some(peer);
    }

    /// The daemon's public key, if the exchange happened.
    pub fn peer_key(&self) -> Option<&PublicKey> {
        self.peer.as_ref()
    }

    /// Seal a payload for the daemon.
    pub fn seal(&self, plaintext: &[u8]) -> Result<SealedPayload> {
        let peer = self.peer.as_ref().ok_or(Error::InvalidPeerKey)?;
        seal(plaintext, peer, self.keys.secret())
    }

    /// Open a payload from the daemon.
    pub fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let peer = self.peer.as_ref().ok_or(Error::InvalidPeerKey)?;
        open_sealed(nonce, ciphertext, peer, self.keys.secret())
    }
}

impl Default for CryptoSession {
    fn default() -> Self {
        Self::new()
    }
}
