//! Anonymous sealed boxes to X25519 recipients.
//!
//! All functions are pure - the sender secret and nonce must be provided by
//! the caller. A fresh sender secret per box keeps boxes unlinkable to the
//! publisher and to each other.

use std::fmt;

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::{
    error::CryptoError,
    kid::{KeyType, Kid},
};

/// Size of the `XChaCha20` nonce (24 bytes)
pub const NONCE_SIZE: usize = 24;

/// Label used to derive the box key from the DH shared secret
const BOX_KEY_LABEL: &[u8] = b"ephemeraSealedBoxV1";

/// Poly1305 tag size (16 bytes)
const POLY1305_TAG_SIZE: usize = 16;

/// X25519 public key of a box recipient.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DhPublicKey(PublicKey);

impl DhPublicKey {
    /// Wrap raw public key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(PublicKey::from(bytes))
    }

    /// Import a recipient key from its identifier.
    ///
    /// # Errors
    ///
    /// - `InvalidKid` if the identifier names a non-DH key
    pub fn from_kid(kid: &Kid) -> Result<Self, CryptoError> {
        if kid.key_type() != KeyType::X25519 {
            return Err(CryptoError::InvalidKid {
                reason: format!("{kid} is not a DH key"),
            });
        }
        Ok(Self::from_bytes(kid.public_key_bytes()))
    }

    /// Raw public key bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Identifier for this key.
    pub fn kid(&self) -> Kid {
        Kid::new(KeyType::X25519, self.0.as_bytes())
    }

    /// Seal `plaintext` to this key.
    ///
    /// `sender_secret` is used for exactly this box and then dropped.
    ///
    /// # Security
    ///
    /// - Caller MUST provide fresh cryptographically secure bytes for both
    ///   `sender_secret` and `nonce` in production
    /// - The box key binds both public keys, so a box cannot be replayed to a
    ///   different recipient
    pub fn seal(
        &self,
        plaintext: &[u8],
        sender_secret: [u8; 32],
        nonce: [u8; NONCE_SIZE],
    ) -> SealedBox {
        let sender = StaticSecret::from(sender_secret);
        let sender_public = PublicKey::from(&sender);
        let shared = sender.diffie_hellman(&self.0);
        let key = box_key(shared.as_bytes(), sender_public.as_bytes(), self.0.as_bytes());

        let cipher = XChaCha20Poly1305::new((&*key).into());
        let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(&nonce), plaintext) else {
            unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
        };

        SealedBox { sender_public: sender_public.to_bytes(), nonce, ciphertext }
    }
}

impl fmt::Debug for DhPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DhPublicKey({})", self.kid())
    }
}

/// X25519 key pair able to open boxes sealed to its public half.
#[derive(Clone)]
pub struct DhKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl DhKeyPair {
    /// Build a key pair from 32 secret bytes.
    pub fn from_secret_bytes(secret: [u8; 32]) -> Self {
        let secret = StaticSecret::from(secret);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public half.
    pub fn public_key(&self) -> DhPublicKey {
        DhPublicKey(self.public)
    }

    /// Identifier of the public half.
    pub fn kid(&self) -> Kid {
        self.public_key().kid()
    }

    /// Open a box sealed to this key pair.
    ///
    /// # Errors
    ///
    /// - `OpenFailed` if the box was sealed to a different key or tampered
    pub fn open(&self, sealed: &SealedBox) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let sender_public = PublicKey::from(sealed.sender_public);
        let shared = self.secret.diffie_hellman(&sender_public);
        if !shared.was_contributory() {
            return Err(CryptoError::OpenFailed);
        }
        let key = box_key(shared.as_bytes(), sender_public.as_bytes(), self.public.as_bytes());

        let cipher = XChaCha20Poly1305::new((&*key).into());
        cipher
            .decrypt(XNonce::from_slice(&sealed.nonce), sealed.ciphertext.as_slice())
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::OpenFailed)
    }
}

impl fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhKeyPair").field("kid", &self.kid()).finish_non_exhaustive()
    }
}

/// Ciphertext of a payload sealed to one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBox {
    /// One-time sender public key
    pub sender_public: [u8; 32],
    /// The 24-byte `XChaCha20` nonce
    pub nonce: [u8; NONCE_SIZE],
    /// The ciphertext including 16-byte Poly1305 tag
    pub ciphertext: Vec<u8>,
}

impl SealedBox {
    /// Encode as `sender_public || nonce || ciphertext` in hex.
    pub fn to_hex(&self) -> String {
        let mut raw = Vec::with_capacity(32 + NONCE_SIZE + self.ciphertext.len());
        raw.extend_from_slice(&self.sender_public);
        raw.extend_from_slice(&self.nonce);
        raw.extend_from_slice(&self.ciphertext);
        hex::encode(raw)
    }

    /// Decode the hex form produced by [`Self::to_hex`].
    ///
    /// # Errors
    ///
    /// - `InvalidBox` on bad hex or a payload too short to hold a tag
    pub fn from_hex(encoded: &str) -> Result<Self, CryptoError> {
        let raw =
            hex::decode(encoded).map_err(|e| CryptoError::InvalidBox { reason: e.to_string() })?;
        let header = 32 + NONCE_SIZE;
        if raw.len() < header + POLY1305_TAG_SIZE {
            return Err(CryptoError::InvalidBox {
                reason: format!("{} bytes is too short", raw.len()),
            });
        }

        let mut sender_public = [0u8; 32];
        sender_public.copy_from_slice(&raw[..32]);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&raw[32..header]);

        Ok(Self { sender_public, nonce, ciphertext: raw[header..].to_vec() })
    }
}

/// Derive the AEAD key for one box.
///
/// info = label || `sender_public` || `recipient_public`
fn box_key(
    shared: &[u8; 32],
    sender_public: &[u8; 32],
    recipient_public: &[u8; 32],
) -> Zeroizing<[u8; 32]> {
    let hkdf = Hkdf::<Sha256>::new(None, shared);

    let mut info = Vec::with_capacity(BOX_KEY_LABEL.len() + 64);
    info.extend_from_slice(BOX_KEY_LABEL);
    info.extend_from_slice(sender_public);
    info.extend_from_slice(recipient_public);

    let mut key = Zeroizing::new([0u8; 32]);
    let Ok(()) = hkdf.expand(&info, &mut key[..]) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    key
}
