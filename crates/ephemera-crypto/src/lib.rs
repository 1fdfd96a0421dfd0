//! Ephemera Cryptographic Primitives
//!
//! Cryptographic building blocks for ephemeral keys. Pure functions with
//! deterministic outputs. Callers provide random bytes for deterministic
//! testing.
//!
//! # Key Lifecycle
//!
//! Every ephemeral key starts as a 32-byte [`EkSeed`]. The seed itself carries
//! no scope; the scope is fixed by the deriver applied to it. Each deriver
//! runs HKDF with its own label, so the same seed bytes yield unrelated key
//! pairs at device, user and team scope.
//!
//! ```text
//! EkSeed (32 random bytes)
//!        │
//!        ├── HKDF("...DeviceEk...") → DeviceEkKeyPair
//!        ├── HKDF("...UserEk...")   → UserEkKeyPair
//!        └── HKDF("...TeamEk...")   → TeamEkKeyPair
//!
//! seed bytes ── seal(recipient DH public key, fresh sender secret) → SealedBox
//! statement  ── sign(identity signing key) → signed envelope (kid, payload, sig)
//! ```
//!
//! # Security
//!
//! Forward Secrecy:
//! - Seeds and derived secrets are zeroized on drop
//! - Boxes are sealed with a fresh sender secret per box, so a box reveals
//!   nothing about the publisher's long-term identity
//!
//! Scope Isolation:
//! - Distinct HKDF labels per scope
//! - Distinct Rust types per scope (`DeviceEkKeyPair` is not a `UserEkKeyPair`)
//!
//! Authenticity:
//! - XChaCha20-Poly1305 AEAD on every box
//! - Ed25519 signatures over a domain-separated statement payload
//! - The signer's [`Kid`] travels with the signature and is checked by callers

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod derivation;
mod error;
mod kid;
mod sealed_box;
mod signing;

pub use derivation::{
    DeviceEkKeyPair, EkSeed, SEED_SIZE, TeamEkKeyPair, UserEkKeyPair, derive_device_key,
    derive_team_key, derive_user_key,
};
pub use error::CryptoError;
pub use kid::{KeyType, Kid};
pub use sealed_box::{DhKeyPair, DhPublicKey, NONCE_SIZE, SealedBox};
pub use signing::{SigningKeyPair, verify_and_extract};
