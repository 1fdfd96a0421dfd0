//! Scope-specific key derivation from ephemeral seeds using HKDF

use std::fmt;

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{error::CryptoError, kid::Kid, sealed_box::DhKeyPair};

/// Size of an ephemeral seed in bytes
pub const SEED_SIZE: usize = 32;

/// Label used for device key derivation
const DEVICE_EK_LABEL: &[u8] = b"ephemeraDeviceEkDhV1";

/// Label used for user key derivation
const USER_EK_LABEL: &[u8] = b"ephemeraUserEkDhV1";

/// Label used for team key derivation
const TEAM_EK_LABEL: &[u8] = b"ephemeraTeamEkDhV1";

/// Secret random material from which one ephemeral key pair is derived.
///
/// The seed carries no scope. The deriver applied to it decides whether it
/// becomes a device, user or team key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct EkSeed([u8; SEED_SIZE]);

impl EkSeed {
    /// Wrap caller-provided random bytes.
    pub fn from_bytes(bytes: [u8; SEED_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse a seed recovered from an opened box.
    ///
    /// # Errors
    ///
    /// - `InvalidKeyLength` if `bytes` is not exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw: [u8; SEED_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKeyLength { expected: SEED_SIZE, actual: bytes.len() }
        })?;
        Ok(Self(raw))
    }

    /// Raw seed bytes.
    pub fn as_bytes(&self) -> &[u8; SEED_SIZE] {
        &self.0
    }
}

impl fmt::Debug for EkSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EkSeed").field(&"[REDACTED]").finish()
    }
}

macro_rules! scoped_key_pair {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug)]
        pub struct $name(DhKeyPair);

        impl $name {
            /// Underlying DH key pair.
            pub fn dh(&self) -> &DhKeyPair {
                &self.0
            }

            /// Identifier of the public half.
            pub fn kid(&self) -> Kid {
                self.0.kid()
            }
        }
    };
}

scoped_key_pair!(
    /// Key pair derived from a seed at device scope.
    DeviceEkKeyPair
);
scoped_key_pair!(
    /// Key pair derived from a seed at user scope.
    UserEkKeyPair
);
scoped_key_pair!(
    /// Key pair derived from a seed at team scope.
    TeamEkKeyPair
);

/// Derive the device-scope key pair for `seed`.
pub fn derive_device_key(seed: &EkSeed) -> DeviceEkKeyPair {
    DeviceEkKeyPair(derive_dh(seed, DEVICE_EK_LABEL))
}

/// Derive the user-scope key pair for `seed`.
pub fn derive_user_key(seed: &EkSeed) -> UserEkKeyPair {
    UserEkKeyPair(derive_dh(seed, USER_EK_LABEL))
}

/// Derive the team-scope key pair for `seed`.
pub fn derive_team_key(seed: &EkSeed) -> TeamEkKeyPair {
    TeamEkKeyPair(derive_dh(seed, TEAM_EK_LABEL))
}

fn derive_dh(seed: &EkSeed, label: &[u8]) -> DhKeyPair {
    let hkdf = Hkdf::<Sha256>::new(None, seed.as_bytes());

    let mut secret = Zeroizing::new([0u8; 32]);
    let Ok(()) = hkdf.expand(label, &mut secret[..]) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    DhKeyPair::from_secret_bytes(*secret)
}
