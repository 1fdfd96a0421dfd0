//! Identifiers, key metadata, statements and boxes.
//!
//! Everything here is plain data. Statements and box metadata travel over the
//! wire as JSON; field declaration order is the canonical serialization order.

use std::fmt;

use ephemera_crypto::{EkSeed, Kid};
use serde::{Deserialize, Serialize};

use crate::error::EkError;

/// Generation number of an ephemeral key. The first key ever minted for a
/// subject is generation 1.
pub type EkGeneration = u64;

/// Seconds since the Unix epoch, as reported by the merkle root.
pub type UnixSecs = u64;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Wrap an identifier string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// User identifier.
    Uid
);
string_id!(
    /// Device identifier.
    DeviceId
);
string_id!(
    /// Team identifier.
    TeamId
);

/// Scope an ephemeral key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EkScope {
    /// Owned by one device; never leaves it
    Device,
    /// Shared by all of a user's active devices
    User,
    /// Shared by all members of a team
    Team,
}

impl fmt::Display for EkScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Device => "device",
            Self::User => "user",
            Self::Team => "team",
        })
    }
}

/// Commitment to a merkle root, hex on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HashMeta(pub [u8; 32]);

impl fmt::Debug for HashMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashMeta({})", hex::encode(self.0))
    }
}

impl TryFrom<String> for HashMeta {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let raw = hex::decode(&value).map_err(|e| e.to_string())?;
        let bytes: [u8; 32] =
            raw.as_slice().try_into().map_err(|_| format!("expected 32 bytes, got {}", raw.len()))?;
        Ok(Self(bytes))
    }
}

impl From<HashMeta> for String {
    fn from(meta: HashMeta) -> Self {
        hex::encode(meta.0)
    }
}

/// Trusted `(ctime, hash_meta)` pair fetched from the merkle tree.
///
/// The single source of "now" for every staleness decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MerkleRoot {
    /// Server time at which the root was produced
    pub ctime: UnixSecs,
    /// Commitment to the root
    pub hash_meta: HashMeta,
}

/// Public description of one ephemeral key. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EkMetadata {
    /// Identifier (and public half) of the derived DH key
    pub kid: Kid,
    /// Generation of this key, starting at 1
    pub generation: EkGeneration,
    /// Merkle commitment at creation time
    pub hash_meta: HashMeta,
    /// Merkle ctime at creation time. Derivable from `hash_meta`, carried to
    /// save readers a round trip.
    pub ctime: UnixSecs,
}

/// Signed document naming the latest generation and the still-valid prior
/// generations for a subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EkStatement {
    /// Latest key
    pub current_metadata: EkMetadata,
    /// Prior keys still within their lifetime when this statement was built
    pub existing_metadata: Vec<EkMetadata>,
}

impl EkStatement {
    /// Check the structural invariants of a statement received from a server.
    ///
    /// # Errors
    ///
    /// - `Malformed` if the current generation is 0 or is not strictly the
    ///   maximum generation referenced
    pub fn validate(&self) -> Result<(), EkError> {
        let current = self.current_metadata.generation;
        if current == 0 {
            return Err(EkError::Malformed("statement names generation 0".to_string()));
        }
        if let Some(bad) = self.existing_metadata.iter().find(|m| m.generation >= current) {
            return Err(EkError::Malformed(format!(
                "existing generation {} is not below current generation {current}",
                bad.generation
            )));
        }
        Ok(())
    }
}

/// Statement signed by a device's signing key.
pub type DeviceEkStatement = EkStatement;
/// Statement signed by the user's latest per-user key.
pub type UserEkStatement = EkStatement;
/// Statement signed by the team's signing key.
pub type TeamEkStatement = EkStatement;

/// A user key seed sealed to one device, as uploaded with a statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEkBoxMetadata {
    /// Device the box is sealed to
    pub recipient_device_id: DeviceId,
    /// Generation of the recipient's device key
    pub recipient_generation: EkGeneration,
    /// Generation of the boxed user key
    pub generation: EkGeneration,
    /// Hex-encoded sealed box
    pub sealed_box: String,
}

/// A team key seed sealed to one member's user key, as uploaded with a
/// statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamEkBoxMetadata {
    /// Member the box is sealed to
    pub recipient_uid: Uid,
    /// Generation of the recipient's user key
    pub recipient_generation: EkGeneration,
    /// Generation of the boxed team key
    pub generation: EkGeneration,
    /// Hex-encoded sealed box
    pub sealed_box: String,
}

/// A box addressed to this device (or this user), as kept by a box store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EkBoxed {
    /// Hex-encoded sealed box
    pub sealed_box: String,
    /// Generation of the key the box is sealed to
    pub recipient_generation: EkGeneration,
    /// Metadata of the boxed key
    pub metadata: EkMetadata,
}

/// Unboxed device key material.
#[derive(Debug, Clone)]
pub struct DeviceEk {
    /// Secret seed
    pub seed: EkSeed,
    /// Public metadata
    pub metadata: EkMetadata,
}

/// Unboxed user key material.
#[derive(Debug, Clone)]
pub struct UserEk {
    /// Secret seed
    pub seed: EkSeed,
    /// Public metadata
    pub metadata: EkMetadata,
}

/// Unboxed team key material.
#[derive(Debug, Clone)]
pub struct TeamEk {
    /// Secret seed
    pub seed: EkSeed,
    /// Public metadata
    pub metadata: EkMetadata,
}

/// One of a user's active devices, as a box recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEkRecipient {
    /// Device owning the key
    pub device_id: DeviceId,
    /// Device key identifier
    pub kid: Kid,
    /// Device key generation
    pub generation: EkGeneration,
}

/// One team member's current user key, as a box recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEkRecipient {
    /// Member owning the key
    pub uid: Uid,
    /// User key identifier
    pub kid: Kid,
    /// User key generation
    pub generation: EkGeneration,
}
