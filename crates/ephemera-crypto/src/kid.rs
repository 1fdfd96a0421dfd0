//! Public key identifiers.
//!
//! A [`Kid`] names a public key and also carries it, so a recipient key can
//! be re-imported from the identifier alone.
//!
//! Layout (35 bytes, hex on the wire):
//! - byte 0: version (`0x01`)
//! - byte 1: key type (`0x20` Ed25519, `0x21` X25519)
//! - bytes 2-33: public key
//! - byte 34: suffix (`0x0a`)

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CryptoError;

const KID_VERSION: u8 = 0x01;
const KID_SUFFIX: u8 = 0x0a;
const KID_SIZE: usize = 35;

/// Algorithm of the key named by a [`Kid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// Ed25519 signing key
    Ed25519,
    /// X25519 Diffie-Hellman key
    X25519,
}

impl KeyType {
    fn to_byte(self) -> u8 {
        match self {
            Self::Ed25519 => 0x20,
            Self::X25519 => 0x21,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x20 => Some(Self::Ed25519),
            0x21 => Some(Self::X25519),
            _ => None,
        }
    }
}

/// Public key identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Kid([u8; KID_SIZE]);

impl Kid {
    /// Build the identifier for a public key of the given type.
    pub fn new(key_type: KeyType, public_key: &[u8; 32]) -> Self {
        let mut bytes = [0u8; KID_SIZE];
        bytes[0] = KID_VERSION;
        bytes[1] = key_type.to_byte();
        bytes[2..34].copy_from_slice(public_key);
        bytes[34] = KID_SUFFIX;
        Self(bytes)
    }

    /// Parse a hex-encoded identifier.
    pub fn from_hex(encoded: &str) -> Result<Self, CryptoError> {
        let raw = hex::decode(encoded)
            .map_err(|e| CryptoError::InvalidKid { reason: e.to_string() })?;
        if raw.len() != KID_SIZE {
            return Err(CryptoError::InvalidKid {
                reason: format!("expected {KID_SIZE} bytes, got {}", raw.len()),
            });
        }
        if raw[0] != KID_VERSION || raw[34] != KID_SUFFIX {
            return Err(CryptoError::InvalidKid { reason: "bad framing bytes".to_string() });
        }
        if KeyType::from_byte(raw[1]).is_none() {
            return Err(CryptoError::InvalidKid {
                reason: format!("unknown key type {:#04x}", raw[1]),
            });
        }

        let mut bytes = [0u8; KID_SIZE];
        bytes.copy_from_slice(&raw);
        Ok(Self(bytes))
    }

    /// Key algorithm named by this identifier.
    pub fn key_type(&self) -> KeyType {
        // Constructors only admit known type bytes
        KeyType::from_byte(self.0[1]).unwrap_or(KeyType::Ed25519)
    }

    /// Raw public key carried by this identifier.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        let mut key = [0u8; 32];
        key.copy_from_slice(&self.0[2..34]);
        key
    }

    /// Hex encoding, as used on the wire.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Kid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Kid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kid({})", self.to_hex())
    }
}

impl TryFrom<String> for Kid {
    type Error = CryptoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<Kid> for String {
    fn from(kid: Kid) -> Self {
        kid.to_hex()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn hex_roundtrip_preserves_type_and_key() {
        let key = [7u8; 32];
        let kid = Kid::new(KeyType::X25519, &key);

        let parsed = Kid::from_hex(&kid.to_hex()).unwrap();
        assert_eq!(parsed, kid);
        assert_eq!(parsed.key_type(), KeyType::X25519);
        assert_eq!(parsed.public_key_bytes(), key);
    }

    #[test]
    fn different_types_produce_different_kids() {
        let key = [1u8; 32];
        assert_ne!(Kid::new(KeyType::X25519, &key), Kid::new(KeyType::Ed25519, &key));
    }

    #[test]
    fn rejects_wrong_length() {
        let result = Kid::from_hex("0120aa0a");
        assert!(matches!(result, Err(CryptoError::InvalidKid { .. })));
    }

    #[test]
    fn rejects_unknown_key_type() {
        let mut raw = Kid::new(KeyType::Ed25519, &[0u8; 32]).0;
        raw[1] = 0x99;
        let result = Kid::from_hex(&hex::encode(raw));
        assert!(matches!(result, Err(CryptoError::InvalidKid { .. })));
    }

    #[test]
    fn serializes_as_hex_string() {
        let kid = Kid::new(KeyType::Ed25519, &[2u8; 32]);
        let json = serde_json::to_string(&kid).unwrap();
        assert_eq!(json, format!("\"{}\"", kid.to_hex()));

        let back: Kid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, kid);
    }

    proptest! {
        #[test]
        fn prop_from_hex_never_panics(input in "[0-9a-f]{0,80}") {
            let _ = Kid::from_hex(&input);
        }
    }
}
