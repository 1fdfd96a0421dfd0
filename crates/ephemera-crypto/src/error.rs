//! Error types for ephemeral key primitives

use thiserror::Error;

/// Errors from key derivation, boxing and signature operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key identifier could not be parsed or has the wrong key type
    #[error("invalid kid: {reason}")]
    InvalidKid {
        /// Why the KID was rejected
        reason: String,
    },

    /// Invalid key material length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected key length
        expected: usize,
        /// Actual key length
        actual: usize,
    },

    /// Sealed box encoding is malformed
    #[error("invalid box: {reason}")]
    InvalidBox {
        /// Why the box was rejected
        reason: String,
    },

    /// Box could not be opened with the given key (wrong recipient or tamper)
    #[error("box open failed")]
    OpenFailed,

    /// Signature did not verify against the embedded signer key
    #[error("bad signature")]
    BadSignature,

    /// Signed envelope could not be decoded
    #[error("malformed signed envelope: {0}")]
    Malformed(String),
}

impl CryptoError {
    /// Returns true if this error means "this key cannot decrypt this box".
    ///
    /// Store layers map these to an unbox condition rather than a hard
    /// failure. Encoding errors are not included: a box that does not parse
    /// is corrupt data, not a missing grant.
    pub fn is_open_failure(&self) -> bool {
        matches!(self, Self::OpenFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_open_failed_is_open_failure() {
        assert!(CryptoError::OpenFailed.is_open_failure());

        assert!(!CryptoError::BadSignature.is_open_failure());
        assert!(!CryptoError::InvalidBox { reason: "short".to_string() }.is_open_failure());
        assert!(!CryptoError::Malformed("json".to_string()).is_open_failure());
        assert!(!CryptoError::InvalidKeyLength { expected: 32, actual: 3 }.is_open_failure());
    }
}
