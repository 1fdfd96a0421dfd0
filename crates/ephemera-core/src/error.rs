//! Error types for the ephemeral key core.
//!
//! Strongly-typed errors per layer: key stores ([`StorageError`]), the
//! network collaborators ([`TransportError`]), the identity keyring
//! ([`KeyringError`]) and the top-level [`EkError`] every entry point returns.
//!
//! "This device cannot decrypt that key" is its own type, [`EkUnboxError`],
//! so rotation can treat it as "a new key is needed" without string matching.

use ephemera_crypto::{CryptoError, Kid};
use thiserror::Error;

use crate::types::{EkGeneration, EkScope};

/// Key material exists but this device cannot decrypt it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot unbox {scope} ek generation {generation}: {reason}")]
pub struct EkUnboxError {
    /// Scope of the key that could not be opened
    pub scope: EkScope,
    /// Generation of the key that could not be opened
    pub generation: EkGeneration,
    /// What went wrong (no box for this device, recipient key gone, ...)
    pub reason: String,
}

/// Errors that can occur during key store operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Key exists but this device cannot open its box
    #[error(transparent)]
    Unbox(#[from] EkUnboxError),

    /// No key stored at this generation
    #[error("ek not found: generation {generation}")]
    NotFound {
        /// Generation that was not found
        generation: EkGeneration,
    },

    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file system, database, etc.)
    #[error("I/O error: {0}")]
    Io(String),
}

impl StorageError {
    /// Returns true for the unbox condition.
    pub fn is_unbox(&self) -> bool {
        matches!(self, Self::Unbox(_))
    }
}

/// Errors from network collaborators (merkle client, API, directory).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Request did not complete (connection, timeout, ...)
    #[error("network error: {0}")]
    Network(String),

    /// Server answered and refused the request
    #[error("rejected by server ({status}): {reason}")]
    Rejected {
        /// Server status code
        status: u16,
        /// Server-provided reason
        reason: String,
    },
}

/// Errors from the identity keyring.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyringError {
    /// No signing key is available for the requested subject
    #[error("no signing key available for {0}")]
    NoKey(String),

    /// Loading keys failed
    #[error("keyring load failed: {0}")]
    Load(String),
}

/// Errors returned by ephemeral key entry points.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EkError {
    /// Key generation requires a logged-in session
    #[error("aborting ephemeral key generation, user is not logged in")]
    NotLoggedIn,

    /// Key generation requires a per-user key
    #[error("a per-user key is needed to generate ephemeral keys")]
    NoPerUserKey,

    /// Statement signer is not the subject's latest signing key, even after
    /// a forced refresh
    #[error("statement signed by {signer}, but latest signing key is {latest:?}")]
    WrongSigner {
        /// Key that signed the statement
        signer: Kid,
        /// Latest known signing key of the subject
        latest: Option<Kid>,
    },

    /// Server data could not be parsed or violates statement invariants
    #[error("malformed data: {0}")]
    Malformed(String),

    /// Signature, box or key encoding failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Key store failure
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Network collaborator failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Identity keyring failure
    #[error("keyring error: {0}")]
    Keyring(#[from] KeyringError),
}

impl EkError {
    /// Returns true if this error is transient and may succeed on retry.
    ///
    /// Retry policy belongs to the caller; the core never retries.
    /// Malformed data, bad signatures and missing preconditions are never
    /// transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(TransportError::Network(_)) | Self::Storage(StorageError::Io(_))
        )
    }
}

impl From<serde_json::Error> for EkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

/// Keeps the first error out of several independent operations.
///
/// Every operation runs regardless of earlier failures; only the first error
/// is reported.
#[derive(Debug)]
pub struct FirstErrorPicker<E> {
    first: Option<E>,
}

impl<E> Default for FirstErrorPicker<E> {
    fn default() -> Self {
        Self { first: None }
    }
}

impl<E> FirstErrorPicker<E> {
    /// Create an empty picker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one operation.
    pub fn push<T>(&mut self, result: Result<T, impl Into<E>>) {
        if let Err(err) = result
            && self.first.is_none()
        {
            self.first = Some(err.into());
        }
    }

    /// First recorded error, if any.
    pub fn into_result(self) -> Result<(), E> {
        match self.first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
