//! Attached Ed25519 signatures over statement payloads.
//!
//! The signed form is a JSON envelope carrying the signer's [`Kid`], the
//! payload and the signature, so a verifier can recover both the signer and
//! the payload from the blob alone. Whether the signer is the *right* key is
//! a policy question left to the caller.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::{
    error::CryptoError,
    kid::{KeyType, Kid},
};

/// Domain separation prefix for every signed payload
const SIGNATURE_CONTEXT: &[u8] = b"ephemera statement signature v1\0";

#[derive(Serialize, Deserialize)]
struct SignedEnvelope {
    kid: Kid,
    payload: String,
    sig: String,
}

/// Ed25519 signing key pair (device key, per-user key or team key).
#[derive(Clone)]
pub struct SigningKeyPair {
    key: SigningKey,
}

impl SigningKeyPair {
    /// Build a signing key from 32 secret bytes.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self { key: SigningKey::from_bytes(&seed) }
    }

    /// Identifier of the verifying half.
    pub fn kid(&self) -> Kid {
        Kid::new(KeyType::Ed25519, self.key.verifying_key().as_bytes())
    }

    /// Sign `payload` and return the armored envelope with the signer's KID.
    pub fn sign_to_string(&self, payload: &[u8]) -> (String, Kid) {
        let kid = self.kid();
        let signature = self.key.sign(&signing_input(payload));
        let envelope = SignedEnvelope {
            kid,
            payload: hex::encode(payload),
            sig: hex::encode(signature.to_bytes()),
        };

        let Ok(armored) = serde_json::to_string(&envelope) else {
            unreachable!("envelope of strings always serializes");
        };
        (armored, kid)
    }
}

impl fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeyPair").field("kid", &self.kid()).finish_non_exhaustive()
    }
}

/// Verify an armored envelope and extract `(signer, payload)`.
///
/// # Errors
///
/// - `Malformed` if the envelope does not decode
/// - `InvalidKid` if the signer is not an Ed25519 key
/// - `BadSignature` if the signature does not verify
pub fn verify_and_extract(armored: &str) -> Result<(Kid, Vec<u8>), CryptoError> {
    let envelope: SignedEnvelope =
        serde_json::from_str(armored).map_err(|e| CryptoError::Malformed(e.to_string()))?;

    if envelope.kid.key_type() != KeyType::Ed25519 {
        return Err(CryptoError::InvalidKid {
            reason: format!("{} is not a signing key", envelope.kid),
        });
    }

    let payload =
        hex::decode(&envelope.payload).map_err(|e| CryptoError::Malformed(e.to_string()))?;
    let sig_bytes =
        hex::decode(&envelope.sig).map_err(|e| CryptoError::Malformed(e.to_string()))?;
    let sig_bytes: [u8; 64] = sig_bytes.as_slice().try_into().map_err(|_| {
        CryptoError::InvalidKeyLength { expected: 64, actual: sig_bytes.len() }
    })?;

    let verifying_key = VerifyingKey::from_bytes(&envelope.kid.public_key_bytes())
        .map_err(|_| CryptoError::BadSignature)?;
    let signature = Signature::from_bytes(&sig_bytes);

    verifying_key
        .verify_strict(&signing_input(&payload), &signature)
        .map_err(|_| CryptoError::BadSignature)?;

    Ok((envelope.kid, payload))
}

fn signing_input(payload: &[u8]) -> Vec<u8> {
    let mut input = Vec::with_capacity(SIGNATURE_CONTEXT.len() + payload.len());
    input.extend_from_slice(SIGNATURE_CONTEXT);
    input.extend_from_slice(payload);
    input
}
