//! Ephemera core: lifecycle of ephemeral device, user and team keys.
//!
//! Decides when new key material is needed at each scope, mints and
//! publishes it, distributes it to the other authorized devices through
//! per-recipient sealed boxes, verifies server-served statements against
//! the subject's latest signing key and purges material that has outlived
//! its lifetime.
//!
//! # Architecture
//!
//! Orchestration only. Storage engines, the merkle client, the keyring, the
//! server API and session state are collaborators behind the traits in
//! [`context`], injected through [`EkContext`]. Time and randomness come from
//! an [`Environment`] so the whole lifecycle runs deterministically in
//! simulation.
//!
//! # Components
//!
//! - [`EkLib`]: Lock-protected public entry points
//! - [`rotation`]: Per-scope "is a new key needed" decisions
//! - [`publish`]: Minting, signing, boxing and uploading new generations
//! - [`statement`]: Fetching and verifying signed statements
//! - [`StalenessPolicy`]: Lifetime and rotation thresholds on merkle time
//! - [`GenerationCache`]: Short-lived team generation cache
//!
//! # Invariants
//!
//! - Generations strictly increase per scope per subject, starting at 1
//! - Staleness is judged on the merkle root's ctime, never the local clock
//! - Seed plaintext leaves the process only inside sealed boxes

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod context;
mod ek_lib;
pub mod env;
pub mod error;
pub mod publish;
pub mod rotation;
pub mod staleness;
pub mod statement;
mod system_env;
pub mod types;

pub use cache::GenerationCache;
pub use config::EkConfig;
pub use context::{
    DeviceEkStorage, EkApi, EkContext, EkDirectory, Keyring, MerkleClient, Session,
    TeamEkBoxStorage, UserEkBoxStorage,
};
pub use ek_lib::EkLib;
pub use env::Environment;
pub use error::{
    EkError, EkUnboxError, FirstErrorPicker, KeyringError, StorageError, TransportError,
};
pub use staleness::StalenessPolicy;
pub use system_env::SystemEnv;
pub use types::{
    DeviceEk, DeviceEkRecipient, DeviceEkStatement, DeviceId, EkBoxed, EkGeneration, EkMetadata,
    EkScope, EkStatement, HashMeta, MerkleRoot, TeamEk, TeamEkBoxMetadata, TeamEkStatement,
    TeamId, Uid, UnixSecs, UserEk, UserEkBoxMetadata, UserEkRecipient, UserEkStatement,
};
