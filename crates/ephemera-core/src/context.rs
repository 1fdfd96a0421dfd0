//! Collaborator interfaces.
//!
//! Everything the core talks to but does not own: the merkle client, durable
//! key stores, the server API, the recipient directory, the identity keyring
//! and session state. Implementations live with the embedding application
//! (production) or in `ephemera-harness` (simulation).
//!
//! All traits are object safe so [`EkContext`] can hold them as
//! `Arc<dyn ...>`. Every call is a future; dropping the caller's future
//! cancels whatever call is in flight.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use ephemera_crypto::{Kid, SigningKeyPair};

use crate::{
    error::{KeyringError, StorageError, TransportError},
    types::{
        DeviceEk, DeviceEkRecipient, DeviceId, EkBoxed, EkGeneration, MerkleRoot, TeamEk,
        TeamEkBoxMetadata, TeamId, Uid, UserEk, UserEkBoxMetadata, UserEkRecipient,
    },
};

/// Source of trusted merkle roots.
#[async_trait]
pub trait MerkleClient: Send + Sync {
    /// Fetch a verified root no older than `freshness`.
    async fn fetch_root(&self, freshness: Duration) -> Result<MerkleRoot, TransportError>;
}

/// Local store of this device's device keys.
///
/// Device seeds are never boxed: this store is their only copy and is
/// responsible for protecting them at rest.
#[async_trait]
pub trait DeviceEkStorage: Send + Sync {
    /// Key at `generation`.
    async fn get(&self, generation: EkGeneration) -> Result<DeviceEk, StorageError>;

    /// Highest stored generation, `None` if no key was ever stored.
    async fn max_generation(&self) -> Result<Option<EkGeneration>, StorageError>;

    /// Store a newly minted key.
    async fn put(&self, generation: EkGeneration, ek: DeviceEk) -> Result<(), StorageError>;

    /// Delete keys stale relative to `root`, returning the deleted
    /// generations.
    async fn delete_expired(&self, root: &MerkleRoot) -> Result<Vec<EkGeneration>, StorageError>;

    /// Drop in-memory caches. Durable state is untouched.
    fn clear_cache(&self);
}

/// Local store of boxed user keys, unboxed with this device's device keys.
#[async_trait]
pub trait UserEkBoxStorage: Send + Sync {
    /// Unboxed key at `generation`.
    ///
    /// # Errors
    ///
    /// - `StorageError::Unbox` if the key exists but this device cannot
    ///   open it
    async fn get(&self, generation: EkGeneration) -> Result<UserEk, StorageError>;

    /// Highest stored generation, `None` if no key was ever stored.
    async fn max_generation(&self) -> Result<Option<EkGeneration>, StorageError>;

    /// Store this device's box of a newly published key.
    async fn put(&self, generation: EkGeneration, boxed: EkBoxed) -> Result<(), StorageError>;

    /// Delete keys stale relative to `root`, returning the deleted
    /// generations.
    async fn delete_expired(&self, root: &MerkleRoot) -> Result<Vec<EkGeneration>, StorageError>;

    /// Drop in-memory caches. Durable state is untouched.
    fn clear_cache(&self);
}

/// Local store of boxed team keys, unboxed with the user's user keys.
#[async_trait]
pub trait TeamEkBoxStorage: Send + Sync {
    /// Unboxed key of `team` at `generation`.
    ///
    /// # Errors
    ///
    /// - `StorageError::Unbox` if the key exists but cannot be opened
    async fn get(&self, team: &TeamId, generation: EkGeneration) -> Result<TeamEk, StorageError>;

    /// Highest stored generation for `team`.
    async fn max_generation(&self, team: &TeamId) -> Result<Option<EkGeneration>, StorageError>;

    /// Store this user's box of a newly published team key.
    async fn put(
        &self,
        team: &TeamId,
        generation: EkGeneration,
        boxed: EkBoxed,
    ) -> Result<(), StorageError>;

    /// Delete keys of `team` stale relative to `root`.
    async fn delete_expired(
        &self,
        team: &TeamId,
        root: &MerkleRoot,
    ) -> Result<Vec<EkGeneration>, StorageError>;

    /// Drop in-memory caches. Durable state is untouched.
    fn clear_cache(&self);
}

/// Server API for publishing and fetching signed statements.
#[async_trait]
pub trait EkApi: Send + Sync {
    /// Publish a signed device statement.
    async fn post_device_ek(&self, device: &DeviceId, sig: &str) -> Result<(), TransportError>;

    /// Publish a signed user statement together with its boxes.
    async fn post_user_ek(
        &self,
        sig: &str,
        boxes: &[UserEkBoxMetadata],
    ) -> Result<(), TransportError>;

    /// Latest signed user statement, `None` if the user never published one.
    async fn get_user_ek_statement(&self, uid: &Uid) -> Result<Option<String>, TransportError>;

    /// Publish a signed team statement together with its boxes.
    async fn post_team_ek(
        &self,
        team: &TeamId,
        sig: &str,
        boxes: &[TeamEkBoxMetadata],
    ) -> Result<(), TransportError>;

    /// Latest signed team statement, `None` if the team never published one.
    async fn get_team_ek_statement(&self, team: &TeamId)
    -> Result<Option<String>, TransportError>;
}

/// Lookup of box recipients.
#[async_trait]
pub trait EkDirectory: Send + Sync {
    /// Current device keys of the user's active devices, checked against
    /// `root`.
    async fn active_device_eks(
        &self,
        uid: &Uid,
        root: &MerkleRoot,
    ) -> Result<Vec<DeviceEkRecipient>, TransportError>;

    /// Current user keys of the team's members, checked against `root`.
    async fn active_member_user_eks(
        &self,
        team: &TeamId,
        root: &MerkleRoot,
    ) -> Result<Vec<UserEkRecipient>, TransportError>;
}

/// Identity keyring: per-user keys, device signing key, team signing keys.
#[async_trait]
pub trait Keyring: Send + Sync {
    /// Bring the keyring up to date with the server.
    async fn sync(&self) -> Result<(), KeyringError>;

    /// True if the user has a per-user key.
    async fn has_per_user_key(&self) -> Result<bool, KeyringError>;

    /// Signing half of the latest per-user key.
    async fn latest_puk_signing_key(&self) -> Result<SigningKeyPair, KeyringError>;

    /// This device's signing key.
    async fn device_signing_key(&self) -> Result<SigningKeyPair, KeyringError>;

    /// Signing key of `team`.
    async fn team_signing_key(&self, team: &TeamId) -> Result<SigningKeyPair, KeyringError>;

    /// KID of the user's latest per-user signing key. With `force_refresh`
    /// the cached answer is bypassed.
    async fn latest_puk_signing_kid(
        &self,
        uid: &Uid,
        force_refresh: bool,
    ) -> Result<Option<Kid>, KeyringError>;

    /// KID of the team's latest signing key. With `force_refresh` the cached
    /// answer is bypassed.
    async fn latest_team_signing_kid(
        &self,
        team: &TeamId,
        force_refresh: bool,
    ) -> Result<Option<Kid>, KeyringError>;
}

/// Login state of the running process.
#[async_trait]
pub trait Session: Send + Sync {
    /// True if a user is logged in.
    async fn logged_in(&self) -> Result<bool, TransportError>;

    /// Logged-in user.
    fn uid(&self) -> Uid;

    /// This device.
    fn device_id(&self) -> DeviceId;
}

/// Handles to every collaborator.
#[derive(Clone)]
pub struct EkContext {
    /// Merkle client
    pub merkle: Arc<dyn MerkleClient>,
    /// Device key store
    pub device_storage: Arc<dyn DeviceEkStorage>,
    /// User key box store
    pub user_storage: Arc<dyn UserEkBoxStorage>,
    /// Team key box store
    pub team_storage: Arc<dyn TeamEkBoxStorage>,
    /// Server API
    pub api: Arc<dyn EkApi>,
    /// Recipient directory
    pub directory: Arc<dyn EkDirectory>,
    /// Identity keyring
    pub keyring: Arc<dyn Keyring>,
    /// Session state
    pub session: Arc<dyn Session>,
}
