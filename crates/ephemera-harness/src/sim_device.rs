//! One simulated device of one user.
//!
//! `SimDevice` plays every collaborator role for the core: session, keyring,
//! merkle client, API and directory, all backed by a shared [`SimServer`],
//! plus its own in-memory key stores. Network-facing calls yield to the
//! scheduler first so concurrent tasks interleave the way real requests do.
//!
//! The keyring caches the latest signing KIDs it has seen and only re-reads
//! them from the server when asked to force a refresh, so a key roll on the
//! server is invisible until then.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use ephemera_core::{
    DeviceEkRecipient, DeviceId, EkApi, EkContext, EkDirectory, Keyring, KeyringError,
    MerkleClient, MerkleRoot, Session, TeamEkBoxMetadata, TeamId, TransportError, Uid,
    UserEkBoxMetadata, UserEkRecipient,
};
use ephemera_crypto::{Kid, SigningKeyPair};

use crate::{
    sim_server::SimServer,
    stores::{MemoryDeviceEkStorage, MemoryTeamEkBoxStorage, MemoryUserEkBoxStorage},
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    #[allow(clippy::expect_used)]
    mutex.lock().expect("SimDevice mutex poisoned")
}

/// Simulated device: collaborators plus local key stores.
#[derive(Clone)]
pub struct SimDevice {
    server: SimServer,
    uid: Uid,
    device_id: DeviceId,
    logged_in: Arc<AtomicBool>,
    puk_kids: Arc<Mutex<HashMap<Uid, Option<Kid>>>>,
    team_kids: Arc<Mutex<HashMap<TeamId, Option<Kid>>>>,
    kid_refreshes: Arc<AtomicUsize>,
    keyring_syncs: Arc<AtomicUsize>,
    device_storage: Arc<MemoryDeviceEkStorage>,
    user_storage: Arc<MemoryUserEkBoxStorage>,
    team_storage: Arc<MemoryTeamEkBoxStorage>,
}

impl SimDevice {
    /// Logged-in device with empty key stores. Use
    /// [`SimServer::add_device`] to also register it on the server.
    pub fn new(server: SimServer, uid: Uid, device_id: DeviceId) -> Self {
        let device_storage = Arc::new(MemoryDeviceEkStorage::new(server.policy()));
        let user_storage = Arc::new(MemoryUserEkBoxStorage::new(
            server.clone(),
            uid.clone(),
            device_id.clone(),
            Arc::clone(&device_storage),
        ));
        let team_storage = Arc::new(MemoryTeamEkBoxStorage::new(
            server.clone(),
            uid.clone(),
            Arc::clone(&user_storage),
        ));

        Self {
            server,
            uid,
            device_id,
            logged_in: Arc::new(AtomicBool::new(true)),
            puk_kids: Arc::new(Mutex::new(HashMap::new())),
            team_kids: Arc::new(Mutex::new(HashMap::new())),
            kid_refreshes: Arc::new(AtomicUsize::new(0)),
            keyring_syncs: Arc::new(AtomicUsize::new(0)),
            device_storage,
            user_storage,
            team_storage,
        }
    }

    /// Collaborators for an [`EkLib`](ephemera_core::EkLib) running on this
    /// device.
    pub fn context(&self) -> EkContext {
        self.context_with_api(Arc::new(self.clone()))
    }

    /// Same as [`Self::context`] with a replacement API (e.g. a
    /// [`ChaoticApi`](crate::ChaoticApi) wrapping this device).
    pub fn context_with_api(&self, api: Arc<dyn EkApi>) -> EkContext {
        let me = Arc::new(self.clone());
        EkContext {
            merkle: me.clone(),
            device_storage: self.device_storage.clone(),
            user_storage: self.user_storage.clone(),
            team_storage: self.team_storage.clone(),
            api,
            directory: me.clone(),
            keyring: me.clone(),
            session: me,
        }
    }

    /// Shared server.
    pub fn server(&self) -> &SimServer {
        &self.server
    }

    /// User this device belongs to.
    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    /// This device's id.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Log the session in or out.
    pub fn set_logged_in(&self, logged_in: bool) {
        self.logged_in.store(logged_in, Ordering::SeqCst);
    }

    /// Device key store.
    pub fn device_storage(&self) -> &Arc<MemoryDeviceEkStorage> {
        &self.device_storage
    }

    /// User key box store.
    pub fn user_storage(&self) -> &Arc<MemoryUserEkBoxStorage> {
        &self.user_storage
    }

    /// Team key box store.
    pub fn team_storage(&self) -> &Arc<MemoryTeamEkBoxStorage> {
        &self.team_storage
    }

    /// Forced signing KID refreshes performed by the keyring.
    pub fn kid_refreshes(&self) -> usize {
        self.kid_refreshes.load(Ordering::SeqCst)
    }

    /// Keyring syncs requested by the core.
    pub fn keyring_syncs(&self) -> usize {
        self.keyring_syncs.load(Ordering::SeqCst)
    }

    /// Cache `kid` as the user's latest per-user signing key, whatever the
    /// server says.
    pub fn cache_puk_kid(&self, uid: &Uid, kid: Option<Kid>) {
        lock(&self.puk_kids).insert(uid.clone(), kid);
    }
}

#[async_trait]
impl MerkleClient for SimDevice {
    async fn fetch_root(&self, _freshness: Duration) -> Result<MerkleRoot, TransportError> {
        tokio::task::yield_now().await;
        Ok(self.server.fetch_root())
    }
}

#[async_trait]
impl EkApi for SimDevice {
    async fn post_device_ek(&self, device: &DeviceId, sig: &str) -> Result<(), TransportError> {
        tokio::task::yield_now().await;
        self.server.post_device_ek(&self.uid, device, sig)
    }

    async fn post_user_ek(
        &self,
        sig: &str,
        boxes: &[UserEkBoxMetadata],
    ) -> Result<(), TransportError> {
        tokio::task::yield_now().await;
        self.server.post_user_ek(&self.uid, sig, boxes)
    }

    async fn get_user_ek_statement(&self, uid: &Uid) -> Result<Option<String>, TransportError> {
        tokio::task::yield_now().await;
        Ok(self.server.user_ek_statement(uid))
    }

    async fn post_team_ek(
        &self,
        team: &TeamId,
        sig: &str,
        boxes: &[TeamEkBoxMetadata],
    ) -> Result<(), TransportError> {
        tokio::task::yield_now().await;
        self.server.post_team_ek(team, sig, boxes)
    }

    async fn get_team_ek_statement(
        &self,
        team: &TeamId,
    ) -> Result<Option<String>, TransportError> {
        tokio::task::yield_now().await;
        Ok(self.server.team_ek_statement(team))
    }
}

#[async_trait]
impl EkDirectory for SimDevice {
    async fn active_device_eks(
        &self,
        uid: &Uid,
        root: &MerkleRoot,
    ) -> Result<Vec<DeviceEkRecipient>, TransportError> {
        tokio::task::yield_now().await;
        Ok(self.server.active_device_eks(uid, root))
    }

    async fn active_member_user_eks(
        &self,
        team: &TeamId,
        root: &MerkleRoot,
    ) -> Result<Vec<UserEkRecipient>, TransportError> {
        tokio::task::yield_now().await;
        Ok(self.server.active_member_user_eks(team, root))
    }
}

#[async_trait]
impl Keyring for SimDevice {
    async fn sync(&self) -> Result<(), KeyringError> {
        self.keyring_syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn has_per_user_key(&self) -> Result<bool, KeyringError> {
        Ok(self.server.puk_signing_key(&self.uid).is_some())
    }

    async fn latest_puk_signing_key(&self) -> Result<SigningKeyPair, KeyringError> {
        self.server
            .puk_signing_key(&self.uid)
            .ok_or_else(|| KeyringError::NoKey(format!("per-user key of {}", self.uid)))
    }

    async fn device_signing_key(&self) -> Result<SigningKeyPair, KeyringError> {
        self.server
            .device_signing_key(&self.uid, &self.device_id)
            .ok_or_else(|| KeyringError::NoKey(format!("device {}", self.device_id)))
    }

    async fn team_signing_key(&self, team: &TeamId) -> Result<SigningKeyPair, KeyringError> {
        self.server
            .team_signing_key(team, &self.uid)
            .ok_or_else(|| KeyringError::NoKey(format!("team {team}")))
    }

    async fn latest_puk_signing_kid(
        &self,
        uid: &Uid,
        force_refresh: bool,
    ) -> Result<Option<Kid>, KeyringError> {
        if !force_refresh && let Some(kid) = lock(&self.puk_kids).get(uid).copied() {
            return Ok(kid);
        }

        tokio::task::yield_now().await;
        if force_refresh {
            self.kid_refreshes.fetch_add(1, Ordering::SeqCst);
        }
        let kid = self.server.puk_signing_key(uid).map(|key| key.kid());
        lock(&self.puk_kids).insert(uid.clone(), kid);
        Ok(kid)
    }

    async fn latest_team_signing_kid(
        &self,
        team: &TeamId,
        force_refresh: bool,
    ) -> Result<Option<Kid>, KeyringError> {
        if !force_refresh && let Some(kid) = lock(&self.team_kids).get(team).copied() {
            return Ok(kid);
        }

        tokio::task::yield_now().await;
        if force_refresh {
            self.kid_refreshes.fetch_add(1, Ordering::SeqCst);
        }
        let kid = self.server.team_signing_key(team, &self.uid).map(|key| key.kid());
        lock(&self.team_kids).insert(team.clone(), kid);
        Ok(kid)
    }
}

#[async_trait]
impl Session for SimDevice {
    async fn logged_in(&self) -> Result<bool, TransportError> {
        Ok(self.logged_in.load(Ordering::SeqCst))
    }

    fn uid(&self) -> Uid {
        self.uid.clone()
    }

    fn device_id(&self) -> DeviceId {
        self.device_id.clone()
    }
}
