//! Orchestrator: the public entry points of the ephemeral key lifecycle.
//!
//! Every state-changing entry point runs under one async mutex, held across
//! collaborator calls, so two callers can never both decide a key is needed
//! and mint competing generations. The only path that skips the mutex is a
//! valid hit in the team generation cache.
//!
//! # Flow of `get_or_create_latest_team_ek` on a cache miss
//!
//! ```text
//! lock -> cache re-check -> merkle root -> device/user keygen + cleanup
//!      -> team statement -> team keygen if needed -> purge expired team keys
//!      -> read current team key -> populate cache
//! ```

use ephemera_crypto::{DhKeyPair, DhPublicKey, EkSeed, SigningKeyPair, derive_device_key};
use tokio::sync::Mutex;

use crate::{
    cache::GenerationCache,
    config::EkConfig,
    context::EkContext,
    env::Environment,
    error::{EkError, FirstErrorPicker},
    publish::{
        new_seed, publish_new_device_ek, publish_new_team_ek, publish_new_user_ek,
        sign_device_ek_statement,
    },
    rotation,
    statement::fetch_team_ek_statement,
    types::{
        DeviceEkStatement, EkBoxed, EkGeneration, EkMetadata, MerkleRoot, TeamEk, TeamId,
    },
};

/// Ephemeral key lifecycle manager.
pub struct EkLib<E: Environment> {
    ctx: EkContext,
    env: E,
    config: EkConfig,
    team_ek_gen_cache: GenerationCache<E>,
    lock: Mutex<()>,
}

impl<E: Environment> EkLib<E> {
    /// Create a manager over the given collaborators.
    pub fn new(ctx: EkContext, env: E, config: EkConfig) -> Self {
        let team_ek_gen_cache =
            GenerationCache::new(env.clone(), config.cache_ttl, config.cache_capacity);
        Self { ctx, env, config, team_ek_gen_cache, lock: Mutex::new(()) }
    }

    /// Collaborators this manager was built with.
    pub fn context(&self) -> &EkContext {
        &self.ctx
    }

    /// Active configuration.
    pub fn config(&self) -> &EkConfig {
        &self.config
    }

    async fn check_login_and_puk(&self) -> Result<(), EkError> {
        if !self.ctx.session.logged_in().await? {
            return Err(EkError::NotLoggedIn);
        }

        self.ctx.keyring.sync().await?;
        if !self.ctx.keyring.has_per_user_key().await? {
            return Err(EkError::NoPerUserKey);
        }
        Ok(())
    }

    async fn fetch_root(&self) -> Result<MerkleRoot, EkError> {
        Ok(self.ctx.merkle.fetch_root(self.config.merkle_freshness).await?)
    }

    /// Mint device and user keys if they are missing or due for rotation,
    /// then purge expired device and user keys.
    ///
    /// # Errors
    ///
    /// - `NotLoggedIn` / `NoPerUserKey` before anything else happens
    /// - any collaborator failure along the way
    pub async fn keygen_if_needed(&self) -> Result<(), EkError> {
        let _guard = self.lock.lock().await;

        self.check_login_and_puk().await?;
        let root = self.fetch_root().await?;
        self.keygen_if_needed_locked(&root).await
    }

    async fn keygen_if_needed_locked(&self, root: &MerkleRoot) -> Result<(), EkError> {
        let policy = &self.config.staleness;

        if rotation::new_device_ek_needed(&self.ctx, policy, root).await? {
            publish_new_device_ek(&self.ctx, &self.env, root).await?;
        }
        if rotation::new_user_ek_needed(&self.ctx, policy, root).await? {
            publish_new_user_ek(&self.ctx, &self.env, policy, root).await?;
        }
        self.cleanup_locked(root).await
    }

    /// Delete expired device and user keys.
    ///
    /// Both stores are purged even if the first fails; the first error is
    /// returned.
    ///
    /// # Errors
    ///
    /// Merkle and storage failures propagate.
    pub async fn cleanup_stale_user_and_device_eks(&self) -> Result<(), EkError> {
        let _guard = self.lock.lock().await;

        let root = self.fetch_root().await?;
        self.cleanup_locked(&root).await
    }

    async fn cleanup_locked(&self, root: &MerkleRoot) -> Result<(), EkError> {
        let mut picker = FirstErrorPicker::<EkError>::new();

        let device = self.ctx.device_storage.delete_expired(root).await;
        if let Ok(deleted) = &device
            && !deleted.is_empty()
        {
            tracing::info!(generations = ?deleted, "deleted expired device eks");
        }
        picker.push(device);

        let user = self.ctx.user_storage.delete_expired(root).await;
        if let Ok(deleted) = &user
            && !deleted.is_empty()
        {
            tracing::info!(generations = ?deleted, "deleted expired user eks");
        }
        picker.push(user);

        picker.into_result()
    }

    /// Whether this device needs a new device key right now.
    ///
    /// # Errors
    ///
    /// Merkle and storage failures propagate.
    pub async fn new_device_ek_needed(&self) -> Result<bool, EkError> {
        let _guard = self.lock.lock().await;

        let root = self.fetch_root().await?;
        rotation::new_device_ek_needed(&self.ctx, &self.config.staleness, &root).await
    }

    /// Whether the user needs a new user key right now.
    ///
    /// # Errors
    ///
    /// Merkle, transport, keyring and non-unbox storage failures propagate.
    pub async fn new_user_ek_needed(&self) -> Result<bool, EkError> {
        let _guard = self.lock.lock().await;

        let root = self.fetch_root().await?;
        rotation::new_user_ek_needed(&self.ctx, &self.config.staleness, &root).await
    }

    /// Whether `team` needs a new team key right now.
    ///
    /// # Errors
    ///
    /// Merkle, transport, keyring and non-unbox storage failures propagate.
    pub async fn new_team_ek_needed(&self, team: &TeamId) -> Result<bool, EkError> {
        let _guard = self.lock.lock().await;

        let root = self.fetch_root().await?;
        let statement = fetch_team_ek_statement(&self.ctx, team).await?;
        rotation::new_team_ek_needed(
            &self.ctx,
            &self.config.staleness,
            team,
            &root,
            statement.as_ref(),
        )
        .await
    }

    /// Latest team key for `team`, minting and publishing one first if the
    /// current key is missing, unreadable or due for rotation.
    ///
    /// # Errors
    ///
    /// - `NotLoggedIn` before anything else happens
    /// - `NoPerUserKey` before any request on a cache miss
    /// - any collaborator failure along the way
    pub async fn get_or_create_latest_team_ek(&self, team: &TeamId) -> Result<TeamEk, EkError> {
        // The keyring sync is left to the locked path; a hit only needs a session.
        if !self.ctx.session.logged_in().await? {
            return Err(EkError::NotLoggedIn);
        }
        if let Some(generation) = self.team_ek_gen_cache.get(team) {
            tracing::debug!(team_id = %team, generation, "team ek generation cache hit");
            return Ok(self.ctx.team_storage.get(team, generation).await?);
        }

        let _guard = self.lock.lock().await;
        self.check_login_and_puk().await?;

        // Another caller may have populated the cache while we waited.
        if let Some(generation) = self.team_ek_gen_cache.get(team) {
            tracing::debug!(team_id = %team, generation, "team ek generation cache hit after lock");
            return Ok(self.ctx.team_storage.get(team, generation).await?);
        }

        let root = self.fetch_root().await?;
        self.keygen_if_needed_locked(&root).await?;

        let policy = &self.config.staleness;
        let statement = fetch_team_ek_statement(&self.ctx, team).await?;
        let needed =
            rotation::new_team_ek_needed(&self.ctx, policy, team, &root, statement.as_ref())
                .await?;
        let generation = match statement {
            Some(statement) if !needed => statement.current_metadata.generation,
            _ => publish_new_team_ek(&self.ctx, &self.env, policy, team, &root).await?.generation,
        };

        let deleted = self.ctx.team_storage.delete_expired(team, &root).await?;
        if !deleted.is_empty() {
            tracing::info!(team_id = %team, generations = ?deleted, "deleted expired team eks");
        }

        let ek = self.ctx.team_storage.get(team, generation).await?;
        self.team_ek_gen_cache.put(team.clone(), generation);
        Ok(ek)
    }

    /// Forget the cached generation for `team` if it is still valid and
    /// differs from `generation`.
    ///
    /// Called when a newer (or otherwise different) team key is observed.
    pub fn purge_team_ek_gen_cache(&self, team: &TeamId, generation: EkGeneration) {
        self.team_ek_gen_cache.invalidate_if_stale(team, generation);
    }

    /// Seal the latest user key to a device being provisioned.
    ///
    /// Brings keys up to date first. Returns `None` if the user has no user
    /// key to share.
    ///
    /// # Errors
    ///
    /// Same as [`keygen_if_needed`](Self::keygen_if_needed), plus storage
    /// failures reading the user key.
    pub async fn box_latest_user_ek(
        &self,
        receiver_key: &DhPublicKey,
        device_generation: EkGeneration,
    ) -> Result<Option<EkBoxed>, EkError> {
        self.keygen_if_needed().await?;

        let Some(max) = self.ctx.user_storage.max_generation().await? else {
            tracing::warn!("no user ek found to box for new device");
            return Ok(None);
        };
        let user_ek = self.ctx.user_storage.get(max).await?;

        let sealed = receiver_key.seal(
            user_ek.seed.as_bytes(),
            self.env.random_array(),
            self.env.random_array(),
        );
        Ok(Some(EkBoxed {
            sealed_box: sealed.to_hex(),
            recipient_generation: device_generation,
            metadata: user_ek.metadata,
        }))
    }

    /// Login hook: bring keys up to date.
    ///
    /// # Errors
    ///
    /// Same as [`keygen_if_needed`](Self::keygen_if_needed).
    pub async fn on_login(&self) -> Result<(), EkError> {
        self.keygen_if_needed().await
    }

    /// Logout hook: drop every in-memory cache. Durable keys are kept.
    pub fn on_logout(&self) {
        self.ctx.device_storage.clear_cache();
        self.ctx.user_storage.clear_cache();
        self.ctx.team_storage.clear_cache();
        self.team_ek_gen_cache.clear();
        tracing::debug!("cleared ephemeral key caches on logout");
    }

    /// Fresh random seed, for provisioning a device key outside the normal
    /// rotation path.
    pub fn new_ephemeral_seed(&self) -> EkSeed {
        new_seed(&self.env)
    }

    /// Device-scope DH key pair for `seed`.
    pub fn derive_device_dh_key(&self, seed: &EkSeed) -> DhKeyPair {
        derive_device_key(seed).dh().clone()
    }

    /// Signed device statement for a device being provisioned, anchored to a
    /// fresh merkle root.
    ///
    /// # Errors
    ///
    /// Merkle failures propagate.
    pub async fn signed_device_ek_statement_from_seed(
        &self,
        generation: EkGeneration,
        seed: &EkSeed,
        signing_key: &SigningKeyPair,
        existing: Vec<EkMetadata>,
    ) -> Result<(DeviceEkStatement, String), EkError> {
        let root = self.fetch_root().await?;
        sign_device_ek_statement(generation, seed, signing_key, existing, &root)
    }
}
