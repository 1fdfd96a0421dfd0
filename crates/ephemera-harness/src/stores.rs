//! In-memory key stores.
//!
//! Mirror the behaviour of the production stores the core is written
//! against: device seeds live only here; user and team stores keep boxes
//! addressed to this device (or user), fall back to the server on a local
//! miss and unbox on read. "Cannot open" is always reported as
//! [`StorageError::Unbox`].
//!
//! The device store never purges its newest key: the next device generation
//! is numbered from it, and a device offline past the key lifetime would
//! otherwise restart at generation 1.
//!
//! `clear_cache` drops unboxed plaintext only; boxes and device seeds stay,
//! as they would on disk.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use ephemera_core::{
    DeviceEk, DeviceEkStorage, DeviceId, EkBoxed, EkGeneration, EkScope, EkUnboxError,
    MerkleRoot, StalenessPolicy, StorageError, TeamEk, TeamEkBoxStorage, TeamId, Uid, UserEk,
    UserEkBoxStorage,
};
use ephemera_crypto::{DhKeyPair, EkSeed, SealedBox, derive_team_key, derive_user_key};

use crate::sim_server::SimServer;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    #[allow(clippy::expect_used)]
    mutex.lock().expect("store mutex poisoned")
}

fn unbox_error(scope: EkScope, generation: EkGeneration, reason: impl Into<String>) -> StorageError {
    StorageError::Unbox(EkUnboxError { scope, generation, reason: reason.into() })
}

/// Open `boxed` with `key` and check the seed matches the advertised key.
fn open_seed(
    scope: EkScope,
    key: &DhKeyPair,
    boxed: &EkBoxed,
    expected: impl Fn(&EkSeed) -> ephemera_crypto::Kid,
) -> Result<EkSeed, StorageError> {
    let generation = boxed.metadata.generation;
    let sealed = SealedBox::from_hex(&boxed.sealed_box)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    let plaintext = key.open(&sealed).map_err(|e| unbox_error(scope, generation, e.to_string()))?;
    let seed = EkSeed::from_slice(&plaintext)
        .map_err(|e| unbox_error(scope, generation, e.to_string()))?;

    if expected(&seed) != boxed.metadata.kid {
        return Err(unbox_error(scope, generation, "seed does not match advertised kid"));
    }
    Ok(seed)
}

/// Device key store.
pub struct MemoryDeviceEkStorage {
    policy: StalenessPolicy,
    keys: Mutex<BTreeMap<EkGeneration, DeviceEk>>,
    fail_puts: AtomicBool,
    cache_clears: AtomicUsize,
}

impl MemoryDeviceEkStorage {
    /// Empty store purging keys stale under `policy`.
    pub fn new(policy: StalenessPolicy) -> Self {
        Self {
            policy,
            keys: Mutex::new(BTreeMap::new()),
            fail_puts: AtomicBool::new(false),
            cache_clears: AtomicUsize::new(0),
        }
    }

    /// Make every subsequent `put` fail with an I/O error.
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Generations currently stored.
    pub fn generations(&self) -> Vec<EkGeneration> {
        lock(&self.keys).keys().copied().collect()
    }

    /// Drop a key, as if its local copy were lost.
    pub fn forget(&self, generation: EkGeneration) {
        lock(&self.keys).remove(&generation);
    }

    /// Times `clear_cache` was called.
    pub fn cache_clears(&self) -> usize {
        self.cache_clears.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceEkStorage for MemoryDeviceEkStorage {
    async fn get(&self, generation: EkGeneration) -> Result<DeviceEk, StorageError> {
        lock(&self.keys).get(&generation).cloned().ok_or(StorageError::NotFound { generation })
    }

    async fn max_generation(&self) -> Result<Option<EkGeneration>, StorageError> {
        Ok(lock(&self.keys).keys().next_back().copied())
    }

    async fn put(&self, generation: EkGeneration, ek: DeviceEk) -> Result<(), StorageError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StorageError::Io("injected device ek put failure".to_string()));
        }
        lock(&self.keys).insert(generation, ek);
        Ok(())
    }

    async fn delete_expired(&self, root: &MerkleRoot) -> Result<Vec<EkGeneration>, StorageError> {
        let mut keys = lock(&self.keys);
        let newest = keys.keys().next_back().copied();
        let expired: Vec<_> = keys
            .iter()
            .filter(|(generation, _)| Some(**generation) != newest)
            .filter(|(_, ek)| self.policy.ctime_is_stale(ek.metadata.ctime, root))
            .map(|(generation, _)| *generation)
            .collect();
        for generation in &expired {
            keys.remove(generation);
        }
        Ok(expired)
    }

    fn clear_cache(&self) {
        self.cache_clears.fetch_add(1, Ordering::SeqCst);
    }
}

/// User key box store for one device.
pub struct MemoryUserEkBoxStorage {
    server: SimServer,
    uid: Uid,
    device_id: DeviceId,
    device_storage: Arc<MemoryDeviceEkStorage>,
    policy: StalenessPolicy,
    boxes: Mutex<BTreeMap<EkGeneration, EkBoxed>>,
    unboxed: Mutex<HashMap<EkGeneration, UserEk>>,
    fail_puts: AtomicBool,
    cache_clears: AtomicUsize,
}

impl MemoryUserEkBoxStorage {
    /// Empty store unboxing with `device_storage`.
    pub fn new(
        server: SimServer,
        uid: Uid,
        device_id: DeviceId,
        device_storage: Arc<MemoryDeviceEkStorage>,
    ) -> Self {
        let policy = server.policy();
        Self {
            server,
            uid,
            device_id,
            device_storage,
            policy,
            boxes: Mutex::new(BTreeMap::new()),
            unboxed: Mutex::new(HashMap::new()),
            fail_puts: AtomicBool::new(false),
            cache_clears: AtomicUsize::new(0),
        }
    }

    /// Make every subsequent `put` fail with an I/O error.
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Generations with a locally stored box.
    pub fn generations(&self) -> Vec<EkGeneration> {
        lock(&self.boxes).keys().copied().collect()
    }

    /// Number of unboxed keys held in memory.
    pub fn cached_len(&self) -> usize {
        lock(&self.unboxed).len()
    }

    /// Times `clear_cache` was called.
    pub fn cache_clears(&self) -> usize {
        self.cache_clears.load(Ordering::SeqCst)
    }

    fn local_or_server_box(&self, generation: EkGeneration) -> Option<EkBoxed> {
        if let Some(boxed) = lock(&self.boxes).get(&generation).cloned() {
            return Some(boxed);
        }
        let boxed = self.server.user_ek_box(&self.uid, &self.device_id, generation)?;
        lock(&self.boxes).insert(generation, boxed.clone());
        Some(boxed)
    }
}

#[async_trait]
impl UserEkBoxStorage for MemoryUserEkBoxStorage {
    async fn get(&self, generation: EkGeneration) -> Result<UserEk, StorageError> {
        if let Some(ek) = lock(&self.unboxed).get(&generation).cloned() {
            return Ok(ek);
        }

        let Some(boxed) = self.local_or_server_box(generation) else {
            return Err(unbox_error(EkScope::User, generation, "no box for this device"));
        };

        let device_ek = match self.device_storage.get(boxed.recipient_generation).await {
            Ok(ek) => ek,
            Err(StorageError::NotFound { generation: missing }) => {
                return Err(unbox_error(
                    EkScope::User,
                    generation,
                    format!("device ek generation {missing} is gone"),
                ));
            },
            Err(err) => return Err(err),
        };

        let device_key = ephemera_crypto::derive_device_key(&device_ek.seed);
        let seed =
            open_seed(EkScope::User, device_key.dh(), &boxed, |s| derive_user_key(s).kid())?;
        let ek = UserEk { seed, metadata: boxed.metadata };
        lock(&self.unboxed).insert(generation, ek.clone());
        Ok(ek)
    }

    async fn max_generation(&self) -> Result<Option<EkGeneration>, StorageError> {
        Ok(lock(&self.boxes).keys().next_back().copied())
    }

    async fn put(&self, generation: EkGeneration, boxed: EkBoxed) -> Result<(), StorageError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StorageError::Io("injected user ek put failure".to_string()));
        }
        lock(&self.boxes).insert(generation, boxed);
        Ok(())
    }

    async fn delete_expired(&self, root: &MerkleRoot) -> Result<Vec<EkGeneration>, StorageError> {
        let mut boxes = lock(&self.boxes);
        let expired: Vec<_> = boxes
            .iter()
            .filter(|(_, b)| self.policy.ctime_is_stale(b.metadata.ctime, root))
            .map(|(generation, _)| *generation)
            .collect();

        let mut unboxed = lock(&self.unboxed);
        for generation in &expired {
            boxes.remove(generation);
            unboxed.remove(generation);
        }
        Ok(expired)
    }

    fn clear_cache(&self) {
        lock(&self.unboxed).clear();
        self.cache_clears.fetch_add(1, Ordering::SeqCst);
    }
}

/// Team key box store for one user.
pub struct MemoryTeamEkBoxStorage {
    server: SimServer,
    uid: Uid,
    user_storage: Arc<MemoryUserEkBoxStorage>,
    policy: StalenessPolicy,
    boxes: Mutex<BTreeMap<(TeamId, EkGeneration), EkBoxed>>,
    unboxed: Mutex<HashMap<(TeamId, EkGeneration), TeamEk>>,
    fail_puts: AtomicBool,
    cache_clears: AtomicUsize,
    gets: AtomicUsize,
}

impl MemoryTeamEkBoxStorage {
    /// Empty store unboxing with `user_storage`.
    pub fn new(server: SimServer, uid: Uid, user_storage: Arc<MemoryUserEkBoxStorage>) -> Self {
        let policy = server.policy();
        Self {
            server,
            uid,
            user_storage,
            policy,
            boxes: Mutex::new(BTreeMap::new()),
            unboxed: Mutex::new(HashMap::new()),
            fail_puts: AtomicBool::new(false),
            cache_clears: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
        }
    }

    /// Make every subsequent `put` fail with an I/O error.
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Generations of `team` with a locally stored box.
    pub fn generations(&self, team: &TeamId) -> Vec<EkGeneration> {
        lock(&self.boxes).keys().filter(|(t, _)| t == team).map(|(_, g)| *g).collect()
    }

    /// Number of unboxed keys held in memory.
    pub fn cached_len(&self) -> usize {
        lock(&self.unboxed).len()
    }

    /// Times `clear_cache` was called.
    pub fn cache_clears(&self) -> usize {
        self.cache_clears.load(Ordering::SeqCst)
    }

    /// Times `get` was called.
    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    fn local_or_server_box(&self, team: &TeamId, generation: EkGeneration) -> Option<EkBoxed> {
        let key = (team.clone(), generation);
        if let Some(boxed) = lock(&self.boxes).get(&key).cloned() {
            return Some(boxed);
        }
        let boxed = self.server.team_ek_box(team, &self.uid, generation)?;
        lock(&self.boxes).insert(key, boxed.clone());
        Some(boxed)
    }
}

#[async_trait]
impl TeamEkBoxStorage for MemoryTeamEkBoxStorage {
    async fn get(&self, team: &TeamId, generation: EkGeneration) -> Result<TeamEk, StorageError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let key = (team.clone(), generation);
        if let Some(ek) = lock(&self.unboxed).get(&key).cloned() {
            return Ok(ek);
        }

        let Some(boxed) = self.local_or_server_box(team, generation) else {
            return Err(unbox_error(EkScope::Team, generation, "no box for this user"));
        };

        let user_ek = match self.user_storage.get(boxed.recipient_generation).await {
            Ok(ek) => ek,
            Err(StorageError::Unbox(err)) => {
                return Err(unbox_error(EkScope::Team, generation, err.to_string()));
            },
            Err(err) => return Err(err),
        };

        let user_key = derive_user_key(&user_ek.seed);
        let seed = open_seed(EkScope::Team, user_key.dh(), &boxed, |s| derive_team_key(s).kid())?;
        let ek = TeamEk { seed, metadata: boxed.metadata };
        lock(&self.unboxed).insert(key, ek.clone());
        Ok(ek)
    }

    async fn max_generation(&self, team: &TeamId) -> Result<Option<EkGeneration>, StorageError> {
        Ok(self.generations(team).into_iter().max())
    }

    async fn put(
        &self,
        team: &TeamId,
        generation: EkGeneration,
        boxed: EkBoxed,
    ) -> Result<(), StorageError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StorageError::Io("injected team ek put failure".to_string()));
        }
        lock(&self.boxes).insert((team.clone(), generation), boxed);
        Ok(())
    }

    async fn delete_expired(
        &self,
        team: &TeamId,
        root: &MerkleRoot,
    ) -> Result<Vec<EkGeneration>, StorageError> {
        let mut boxes = lock(&self.boxes);
        let expired: Vec<_> = boxes
            .iter()
            .filter(|((t, _), b)| t == team && self.policy.ctime_is_stale(b.metadata.ctime, root))
            .map(|((_, generation), _)| *generation)
            .collect();

        let mut unboxed = lock(&self.unboxed);
        for generation in &expired {
            let key = (team.clone(), *generation);
            boxes.remove(&key);
            unboxed.remove(&key);
        }
        Ok(expired)
    }

    fn clear_cache(&self) {
        lock(&self.unboxed).clear();
        self.cache_clears.fetch_add(1, Ordering::SeqCst);
    }
}
