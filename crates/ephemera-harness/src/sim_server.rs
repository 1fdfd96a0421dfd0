//! In-memory stand-in for the key server, merkle tree and identity service.
//!
//! `SimServer` holds everything the server side of the protocol owns: the
//! merkle clock, per-user and per-team signing keys, accepted statements and
//! the boxes uploaded with them. It enforces what a real server enforces:
//! statements must be signed by the subject's current key and generations
//! must advance by exactly one.
//!
//! Clones share state, so every simulated device talks to the same server.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use ephemera_core::{
    DeviceEkRecipient, DeviceId, EkBoxed, EkGeneration, EkMetadata, EkStatement, HashMeta,
    MerkleRoot, StalenessPolicy, TeamEkBoxMetadata, TeamId, TransportError, Uid, UnixSecs,
    UserEkBoxMetadata, UserEkRecipient,
};
use ephemera_crypto::{Kid, SigningKeyPair, verify_and_extract};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::sim_device::SimDevice;

/// Merkle ctime the simulation starts at.
pub const SIM_EPOCH: UnixSecs = 1_700_000_000;

/// Request counters, for asserting which paths a call took.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerCounters {
    /// Merkle roots served
    pub merkle_fetches: usize,
    /// User statements served
    pub user_statement_fetches: usize,
    /// Team statements served
    pub team_statement_fetches: usize,
    /// Device statements accepted
    pub device_posts: usize,
    /// User statements accepted
    pub user_posts: usize,
    /// Team statements accepted
    pub team_posts: usize,
}

struct DeviceRecord {
    signing_seed: [u8; 32],
    current: Option<EkStatement>,
    history: Vec<EkGeneration>,
}

struct UserRecord {
    puk_seed: Option<[u8; 32]>,
    devices: BTreeMap<DeviceId, DeviceRecord>,
    /// Statement served to readers (normally the last accepted one)
    served: Option<String>,
    current: Option<EkStatement>,
    history: Vec<EkGeneration>,
    boxes: HashMap<(EkGeneration, DeviceId), UserEkBoxMetadata>,
    metadata: HashMap<EkGeneration, EkMetadata>,
}

struct TeamRecord {
    signing_seed: [u8; 32],
    members: Vec<Uid>,
    served: Option<String>,
    current: Option<EkStatement>,
    history: Vec<EkGeneration>,
    boxes: HashMap<(EkGeneration, Uid), TeamEkBoxMetadata>,
    metadata: HashMap<EkGeneration, EkMetadata>,
}

struct ServerState {
    ctime: UnixSecs,
    users: BTreeMap<Uid, UserRecord>,
    teams: BTreeMap<TeamId, TeamRecord>,
    counters: ServerCounters,
    key_rng: ChaCha20Rng,
}

impl ServerState {
    fn next_key_seed(&mut self) -> [u8; 32] {
        let mut seed = [0u8; 32];
        self.key_rng.fill_bytes(&mut seed);
        seed
    }

    fn root(&self) -> MerkleRoot {
        let mut hash = [0u8; 32];
        hash[..8].copy_from_slice(&self.ctime.to_be_bytes());
        MerkleRoot { ctime: self.ctime, hash_meta: HashMeta(hash) }
    }
}

fn rejected(status: u16, reason: impl Into<String>) -> TransportError {
    TransportError::Rejected { status, reason: reason.into() }
}

/// Verify a posted statement: signature, signer, parse, next generation.
fn accept_statement(
    sig: &str,
    expected_signer: Option<Kid>,
    history: &[EkGeneration],
) -> Result<EkStatement, TransportError> {
    let (signer, payload) = verify_and_extract(sig).map_err(|e| rejected(400, e.to_string()))?;
    if Some(signer) != expected_signer {
        return Err(rejected(403, format!("statement signed by {signer}, not the current key")));
    }

    let statement: EkStatement =
        serde_json::from_slice(&payload).map_err(|e| rejected(400, e.to_string()))?;
    let expected = history.last().map_or(1, |last| last + 1);
    let generation = statement.current_metadata.generation;
    if generation != expected {
        return Err(rejected(409, format!("generation {generation}, expected {expected}")));
    }
    Ok(statement)
}

/// Shared simulated server.
#[derive(Clone)]
pub struct SimServer {
    policy: StalenessPolicy,
    state: Arc<Mutex<ServerState>>,
}

impl SimServer {
    /// Server whose directory drops recipients stale under `policy`.
    pub fn new(policy: StalenessPolicy) -> Self {
        Self::with_seed(policy, 0)
    }

    /// Server with an explicit seed for identity keys.
    pub fn with_seed(policy: StalenessPolicy, seed: u64) -> Self {
        Self {
            policy,
            state: Arc::new(Mutex::new(ServerState {
                ctime: SIM_EPOCH,
                users: BTreeMap::new(),
                teams: BTreeMap::new(),
                counters: ServerCounters::default(),
                key_rng: ChaCha20Rng::seed_from_u64(seed ^ 0x5EED_5EED),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        #[allow(clippy::expect_used)]
        self.state.lock().expect("SimServer state mutex poisoned")
    }

    /// Staleness policy the directory applies.
    pub fn policy(&self) -> StalenessPolicy {
        self.policy
    }

    /// Current merkle time.
    pub fn ctime(&self) -> UnixSecs {
        self.state().ctime
    }

    /// Move merkle time forward.
    pub fn advance_time(&self, by: Duration) {
        self.state().ctime += by.as_secs();
    }

    /// Snapshot of the request counters.
    pub fn counters(&self) -> ServerCounters {
        self.state().counters
    }

    /// Register a user with a per-user key.
    pub fn add_user(&self, uid: &Uid) {
        let mut state = self.state();
        let puk_seed = state.next_key_seed();
        state.users.insert(uid.clone(), UserRecord::new(Some(puk_seed)));
    }

    /// Register a user who has not created a per-user key yet.
    pub fn add_user_without_puk(&self, uid: &Uid) {
        self.state().users.insert(uid.clone(), UserRecord::new(None));
    }

    /// Register a device for `uid` and return a client for it.
    ///
    /// The user is registered (with a per-user key) if unknown.
    pub fn add_device(&self, uid: &Uid, device_id: &DeviceId) -> SimDevice {
        {
            let mut state = self.state();
            let signing_seed = state.next_key_seed();
            if !state.users.contains_key(uid) {
                let puk_seed = state.next_key_seed();
                state.users.insert(uid.clone(), UserRecord::new(Some(puk_seed)));
            }
            if let Some(user) = state.users.get_mut(uid) {
                user.devices.insert(
                    device_id.clone(),
                    DeviceRecord { signing_seed, current: None, history: Vec::new() },
                );
            }
        }
        SimDevice::new(self.clone(), uid.clone(), device_id.clone())
    }

    /// Create a team with a fresh signing key.
    pub fn add_team(&self, team: &TeamId, members: &[Uid]) {
        let mut state = self.state();
        let signing_seed = state.next_key_seed();
        state.teams.insert(
            team.clone(),
            TeamRecord {
                signing_seed,
                members: members.to_vec(),
                served: None,
                current: None,
                history: Vec::new(),
                boxes: HashMap::new(),
                metadata: HashMap::new(),
            },
        );
    }

    /// Roll the user's per-user key. Devices keep their cached view of the
    /// old key until they refresh.
    pub fn rotate_puk(&self, uid: &Uid) -> Option<Kid> {
        let mut state = self.state();
        let seed = state.next_key_seed();
        let user = state.users.get_mut(uid)?;
        user.puk_seed = Some(seed);
        Some(SigningKeyPair::from_seed(seed).kid())
    }

    /// Roll the team's signing key.
    pub fn rotate_team_key(&self, team: &TeamId) -> Option<Kid> {
        let mut state = self.state();
        let seed = state.next_key_seed();
        let record = state.teams.get_mut(team)?;
        record.signing_seed = seed;
        Some(SigningKeyPair::from_seed(seed).kid())
    }

    /// Latest per-user signing key.
    pub fn puk_signing_key(&self, uid: &Uid) -> Option<SigningKeyPair> {
        self.state().users.get(uid)?.puk_seed.map(SigningKeyPair::from_seed)
    }

    /// A device's signing key.
    pub fn device_signing_key(&self, uid: &Uid, device_id: &DeviceId) -> Option<SigningKeyPair> {
        let state = self.state();
        let device = state.users.get(uid)?.devices.get(device_id)?;
        Some(SigningKeyPair::from_seed(device.signing_seed))
    }

    /// Team signing key, handed only to members.
    pub fn team_signing_key(&self, team: &TeamId, member: &Uid) -> Option<SigningKeyPair> {
        let state = self.state();
        let record = state.teams.get(team)?;
        record.members.contains(member).then(|| SigningKeyPair::from_seed(record.signing_seed))
    }

    /// Merkle root at the current time.
    pub fn fetch_root(&self) -> MerkleRoot {
        let mut state = self.state();
        state.counters.merkle_fetches += 1;
        state.root()
    }

    /// Accept a device statement.
    pub fn post_device_ek(
        &self,
        uid: &Uid,
        device_id: &DeviceId,
        sig: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        let device = state
            .users
            .get_mut(uid)
            .and_then(|u| u.devices.get_mut(device_id))
            .ok_or_else(|| rejected(404, format!("unknown device {device_id}")))?;

        let signer = SigningKeyPair::from_seed(device.signing_seed).kid();
        let statement = accept_statement(sig, Some(signer), &device.history).inspect_err(|e| {
            tracing::debug!(uid = %uid, device_id = %device_id, error = %e, "rejected device ek");
        })?;
        tracing::debug!(
            uid = %uid,
            device_id = %device_id,
            generation = statement.current_metadata.generation,
            "accepted device ek"
        );
        device.history.push(statement.current_metadata.generation);
        device.current = Some(statement);
        state.counters.device_posts += 1;
        Ok(())
    }

    /// Accept a user statement and its boxes.
    pub fn post_user_ek(
        &self,
        uid: &Uid,
        sig: &str,
        boxes: &[UserEkBoxMetadata],
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        let user =
            state.users.get_mut(uid).ok_or_else(|| rejected(404, format!("unknown user {uid}")))?;

        let signer = user.puk_seed.map(|seed| SigningKeyPair::from_seed(seed).kid());
        let statement = accept_statement(sig, signer, &user.history)
            .inspect_err(|e| tracing::debug!(uid = %uid, error = %e, "rejected user ek"))?;
        let metadata = statement.current_metadata;
        if let Some(bad) = boxes.iter().find(|b| b.generation != metadata.generation) {
            return Err(rejected(400, format!("box for generation {}", bad.generation)));
        }

        for boxed in boxes {
            user.boxes
                .insert((metadata.generation, boxed.recipient_device_id.clone()), boxed.clone());
        }
        tracing::debug!(
            uid = %uid,
            generation = metadata.generation,
            boxes = boxes.len(),
            "accepted user ek"
        );
        user.metadata.insert(metadata.generation, metadata);
        user.history.push(metadata.generation);
        user.served = Some(sig.to_string());
        user.current = Some(statement);
        state.counters.user_posts += 1;
        Ok(())
    }

    /// Accept a team statement and its boxes.
    pub fn post_team_ek(
        &self,
        team: &TeamId,
        sig: &str,
        boxes: &[TeamEkBoxMetadata],
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        let record =
            state.teams.get_mut(team).ok_or_else(|| rejected(404, format!("unknown team {team}")))?;

        let signer = SigningKeyPair::from_seed(record.signing_seed).kid();
        let statement = accept_statement(sig, Some(signer), &record.history)
            .inspect_err(|e| tracing::debug!(team_id = %team, error = %e, "rejected team ek"))?;
        let metadata = statement.current_metadata;
        if let Some(bad) = boxes.iter().find(|b| b.generation != metadata.generation) {
            return Err(rejected(400, format!("box for generation {}", bad.generation)));
        }

        for boxed in boxes {
            record.boxes.insert((metadata.generation, boxed.recipient_uid.clone()), boxed.clone());
        }
        tracing::debug!(
            team_id = %team,
            generation = metadata.generation,
            boxes = boxes.len(),
            "accepted team ek"
        );
        record.metadata.insert(metadata.generation, metadata);
        record.history.push(metadata.generation);
        record.served = Some(sig.to_string());
        record.current = Some(statement);
        state.counters.team_posts += 1;
        Ok(())
    }

    /// Latest signed user statement.
    pub fn user_ek_statement(&self, uid: &Uid) -> Option<String> {
        let mut state = self.state();
        state.counters.user_statement_fetches += 1;
        state.users.get(uid)?.served.clone()
    }

    /// Latest signed team statement.
    pub fn team_ek_statement(&self, team: &TeamId) -> Option<String> {
        let mut state = self.state();
        state.counters.team_statement_fetches += 1;
        state.teams.get(team)?.served.clone()
    }

    /// Serve `sig` as the user's statement without any checks.
    pub fn set_raw_user_ek_statement(&self, uid: &Uid, sig: &str) {
        if let Some(user) = self.state().users.get_mut(uid) {
            user.served = Some(sig.to_string());
        }
    }

    /// Serve `sig` as the team's statement without any checks.
    pub fn set_raw_team_ek_statement(&self, team: &TeamId, sig: &str) {
        if let Some(record) = self.state().teams.get_mut(team) {
            record.served = Some(sig.to_string());
        }
    }

    /// Box of user key `generation` addressed to `device_id`.
    pub fn user_ek_box(
        &self,
        uid: &Uid,
        device_id: &DeviceId,
        generation: EkGeneration,
    ) -> Option<EkBoxed> {
        let state = self.state();
        let user = state.users.get(uid)?;
        let boxed = user.boxes.get(&(generation, device_id.clone()))?;
        Some(EkBoxed {
            sealed_box: boxed.sealed_box.clone(),
            recipient_generation: boxed.recipient_generation,
            metadata: *user.metadata.get(&generation)?,
        })
    }

    /// Box of team key `generation` addressed to `uid`.
    pub fn team_ek_box(&self, team: &TeamId, uid: &Uid, generation: EkGeneration) -> Option<EkBoxed> {
        let state = self.state();
        let record = state.teams.get(team)?;
        let boxed = record.boxes.get(&(generation, uid.clone()))?;
        Some(EkBoxed {
            sealed_box: boxed.sealed_box.clone(),
            recipient_generation: boxed.recipient_generation,
            metadata: *record.metadata.get(&generation)?,
        })
    }

    /// Current device keys of the user's devices that are not stale.
    pub fn active_device_eks(&self, uid: &Uid, root: &MerkleRoot) -> Vec<DeviceEkRecipient> {
        let state = self.state();
        let Some(user) = state.users.get(uid) else {
            return Vec::new();
        };

        user.devices
            .iter()
            .filter_map(|(device_id, device)| {
                let current = device.current.as_ref()?.current_metadata;
                (!self.policy.ctime_is_stale(current.ctime, root)).then(|| DeviceEkRecipient {
                    device_id: device_id.clone(),
                    kid: current.kid,
                    generation: current.generation,
                })
            })
            .collect()
    }

    /// Current user keys of the team's members that are not stale.
    pub fn active_member_user_eks(&self, team: &TeamId, root: &MerkleRoot) -> Vec<UserEkRecipient> {
        let state = self.state();
        let Some(record) = state.teams.get(team) else {
            return Vec::new();
        };

        record
            .members
            .iter()
            .filter_map(|uid| {
                let current = state.users.get(uid)?.current.as_ref()?.current_metadata;
                (!self.policy.ctime_is_stale(current.ctime, root)).then(|| UserEkRecipient {
                    uid: uid.clone(),
                    kid: current.kid,
                    generation: current.generation,
                })
            })
            .collect()
    }

    /// Every user key generation accepted for `uid`, in order.
    pub fn user_ek_generations(&self, uid: &Uid) -> Vec<EkGeneration> {
        self.state().users.get(uid).map(|u| u.history.clone()).unwrap_or_default()
    }

    /// Every team key generation accepted for `team`, in order.
    pub fn team_ek_generations(&self, team: &TeamId) -> Vec<EkGeneration> {
        self.state().teams.get(team).map(|t| t.history.clone()).unwrap_or_default()
    }

    /// Every device key generation accepted for a device, in order.
    pub fn device_ek_generations(&self, uid: &Uid, device_id: &DeviceId) -> Vec<EkGeneration> {
        self.state()
            .users
            .get(uid)
            .and_then(|u| u.devices.get(device_id))
            .map(|d| d.history.clone())
            .unwrap_or_default()
    }

    /// Last accepted user statement.
    pub fn current_user_ek_statement(&self, uid: &Uid) -> Option<EkStatement> {
        self.state().users.get(uid)?.current.clone()
    }

    /// Last accepted team statement.
    pub fn current_team_ek_statement(&self, team: &TeamId) -> Option<EkStatement> {
        self.state().teams.get(team)?.current.clone()
    }

    /// Boxes uploaded with user key `generation`.
    pub fn user_ek_boxes(&self, uid: &Uid, generation: EkGeneration) -> Vec<UserEkBoxMetadata> {
        let state = self.state();
        let Some(user) = state.users.get(uid) else {
            return Vec::new();
        };
        let mut boxes: Vec<_> =
            user.boxes.iter().filter(|((g, _), _)| *g == generation).map(|(_, b)| b.clone()).collect();
        boxes.sort_by(|a, b| a.recipient_device_id.cmp(&b.recipient_device_id));
        boxes
    }
}

impl UserRecord {
    fn new(puk_seed: Option<[u8; 32]>) -> Self {
        Self {
            puk_seed,
            devices: BTreeMap::new(),
            served: None,
            current: None,
            history: Vec::new(),
            boxes: HashMap::new(),
            metadata: HashMap::new(),
        }
    }
}
