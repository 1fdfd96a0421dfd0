//! Minting and publishing new key generations.
//!
//! Publication order is fixed: build and sign locally, upload in a single
//! call, and only after the upload succeeded persist the caller's own copy.
//! A failure before the upload leaves no trace; a failure in the upload
//! leaves nothing local; a failure persisting the own box is logged and the
//! key is read back through storage later.
//!
//! User and team generations follow the server's latest statement, including
//! one signed by a superseded key; only trusted statements contribute
//! still-active prior metadata.

use ephemera_crypto::{
    DhPublicKey, EkSeed, SigningKeyPair, derive_device_key, derive_team_key, derive_user_key,
};

use crate::{
    context::EkContext,
    env::Environment,
    error::EkError,
    staleness::StalenessPolicy,
    statement::{fetch_served_team_ek_statement, fetch_served_user_ek_statement, sign_statement},
    types::{
        DeviceEk, DeviceEkStatement, EkBoxed, EkGeneration, EkMetadata, EkStatement, MerkleRoot,
        TeamEkBoxMetadata, TeamId, UserEkBoxMetadata,
    },
};

/// A signed but not yet uploaded user key.
#[derive(Debug, Clone)]
pub struct PreparedUserEk {
    /// Signed statement
    pub sig: String,
    /// One box per active device
    pub boxes: Vec<UserEkBoxMetadata>,
    /// Metadata of the new key
    pub metadata: EkMetadata,
    /// Box addressed to this device, if this device is an active recipient
    pub my_box: Option<EkBoxed>,
}

/// Fresh random seed.
pub fn new_seed<E: Environment>(env: &E) -> EkSeed {
    EkSeed::from_bytes(env.random_array())
}

fn metadata_for(kid: ephemera_crypto::Kid, generation: EkGeneration, root: &MerkleRoot) -> EkMetadata {
    EkMetadata { kid, generation, hash_meta: root.hash_meta, ctime: root.ctime }
}

// Fresh sender key and nonce per box, so boxes cannot be linked to each
// other or to the publisher.
fn seal_seed<E: Environment>(env: &E, recipient: &DhPublicKey, seed: &EkSeed) -> String {
    recipient.seal(seed.as_bytes(), env.random_array(), env.random_array()).to_hex()
}

/// Sign a device statement for `seed` at `generation`.
///
/// # Errors
///
/// - `Malformed` if the statement cannot be serialized
pub fn sign_device_ek_statement(
    generation: EkGeneration,
    seed: &EkSeed,
    signing_key: &SigningKeyPair,
    existing: Vec<EkMetadata>,
    root: &MerkleRoot,
) -> Result<(DeviceEkStatement, String), EkError> {
    let metadata = metadata_for(derive_device_key(seed).kid(), generation, root);
    let statement = DeviceEkStatement { current_metadata: metadata, existing_metadata: existing };
    let sig = sign_statement(&statement, signing_key)?;
    Ok((statement, sig))
}

/// Mint, publish and store a new device key.
///
/// # Errors
///
/// Storage, keyring and transport failures propagate. A failure storing the
/// seed after publication propagates too: the local store holds the only
/// copy of a device seed.
pub async fn publish_new_device_ek<E: Environment>(
    ctx: &EkContext,
    env: &E,
    root: &MerkleRoot,
) -> Result<EkMetadata, EkError> {
    let generation = ctx.device_storage.max_generation().await?.map_or(1, |max| max + 1);
    let seed = new_seed(env);
    let signing_key = ctx.keyring.device_signing_key().await?;
    let (statement, sig) =
        sign_device_ek_statement(generation, &seed, &signing_key, Vec::new(), root)?;

    ctx.api.post_device_ek(&ctx.session.device_id(), &sig).await?;

    let metadata = statement.current_metadata;
    ctx.device_storage.put(generation, DeviceEk { seed, metadata }).await?;
    tracing::info!(generation, kid = %metadata.kid, "published new device ek");
    Ok(metadata)
}

/// Build, sign and box a new user key under `puk_signing_key`, without
/// uploading it.
///
/// Used directly when a per-user key roll uploads the new user key together
/// with the new per-user key.
///
/// # Errors
///
/// Transport, keyring and verification failures propagate.
pub async fn prepare_new_user_ek_for_puk<E: Environment>(
    ctx: &EkContext,
    env: &E,
    policy: &StalenessPolicy,
    root: &MerkleRoot,
    puk_signing_key: &SigningKeyPair,
) -> Result<PreparedUserEk, EkError> {
    let seed = new_seed(env);
    let prior = fetch_served_user_ek_statement(ctx, &ctx.session.uid()).await?;
    let generation = prior.next_generation();

    let metadata = metadata_for(derive_user_key(&seed).kid(), generation, root);
    let statement = EkStatement {
        current_metadata: metadata,
        existing_metadata: policy.filter_active(prior.trusted(), root),
    };
    let sig = sign_statement(&statement, puk_signing_key)?;

    let (boxes, my_box) = box_user_ek_for_devices(ctx, env, root, &seed, metadata).await?;
    Ok(PreparedUserEk { sig, boxes, metadata, my_box })
}

async fn box_user_ek_for_devices<E: Environment>(
    ctx: &EkContext,
    env: &E,
    root: &MerkleRoot,
    seed: &EkSeed,
    metadata: EkMetadata,
) -> Result<(Vec<UserEkBoxMetadata>, Option<EkBoxed>), EkError> {
    let devices = ctx.directory.active_device_eks(&ctx.session.uid(), root).await?;
    let my_device = ctx.session.device_id();

    let mut boxes = Vec::with_capacity(devices.len());
    let mut my_box = None;
    for device in devices {
        let recipient = DhPublicKey::from_kid(&device.kid)?;
        let sealed_box = seal_seed(env, &recipient, seed);

        if device.device_id == my_device {
            my_box = Some(EkBoxed {
                sealed_box: sealed_box.clone(),
                recipient_generation: device.generation,
                metadata,
            });
        }
        boxes.push(UserEkBoxMetadata {
            recipient_device_id: device.device_id,
            recipient_generation: device.generation,
            generation: metadata.generation,
            sealed_box,
        });
    }
    Ok((boxes, my_box))
}

/// Mint and publish a new user key, then store this device's box.
///
/// # Errors
///
/// Failures up to and including the upload propagate. Failing to store the
/// own box afterwards is logged, not returned.
pub async fn publish_new_user_ek<E: Environment>(
    ctx: &EkContext,
    env: &E,
    policy: &StalenessPolicy,
    root: &MerkleRoot,
) -> Result<EkMetadata, EkError> {
    let puk_signing_key = ctx.keyring.latest_puk_signing_key().await?;
    let prepared = prepare_new_user_ek_for_puk(ctx, env, policy, root, &puk_signing_key).await?;

    ctx.api.post_user_ek(&prepared.sig, &prepared.boxes).await?;

    let metadata = prepared.metadata;
    match prepared.my_box {
        Some(boxed) => {
            if let Err(err) = ctx.user_storage.put(metadata.generation, boxed).await {
                tracing::warn!(
                    generation = metadata.generation,
                    error = %err,
                    "published user ek but failed to store own box"
                );
            }
        },
        None => tracing::warn!(
            generation = metadata.generation,
            "published user ek without a box for this device"
        ),
    }
    tracing::info!(generation = metadata.generation, kid = %metadata.kid, "published new user ek");
    Ok(metadata)
}

/// Mint and publish a new team key, then store this user's box.
///
/// # Errors
///
/// Same as [`publish_new_user_ek`].
pub async fn publish_new_team_ek<E: Environment>(
    ctx: &EkContext,
    env: &E,
    policy: &StalenessPolicy,
    team: &TeamId,
    root: &MerkleRoot,
) -> Result<EkMetadata, EkError> {
    let signing_key = ctx.keyring.team_signing_key(team).await?;
    let seed = new_seed(env);
    let prior = fetch_served_team_ek_statement(ctx, team).await?;
    let generation = prior.next_generation();

    let metadata = metadata_for(derive_team_key(&seed).kid(), generation, root);
    let statement = EkStatement {
        current_metadata: metadata,
        existing_metadata: policy.filter_active(prior.trusted(), root),
    };
    let sig = sign_statement(&statement, &signing_key)?;

    let members = ctx.directory.active_member_user_eks(team, root).await?;
    let my_uid = ctx.session.uid();
    let mut boxes = Vec::with_capacity(members.len());
    let mut my_box = None;
    for member in members {
        let recipient = DhPublicKey::from_kid(&member.kid)?;
        let sealed_box = seal_seed(env, &recipient, &seed);

        if member.uid == my_uid {
            my_box = Some(EkBoxed {
                sealed_box: sealed_box.clone(),
                recipient_generation: member.generation,
                metadata,
            });
        }
        boxes.push(TeamEkBoxMetadata {
            recipient_uid: member.uid,
            recipient_generation: member.generation,
            generation,
            sealed_box,
        });
    }

    ctx.api.post_team_ek(team, &sig, &boxes).await?;

    match my_box {
        Some(boxed) => {
            if let Err(err) = ctx.team_storage.put(team, generation, boxed).await {
                tracing::warn!(
                    team_id = %team,
                    generation,
                    error = %err,
                    "published team ek but failed to store own box"
                );
            }
        },
        None => tracing::warn!(
            team_id = %team,
            generation,
            "published team ek without a box for this user"
        ),
    }
    tracing::info!(team_id = %team, generation, kid = %metadata.kid, "published new team ek");
    Ok(metadata)
}
