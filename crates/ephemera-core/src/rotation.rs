//! Per-scope "is a new key needed" decisions.
//!
//! A new key is needed when none exists, when the current one is due for
//! rotation relative to the merkle root, or when this device cannot open
//! the current one. Every other failure propagates: guessing "needed" on a
//! network error would mint keys the server never asked for.

use crate::{
    context::EkContext,
    error::{EkError, StorageError},
    staleness::StalenessPolicy,
    statement::fetch_user_ek_statement,
    types::{MerkleRoot, TeamEkStatement, TeamId},
};

/// Whether this device needs a new device key.
///
/// # Errors
///
/// Storage failures propagate.
pub async fn new_device_ek_needed(
    ctx: &EkContext,
    policy: &StalenessPolicy,
    root: &MerkleRoot,
) -> Result<bool, EkError> {
    let Some(max) = ctx.device_storage.max_generation().await? else {
        tracing::debug!("no device ek yet, keygen needed");
        return Ok(true);
    };

    let ek = ctx.device_storage.get(max).await?;
    let needed = policy.keygen_needed(ek.metadata.ctime, root);
    tracing::debug!(generation = max, needed, "device ek rotation check");
    Ok(needed)
}

/// Whether the user needs a new user key.
///
/// # Errors
///
/// Transport, keyring and storage failures other than unbox propagate.
pub async fn new_user_ek_needed(
    ctx: &EkContext,
    policy: &StalenessPolicy,
    root: &MerkleRoot,
) -> Result<bool, EkError> {
    let uid = ctx.session.uid();
    let Some(statement) = fetch_user_ek_statement(ctx, &uid).await? else {
        tracing::debug!(%uid, "no user ek statement, keygen needed");
        return Ok(true);
    };

    let generation = statement.current_metadata.generation;
    match ctx.user_storage.get(generation).await {
        Ok(ek) => {
            let needed = policy.keygen_needed(ek.metadata.ctime, root);
            tracing::debug!(generation, needed, "user ek rotation check");
            Ok(needed)
        },
        Err(StorageError::Unbox(err)) => {
            tracing::debug!(error = %err, "cannot open current user ek, keygen needed");
            Ok(true)
        },
        Err(err) => Err(err.into()),
    }
}

/// Whether `team` needs a new team key, given its latest verified statement.
///
/// # Errors
///
/// Storage failures other than unbox propagate.
pub async fn new_team_ek_needed(
    ctx: &EkContext,
    policy: &StalenessPolicy,
    team: &TeamId,
    root: &MerkleRoot,
    statement: Option<&TeamEkStatement>,
) -> Result<bool, EkError> {
    let Some(statement) = statement else {
        tracing::debug!(team_id = %team, "no team ek statement, keygen needed");
        return Ok(true);
    };

    let generation = statement.current_metadata.generation;
    match ctx.team_storage.get(team, generation).await {
        Ok(ek) => {
            let needed = policy.keygen_needed(ek.metadata.ctime, root);
            tracing::debug!(team_id = %team, generation, needed, "team ek rotation check");
            Ok(needed)
        },
        Err(StorageError::Unbox(err)) => {
            tracing::debug!(team_id = %team, error = %err, "cannot open current team ek, keygen needed");
            Ok(true)
        },
        Err(err) => Err(err.into()),
    }
}
