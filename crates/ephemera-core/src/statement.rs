//! Signed statement protocol.
//!
//! A statement is JSON signed with the subject's latest signing key: the
//! per-user key for user statements, the team key for team statements and
//! the device key for device statements. A statement is trusted only if its
//! signer is the subject's *latest* key. Because the local view of "latest"
//! can lag a key roll, a mismatch forces one keyring refresh before the
//! statement is rejected.
//!
//! A validly signed statement whose signer was superseded is not trusted,
//! but the server still holds its generation. [`ServedStatement`] keeps that
//! generation so the replacement is numbered after it.

use ephemera_crypto::{Kid, SigningKeyPair, verify_and_extract};

use crate::{
    context::EkContext,
    error::EkError,
    types::{EkGeneration, EkStatement, TeamEkStatement, TeamId, Uid, UserEkStatement},
};

/// Latest statement the server serves for a subject, classified by signer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServedStatement {
    /// Nothing published yet.
    Absent,
    /// Signed by the subject's latest key.
    Trusted(EkStatement),
    /// Signed by a key that has since been rolled. Only its generation is
    /// used.
    Superseded {
        /// Generation the server currently holds
        generation: EkGeneration,
    },
}

impl ServedStatement {
    /// The statement, if its signer is the latest key.
    pub fn trusted(&self) -> Option<&EkStatement> {
        match self {
            Self::Trusted(statement) => Some(statement),
            Self::Absent | Self::Superseded { .. } => None,
        }
    }

    /// Owned variant of [`trusted`](Self::trusted).
    pub fn into_trusted(self) -> Option<EkStatement> {
        match self {
            Self::Trusted(statement) => Some(statement),
            Self::Absent | Self::Superseded { .. } => None,
        }
    }

    /// Generation the next publication for this subject must carry.
    pub fn next_generation(&self) -> EkGeneration {
        match self {
            Self::Absent => 1,
            Self::Trusted(statement) => statement.current_metadata.generation + 1,
            Self::Superseded { generation } => generation + 1,
        }
    }
}

enum SignerCheck {
    Latest(EkStatement),
    Superseded { signer: Kid, latest: Option<Kid>, statement: EkStatement },
}

/// Whose latest signing key a statement must be signed by.
#[derive(Debug, Clone, Copy)]
enum Signer<'a> {
    Puk(&'a Uid),
    Team(&'a TeamId),
}

impl Signer<'_> {
    async fn latest_kid(self, ctx: &EkContext, force_refresh: bool) -> Result<Option<Kid>, EkError> {
        let kid = match self {
            Self::Puk(uid) => ctx.keyring.latest_puk_signing_kid(uid, force_refresh).await?,
            Self::Team(team) => ctx.keyring.latest_team_signing_kid(team, force_refresh).await?,
        };
        Ok(kid)
    }
}

/// Serialize and sign a statement.
///
/// # Errors
///
/// - `Malformed` if the statement cannot be serialized
pub fn sign_statement(
    statement: &EkStatement,
    signing_key: &SigningKeyPair,
) -> Result<String, EkError> {
    let payload = serde_json::to_vec(statement)?;
    let (sig, _) = signing_key.sign_to_string(&payload);
    Ok(sig)
}

/// Verify a signed user statement against the user's latest per-user key.
///
/// # Errors
///
/// - `WrongSigner` if the signer is not the latest key, even after refresh
/// - `Crypto` if the signature is invalid
/// - `Malformed` if the payload is not a valid statement
pub async fn verify_user_ek_statement(
    ctx: &EkContext,
    uid: &Uid,
    sig: &str,
) -> Result<UserEkStatement, EkError> {
    verify_with_latest(ctx, Signer::Puk(uid), sig).await
}

/// Verify a signed team statement against the team's latest signing key.
///
/// # Errors
///
/// Same as [`verify_user_ek_statement`].
pub async fn verify_team_ek_statement(
    ctx: &EkContext,
    team: &TeamId,
    sig: &str,
) -> Result<TeamEkStatement, EkError> {
    verify_with_latest(ctx, Signer::Team(team), sig).await
}

/// Latest user statement, `None` if the user never published one or the
/// published one is not signed by the latest per-user key.
///
/// # Errors
///
/// Transport and keyring failures, invalid signatures and malformed
/// payloads propagate.
pub async fn fetch_user_ek_statement(
    ctx: &EkContext,
    uid: &Uid,
) -> Result<Option<UserEkStatement>, EkError> {
    Ok(fetch_served_user_ek_statement(ctx, uid).await?.into_trusted())
}

/// Latest team statement, `None` if the team never published one or the
/// published one is not signed by the latest team key.
///
/// # Errors
///
/// Same as [`fetch_user_ek_statement`].
pub async fn fetch_team_ek_statement(
    ctx: &EkContext,
    team: &TeamId,
) -> Result<Option<TeamEkStatement>, EkError> {
    Ok(fetch_served_team_ek_statement(ctx, team).await?.into_trusted())
}

/// Latest user statement as served, including the generation of one signed
/// by a superseded per-user key.
///
/// # Errors
///
/// Same as [`fetch_user_ek_statement`].
pub async fn fetch_served_user_ek_statement(
    ctx: &EkContext,
    uid: &Uid,
) -> Result<ServedStatement, EkError> {
    let Some(sig) = ctx.api.get_user_ek_statement(uid).await? else {
        tracing::debug!(%uid, "no user ek statement published");
        return Ok(ServedStatement::Absent);
    };
    Ok(classify(check_signer(ctx, Signer::Puk(uid), &sig).await?))
}

/// Latest team statement as served, including the generation of one signed
/// by a superseded team key.
///
/// # Errors
///
/// Same as [`fetch_user_ek_statement`].
pub async fn fetch_served_team_ek_statement(
    ctx: &EkContext,
    team: &TeamId,
) -> Result<ServedStatement, EkError> {
    let Some(sig) = ctx.api.get_team_ek_statement(team).await? else {
        tracing::debug!(team_id = %team, "no team ek statement published");
        return Ok(ServedStatement::Absent);
    };
    Ok(classify(check_signer(ctx, Signer::Team(team), &sig).await?))
}

// A statement signed by a superseded key is not trusted, so the caller
// publishes a replacement under the current key, numbered after it.
fn classify(check: SignerCheck) -> ServedStatement {
    match check {
        SignerCheck::Latest(statement) => ServedStatement::Trusted(statement),
        SignerCheck::Superseded { signer, latest, statement } => {
            let generation = statement.current_metadata.generation;
            tracing::warn!(
                %signer,
                latest = ?latest,
                generation,
                "ignoring ek statement signed by a superseded key"
            );
            ServedStatement::Superseded { generation }
        },
    }
}

async fn verify_with_latest(
    ctx: &EkContext,
    signer: Signer<'_>,
    sig: &str,
) -> Result<EkStatement, EkError> {
    match check_signer(ctx, signer, sig).await? {
        SignerCheck::Latest(statement) => Ok(statement),
        SignerCheck::Superseded { signer, latest, .. } => {
            Err(EkError::WrongSigner { signer, latest })
        },
    }
}

async fn check_signer(
    ctx: &EkContext,
    signer: Signer<'_>,
    sig: &str,
) -> Result<SignerCheck, EkError> {
    let (signer_kid, payload) = verify_and_extract(sig)?;

    let mut latest = signer.latest_kid(ctx, false).await?;
    if latest != Some(signer_kid) {
        tracing::debug!(signer = %signer_kid, "signer is not the cached latest key, refreshing");
        latest = signer.latest_kid(ctx, true).await?;
    }

    let statement: EkStatement = serde_json::from_slice(&payload)?;
    statement.validate()?;
    if latest != Some(signer_kid) {
        return Ok(SignerCheck::Superseded { signer: signer_kid, latest, statement });
    }
    Ok(SignerCheck::Latest(statement))
}
