//! Password lifecycle for a single role

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::engine::SqlOperation;
use crate::postgres::executor::{ExecError, SqlExecutor};
use crate::postgres::sql::generate_password;

use super::scram::{ScramError, ScramVerifier, password_matches};
use super::secret_store::{SecretLocation, SecretPayload, SecretStore, SecretStoreError};

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Credential store error: {0}")]
    Store(#[from] SecretStoreError),

    /// The Secret may already hold a new password; `rotated_at` records when
    #[error("Failed to apply password: {source}")]
    Apply {
        rotated_at: Option<DateTime<Utc>>,
        #[source]
        source: ExecError,
    },

    #[error("Failed to compute password verifier: {0}")]
    Verifier(#[from] ScramError),
}

impl CredentialError {
    /// Rotation time to persist even though the cycle failed
    pub fn rotated_at(&self) -> Option<DateTime<Utc>> {
        match self {
            CredentialError::Apply { rotated_at, .. } => *rotated_at,
            _ => None,
        }
    }
}

/// Inputs for [`ensure_credential`]
#[derive(Clone, Debug)]
pub struct CredentialRequest<'a> {
    pub role: &'a str,
    pub location: SecretLocation,
    pub rotation: Option<Duration>,
    /// From the resource status
    pub last_rotated: Option<DateTime<Utc>>,
    /// Verifier currently stored in `pg_authid`
    pub current_verifier: Option<&'a str>,
    /// The operator cannot read `pg_authid`, so `current_verifier` is unknown
    pub verifier_hidden: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialAction {
    /// Secret and role already agree
    Unchanged,
    /// The Secret password was re-applied to the role
    Reapplied,
    /// A password was generated because no Secret existed
    Created,
    /// The rotation interval elapsed and a new password was generated
    Rotated,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialOutcome {
    pub action: CredentialAction,
    pub last_rotated: DateTime<Utc>,
}

/// Make the role's password match its Secret, generating or rotating as needed
#[instrument(skip_all, fields(role = %request.role, secret = %request.location.name))]
pub async fn ensure_credential(
    store: &dyn SecretStore,
    executor: &dyn SqlExecutor,
    request: CredentialRequest<'_>,
    now: DateTime<Utc>,
) -> Result<CredentialOutcome, CredentialError> {
    let mut payload = match store.get(&request.location).await? {
        None => {
            return regenerate(store, executor, &request, CredentialAction::Created, now).await;
        }
        Some(_) if rotation_due(request.rotation, request.last_rotated, now) => {
            return regenerate(store, executor, &request, CredentialAction::Rotated, now).await;
        }
        Some(payload) => payload,
    };
    let last_rotated = request.last_rotated.unwrap_or(now);

    if payload.username != request.role {
        debug!(found = %payload.username, "Correcting username in secret");
        payload.username = request.role.to_string();
        store.put(&request.location, &payload).await?;
    }

    // Without the stored verifier drift cannot be detected; re-applying on
    // every cycle would never settle
    if request.verifier_hidden {
        debug!("Stored verifier is not readable, keeping the role password");
        return Ok(CredentialOutcome {
            action: CredentialAction::Unchanged,
            last_rotated,
        });
    }

    if password_matches(request.current_verifier, request.role, &payload.password) {
        return Ok(CredentialOutcome {
            action: CredentialAction::Unchanged,
            last_rotated,
        });
    }

    apply_password(executor, request.role, &payload.password, None).await?;
    info!("Re-applied role password from secret");
    Ok(CredentialOutcome {
        action: CredentialAction::Reapplied,
        last_rotated,
    })
}

/// Whether `interval` has elapsed since `last_rotated`
///
/// Without a recorded rotation the window starts now.
pub fn rotation_due(
    interval: Option<Duration>,
    last_rotated: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    match (interval, last_rotated) {
        (Some(interval), Some(last)) => {
            let interval = TimeDelta::from_std(interval).unwrap_or(TimeDelta::MAX);
            now.signed_duration_since(last) >= interval
        }
        _ => false,
    }
}

async fn regenerate(
    store: &dyn SecretStore,
    executor: &dyn SqlExecutor,
    request: &CredentialRequest<'_>,
    action: CredentialAction,
    now: DateTime<Utc>,
) -> Result<CredentialOutcome, CredentialError> {
    let payload = SecretPayload {
        username: request.role.to_string(),
        password: generate_password(),
    };
    store.put(&request.location, &payload).await?;
    apply_password(executor, request.role, &payload.password, Some(now)).await?;
    info!(action = ?action, "Generated new role password");
    Ok(CredentialOutcome {
        action,
        last_rotated: now,
    })
}

async fn apply_password(
    executor: &dyn SqlExecutor,
    role: &str,
    password: &str,
    rotated_at: Option<DateTime<Utc>>,
) -> Result<(), CredentialError> {
    let verifier = ScramVerifier::compute(password)?;
    let op = SqlOperation::SetPassword {
        name: role.to_string(),
        verifier: verifier.to_string(),
    };
    executor
        .execute(std::slice::from_ref(&op))
        .await
        .map(|_| ())
        .map_err(|source| CredentialError::Apply { rotated_at, source })
}
