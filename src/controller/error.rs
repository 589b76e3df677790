//! Error types for the access-management controllers

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::credentials::{CredentialError, SecretStoreError};
use crate::engine::ResolveError;
use crate::postgres::{CatalogError, ExecError, PoolError};

/// Error variants are named with the `Error` suffix for clarity (e.g., `KubeError`, `SqlApplyError`).
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Catalog read failed: {0}")]
    CatalogReadError(#[from] CatalogError),

    #[error("Connection pool error: {0}")]
    PoolError(PoolError),

    #[error("Credential store error: {0}")]
    CredentialStoreError(#[from] SecretStoreError),

    #[error("Credential apply error: {message}")]
    CredentialApplyError {
        /// Set when a new password reached the Secret before the failure
        rotated_at: Option<DateTime<Utc>>,
        message: String,
    },

    #[error("SQL apply failed: {0}")]
    SqlApplyError(#[from] ExecError),

    #[error("Unresolved dependency: {missing_ref}")]
    UnresolvedDependency { missing_ref: String },

    #[error("Invalid spec: {0}")]
    InvalidSpec(String),

    #[error("Ownership conflict: {object} is owned by {owner}")]
    OwnershipConflict { object: String, owner: String },

    #[error("Deletion deferred: {message}")]
    DeletionDeferred { reason: &'static str, message: String },
}

impl From<ResolveError> for Error {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Unresolved { missing_ref } => Error::UnresolvedDependency { missing_ref },
            ResolveError::Invalid(message) => Error::InvalidSpec(message),
        }
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::DatabaseMissing(database) => Error::UnresolvedDependency {
                missing_ref: format!("database {}", database),
            },
            other => Error::PoolError(other),
        }
    }
}

impl From<CredentialError> for Error {
    fn from(err: CredentialError) -> Self {
        let rotated_at = err.rotated_at();
        match err {
            CredentialError::Store(e) => Error::CredentialStoreError(e),
            other => Error::CredentialApplyError {
                rotated_at,
                message: other.to_string(),
            },
        }
    }
}

impl Error {
    /// Check if this error is retryable
    ///
    /// Non-retryable errors are terminal for the current spec generation.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(e) => match e {
                kube::Error::Api(api_err) => {
                    // 4xx errors (except 409 Conflict, 429 TooManyRequests) are usually not retryable
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        return code == 409 || code == 429;
                    }
                    true
                }
                _ => true,
            },
            Error::PoolError(PoolError::TlsConfig(_)) => false,
            Error::PoolError(_) => true,
            Error::CatalogReadError(_)
            | Error::CredentialStoreError(_)
            | Error::CredentialApplyError { .. }
            | Error::SqlApplyError(_)
            | Error::UnresolvedDependency { .. }
            | Error::DeletionDeferred { .. } => true,
            Error::InvalidSpec(_)
            | Error::OwnershipConflict { .. }
            | Error::SerializationError(_)
            | Error::MissingObjectKey(_) => false,
        }
    }

    /// Machine-readable reason for status conditions and events
    pub fn reason(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "KubeError",
            Error::SerializationError(_) => "SerializationError",
            Error::MissingObjectKey(_) => "MissingObjectKey",
            Error::CatalogReadError(_) => "CatalogReadError",
            Error::PoolError(_) => "ConnectionError",
            Error::CredentialStoreError(_) => "CredentialStoreError",
            Error::CredentialApplyError { .. } => "CredentialApplyError",
            Error::SqlApplyError(_) => "SqlApplyError",
            Error::UnresolvedDependency { .. } => "UnresolvedDependency",
            Error::InvalidSpec(_) => "InvalidSpec",
            Error::OwnershipConflict { .. } => "OwnershipConflict",
            Error::DeletionDeferred { reason, .. } => *reason,
        }
    }

    /// Whether the resource should wait in `Pending` rather than `Error`
    pub fn is_pending(&self) -> bool {
        matches!(self, Error::UnresolvedDependency { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Backoff for resources waiting on a dependency
    pub fn pending() -> Self {
        Self {
            initial_delay: Duration::from_secs(10),
            ..Self::default()
        }
    }

    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.min(32)).unwrap_or(32);
        let base_delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        let capped_delay = delay_with_jitter.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(capped_delay)
    }
}
