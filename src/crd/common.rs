//! Types shared by all access-management CRDs

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to a Kubernetes Secret
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    /// Name of the Secret
    pub name: String,

    /// Namespace of the Secret (defaults to the namespace of the referencing resource)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl SecretRef {
    /// Namespace this reference resolves to when declared in `own_namespace`
    pub fn namespace_or<'a>(&'a self, own_namespace: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(own_namespace)
    }
}

/// What happens to the PostgreSQL object when the resource is deleted
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum ReclaimPolicy {
    /// Leave the object in PostgreSQL
    #[default]
    Retain,
    /// Drop the object from PostgreSQL
    Delete,
}

/// Lifecycle phase of a managed resource
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub enum ResourcePhase {
    /// Waiting for dependencies or first reconciliation
    #[default]
    Pending,
    /// Changes are being applied
    Reconciling,
    /// PostgreSQL matches the declared state
    Ready,
    /// The last reconciliation failed, see conditions
    Error,
    /// Resource is being deleted
    Terminating,
}

impl ResourcePhase {
    pub const ALL: [ResourcePhase; 5] = [
        ResourcePhase::Pending,
        ResourcePhase::Reconciling,
        ResourcePhase::Ready,
        ResourcePhase::Error,
        ResourcePhase::Terminating,
    ];
}

impl std::fmt::Display for ResourcePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourcePhase::Pending => write!(f, "Pending"),
            ResourcePhase::Reconciling => write!(f, "Reconciling"),
            ResourcePhase::Ready => write!(f, "Ready"),
            ResourcePhase::Error => write!(f, "Error"),
            ResourcePhase::Terminating => write!(f, "Terminating"),
        }
    }
}

/// Kubernetes-style status condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (Ready, Synced, Error)
    #[serde(rename = "type")]
    pub type_: String,

    /// True, False or Unknown
    pub status: String,

    /// Machine-readable reason for the last transition
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// RFC 3339 timestamp of the last status change
    pub last_transition_time: String,

    /// Generation the condition was computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Credential bookkeeping for roles with a password secret
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialStatus {
    /// Secret that holds the password
    pub secret_name: String,

    /// RFC 3339 timestamp of the last password generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rotated: Option<String>,
}

/// Status shared by PostgresRole, PostgresDatabase and PostgresGrant
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: ResourcePhase,

    /// Ready, Synced and Error conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Generation of the spec last reconciled
    #[serde(default)]
    pub observed_generation: Option<i64>,

    /// PostgreSQL objects this resource applied and therefore owns
    #[serde(default)]
    pub owned_objects: Vec<String>,

    /// RFC 3339 timestamp of the last successful convergence
    #[serde(default)]
    pub last_synced: Option<String>,

    /// Consecutive failed or pending reconciliations
    #[serde(default)]
    pub retry_count: u32,

    /// Generation that failed with a non-retryable error
    #[serde(default)]
    pub failed_generation: Option<i64>,

    /// Last error message, cleared on success
    #[serde(default)]
    pub last_error: Option<String>,

    /// Password bookkeeping (roles only)
    #[serde(default)]
    pub credential: Option<CredentialStatus>,
}

/// Parse a duration string like "30s", "15m", "12h" or "90d"
///
/// A bare number is read as seconds. Zero and negative values are rejected.
pub fn parse_duration(duration: &str) -> Option<Duration> {
    let duration = duration.trim();
    if duration.is_empty() {
        return None;
    }

    let (digits, multiplier) = match duration.char_indices().last() {
        Some((idx, 's')) => (&duration[..idx], 1),
        Some((idx, 'm')) => (&duration[..idx], 60),
        Some((idx, 'h')) => (&duration[..idx], 3600),
        Some((idx, 'd')) => (&duration[..idx], 86400),
        _ => (duration, 1),
    };

    let value = digits.trim().parse::<u64>().ok()?;
    if value == 0 {
        return None;
    }
    value.checked_mul(multiplier).map(Duration::from_secs)
}
