//! Status and conditions management for managed resources
//!
//! Status is computed by pure functions from the previous status and the
//! outcome of a cycle, then written as a full replace of `.status`. Writes
//! are skipped when nothing changed so a steady resource does not trigger
//! its own watch.

use std::fmt::Debug;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::Api;
use kube::api::{Patch, PatchParams};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::controller::error::{Error, Result};
use crate::credentials::secret_store::FIELD_MANAGER;
use crate::crd::{Condition, CredentialStatus, ManagedResource, ResourcePhase, ResourceStatus};

/// Standard condition types following Kubernetes conventions
pub mod condition_types {
    /// PostgreSQL matches the spec
    pub const READY: &str = "Ready";
    /// Last successful convergence
    pub const SYNCED: &str = "Synced";
    /// Last error kind and message, removed on success
    pub const ERROR: &str = "Error";
}

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
    pub const UNKNOWN: &str = "Unknown";
}

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
    now: String,
}

impl ConditionBuilder {
    pub fn new(generation: Option<i64>, now: DateTime<Utc>) -> Self {
        Self::from_existing(Vec::new(), generation, now)
    }

    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>, now: DateTime<Utc>) -> Self {
        Self {
            conditions: existing,
            generation,
            now: now.to_rfc3339(),
        }
    }

    /// Set a condition, updating if it exists or adding if it doesn't
    ///
    /// `lastTransitionTime` only moves when the status value changes.
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = self.now.clone();
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: self.now.clone(),
                observed_generation: self.generation,
            });
        }
        self
    }

    pub fn remove(mut self, type_: &str) -> Self {
        self.conditions.retain(|c| c.type_ != type_);
        self
    }

    pub fn ready(self, is_ready: bool, reason: &str, message: &str) -> Self {
        self.set_condition(condition_types::READY, bool_status(is_ready), reason, message)
    }

    pub fn synced(self, reason: &str, message: &str) -> Self {
        self.set_condition(condition_types::SYNCED, condition_status::TRUE, reason, message)
    }

    pub fn error(self, reason: &str, message: &str) -> Self {
        self.set_condition(condition_types::ERROR, condition_status::TRUE, reason, message)
    }

    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

fn bool_status(value: bool) -> &'static str {
    if value {
        condition_status::TRUE
    } else {
        condition_status::FALSE
    }
}

/// A successful cycle newer than this refreshes `lastSynced`
pub const SYNC_REFRESH: Duration = Duration::from_secs(60);

/// What a cycle did, as far as status is concerned
#[derive(Debug)]
pub enum StatusUpdate<'a> {
    /// PostgreSQL matches the spec
    Converged {
        owned_objects: Vec<String>,
        applied: usize,
        credential: Option<CredentialStatus>,
    },
    /// The cycle failed or is waiting on a dependency
    Failed {
        error: &'a Error,
        /// Ownership after a partial apply, `None` keeps the previous list
        owned_objects: Option<Vec<String>>,
        credential: Option<CredentialStatus>,
    },
    /// The resource is being deleted; `deferred` is set while teardown waits
    Terminating { deferred: Option<&'a Error> },
}

/// Next status for a resource in `phase` after `update`
pub fn next_status(
    prev: Option<&ResourceStatus>,
    phase: ResourcePhase,
    generation: Option<i64>,
    update: StatusUpdate<'_>,
    now: DateTime<Utc>,
) -> ResourceStatus {
    let prev = prev.cloned().unwrap_or_default();
    let conditions = ConditionBuilder::from_existing(prev.conditions.clone(), generation, now);

    match update {
        StatusUpdate::Converged {
            owned_objects,
            applied,
            credential,
        } => {
            // The watch event from our own status write comes back within
            // SYNC_REFRESH and must not produce another write
            let recent = prev
                .last_synced
                .as_deref()
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|at| at.with_timezone(&Utc))
                .and_then(|at| now.signed_duration_since(at).to_std().ok())
                .is_some_and(|age| age < SYNC_REFRESH);
            let steady = applied == 0
                && prev.phase == ResourcePhase::Ready
                && prev.observed_generation == generation
                && recent;
            let last_synced = if steady {
                prev.last_synced.clone()
            } else {
                Some(now.to_rfc3339())
            };

            ResourceStatus {
                phase,
                conditions: conditions
                    .ready(true, "Reconciled", "PostgreSQL matches the spec")
                    .synced("Synced", "All operations applied")
                    .remove(condition_types::ERROR)
                    .build(),
                observed_generation: generation,
                owned_objects,
                last_synced,
                retry_count: 0,
                failed_generation: None,
                last_error: None,
                credential: credential.or(prev.credential),
            }
        }
        StatusUpdate::Failed {
            error,
            owned_objects,
            credential,
        } => {
            let message = error.to_string();
            ResourceStatus {
                phase,
                conditions: conditions
                    .ready(false, error.reason(), &message)
                    .error(error.reason(), &message)
                    .build(),
                observed_generation: generation,
                owned_objects: owned_objects.unwrap_or(prev.owned_objects),
                last_synced: prev.last_synced,
                retry_count: prev.retry_count.saturating_add(1),
                failed_generation: if error.is_retryable() {
                    None
                } else {
                    generation
                },
                last_error: Some(message),
                credential: credential.or(prev.credential),
            }
        }
        StatusUpdate::Terminating { deferred } => {
            let (conditions, retry_count, last_error) = match deferred {
                Some(error) => {
                    let message = error.to_string();
                    (
                        conditions
                            .ready(false, error.reason(), &message)
                            .error(error.reason(), &message),
                        prev.retry_count.saturating_add(1),
                        Some(message),
                    )
                }
                None => (
                    conditions.ready(false, "Terminating", "Releasing PostgreSQL objects"),
                    prev.retry_count,
                    prev.last_error,
                ),
            };
            ResourceStatus {
                phase,
                conditions: conditions.build(),
                retry_count,
                last_error,
                ..prev
            }
        }
    }
}

/// Check if the spec has changed since the last reconciliation
pub fn spec_changed(resource: &ManagedResource) -> bool {
    let observed = resource.status().and_then(|s| s.observed_generation);
    match (resource.generation(), observed) {
        (Some(current), Some(observed)) => current != observed,
        _ => true,
    }
}

/// Write `status` as a full replace unless it equals `prev`
pub async fn patch_status<K>(
    api: &Api<K>,
    name: &str,
    prev: Option<&ResourceStatus>,
    status: &ResourceStatus,
) -> Result<bool>
where
    K: Clone + DeserializeOwned + Debug,
{
    if prev == Some(status) {
        debug!(name = %name, "Status unchanged, skipping patch");
        return Ok(false);
    }

    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(true)
}
