//! One reconciliation cycle against PostgreSQL
//!
//! The cycle only talks to the outside world through [`CatalogQuery`],
//! [`SqlExecutor`] and [`SecretStore`], so it runs unchanged against the live
//! pools and against in-memory fakes.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use kube::Resource;
use tracing::{debug, info, warn};

use crate::controller::error::Error;
use crate::credentials::{
    CredentialAction, CredentialRequest, SecretLocation, SecretStore, ensure_credential,
};
use crate::crd::{
    CredentialStatus, ManagedResource, ReclaimPolicy, RelatedResources, ResourceKey,
};
use crate::engine::{
    ActualState, DesiredState, OwnedObject, SqlOperation, diff, foreign_claims, read_actual_state,
    resolve,
};
use crate::postgres::{CatalogQuery, SqlExecutor};

/// Backends a cycle runs against
#[derive(Clone, Copy)]
pub struct CycleServices<'a> {
    pub catalog: &'a dyn CatalogQuery,
    pub executor: &'a dyn SqlExecutor,
    pub secrets: &'a dyn SecretStore,
}

/// Result of a converged cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    /// SQL operations applied, password changes included
    pub applied: usize,
    /// Owned object keys to record in status
    pub owned_objects: Vec<String>,
    pub credential: Option<CredentialStatus>,
}

/// A failed cycle with whatever it managed to change
#[derive(Debug)]
pub struct CycleFailure {
    pub error: Error,
    pub applied: usize,
    /// Ownership after a partial apply; `None` when nothing was applied
    pub owned_objects: Option<Vec<String>>,
    pub credential: Option<CredentialStatus>,
}

impl CycleFailure {
    /// Failure before any statement ran
    pub fn before_apply(error: impl Into<Error>) -> Self {
        Self {
            error: error.into(),
            applied: 0,
            owned_objects: None,
            credential: None,
        }
    }
}

fn keys(objects: &BTreeSet<OwnedObject>) -> Vec<String> {
    objects.iter().map(ToString::to_string).collect()
}

/// A resolved resource and the database its cycle runs on
#[derive(Debug, Clone)]
pub struct PlannedCycle {
    pub desired: DesiredState,
    pub database: String,
}

/// Resolve `resource` before any connection is opened
///
/// Grants run on their own database; everything else on the maintenance
/// database. A spec that cannot resolve fails here, so an invalid grant on a
/// database that does not exist is reported as invalid rather than pending.
pub fn plan_cycle(
    resource: &ManagedResource,
    related: &RelatedResources,
    maintenance_database: &str,
) -> Result<PlannedCycle, CycleFailure> {
    let desired = resolve(resource, related).map_err(CycleFailure::before_apply)?;
    let database = match resource {
        ManagedResource::Grant(grant) => grant.spec.database.clone(),
        _ => maintenance_database.to_string(),
    };
    Ok(PlannedCycle { desired, database })
}

/// Resolve, read, diff, apply and settle credentials for `resource`
pub async fn run_cycle(
    resource: &ManagedResource,
    related: &RelatedResources,
    services: CycleServices<'_>,
    now: DateTime<Utc>,
) -> Result<CycleReport, CycleFailure> {
    let desired = resolve(resource, related).map_err(CycleFailure::before_apply)?;
    run_resolved(resource, desired, services, now).await
}

/// Read, diff, apply and settle credentials for an already resolved resource
pub async fn run_resolved(
    resource: &ManagedResource,
    desired: DesiredState,
    services: CycleServices<'_>,
    now: DateTime<Utc>,
) -> Result<CycleReport, CycleFailure> {
    let actual = read_actual_state(services.catalog, &desired.scope)
        .await
        .map_err(CycleFailure::before_apply)?;
    desired
        .check_external(&actual)
        .map_err(CycleFailure::before_apply)?;

    if let Some((object, owner)) = desired.conflicts(&actual).into_iter().next() {
        return Err(CycleFailure::before_apply(Error::OwnershipConflict {
            object: object.to_string(),
            owner: owner.to_string(),
        }));
    }

    let ops = diff(&actual, &desired);
    for op in &ops {
        debug!(statement = %op, "Planned operation");
    }

    let mut projected = actual.clone();
    let applied = match services.executor.execute(&ops).await {
        Ok(applied) => applied,
        Err(e) => {
            let applied = e.applied();
            let owned = partial_ownership(&desired, &mut projected, &ops[..applied.min(ops.len())]);
            warn!(applied, total = ops.len(), error = %e, "Apply stopped early");
            return Err(CycleFailure {
                error: e.into(),
                applied,
                owned_objects: (applied > 0).then(|| keys(&owned)),
                credential: None,
            });
        }
    };
    for op in &ops {
        projected.apply(op);
    }
    let owned = keys(&desired.owned_objects(&projected));

    let mut report = CycleReport {
        applied,
        owned_objects: owned,
        credential: None,
    };

    let Some(credential) = desired.credential.as_ref() else {
        if applied > 0 {
            info!(applied, "Applied changes");
        }
        return Ok(report);
    };

    let previous = resource.status().and_then(|s| s.credential.as_ref());
    let last_rotated = previous
        .filter(|c| c.secret_name == credential.secret_name)
        .and_then(|c| c.last_rotated.as_deref())
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc));

    let request = CredentialRequest {
        role: &credential.role,
        location: SecretLocation {
            namespace: credential.secret_namespace.clone(),
            name: credential.secret_name.clone(),
            owner: secret_owner(resource, &credential.secret_namespace),
        },
        rotation: credential.rotation,
        last_rotated,
        current_verifier: projected
            .roles
            .get(&credential.role)
            .and_then(|r| r.password.as_deref()),
        verifier_hidden: projected
            .roles
            .get(&credential.role)
            .is_some_and(|r| r.password_hidden),
    };

    match ensure_credential(services.secrets, services.executor, request, now).await {
        Ok(outcome) => {
            if outcome.action != CredentialAction::Unchanged {
                report.applied += 1;
            }
            report.credential = Some(CredentialStatus {
                secret_name: credential.secret_name.clone(),
                last_rotated: Some(outcome.last_rotated.to_rfc3339()),
            });
            info!(applied = report.applied, "Applied changes");
            Ok(report)
        }
        Err(e) => {
            let credential = e.rotated_at().map(|at| CredentialStatus {
                secret_name: credential.secret_name.clone(),
                last_rotated: Some(at.to_rfc3339()),
            });
            Err(CycleFailure {
                error: e.into(),
                applied: report.applied,
                owned_objects: Some(report.owned_objects),
                credential,
            })
        }
    }
}

/// Ownership after the first `applied` operations: what was held before plus
/// what the applied statements created for this resource
fn partial_ownership(
    desired: &DesiredState,
    projected: &mut ActualState,
    applied: &[SqlOperation],
) -> BTreeSet<OwnedObject> {
    for op in applied {
        projected.apply(op);
    }
    let wanted = desired.owned_objects(projected);
    let mut owned = desired.previously_owned.clone();
    owned.extend(
        applied
            .iter()
            .map(SqlOperation::target)
            .filter(|target| wanted.contains(target)),
    );
    owned
}

/// Owner reference for credential Secrets living next to their role
fn secret_owner(
    resource: &ManagedResource,
    secret_namespace: &str,
) -> Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference> {
    match resource {
        ManagedResource::Role(role) if resource.namespace() == secret_namespace => {
            role.controller_owner_ref(&())
        }
        _ => None,
    }
}

/// Release everything `resource` owns
///
/// Fails with [`Error::DeletionDeferred`] while live resources still depend on
/// a role or database that would be dropped. Returns the number of operations
/// applied.
pub async fn run_teardown(
    resource: &ManagedResource,
    related: &RelatedResources,
    services: CycleServices<'_>,
) -> Result<usize, Error> {
    let key = resource.key();
    let owned: BTreeSet<OwnedObject> = resource
        .owned_objects()
        .iter()
        .filter_map(|k| k.parse().ok())
        .collect();
    let claims = foreign_claims(&key, related);
    let reclaim = match resource {
        ManagedResource::Database(database) => {
            database.spec.reclaim_policy == ReclaimPolicy::Delete
        }
        _ => false,
    };

    for object in owned.iter().filter(|o| !claims.contains_key(*o)) {
        match object {
            OwnedObject::Role(name) => {
                if let Some(dependent) = role_dependent(related, &key, name) {
                    return Err(Error::DeletionDeferred {
                        reason: "RoleStillReferenced",
                        message: format!("role {} is still referenced by {}", name, dependent),
                    });
                }
            }
            OwnedObject::Database(name) if reclaim => {
                if let Some(dependent) = database_dependent(related, &key, name) {
                    return Err(Error::DeletionDeferred {
                        reason: "DatabaseStillReferenced",
                        message: format!(
                            "database {} is still referenced by {}",
                            name, dependent
                        ),
                    });
                }
            }
            _ => {}
        }
    }

    let release = DesiredState::release(key, owned, claims, reclaim);
    let actual = read_actual_state(services.catalog, &release.scope).await?;
    let ops = diff(&actual, &release);
    for op in &ops {
        debug!(statement = %op, "Planned release");
    }
    let applied = services.executor.execute(&ops).await?;
    if applied > 0 {
        info!(applied, "Released owned objects");
    }
    Ok(applied)
}

/// First live resource other than `key` that needs role `name`
fn role_dependent(related: &RelatedResources, key: &ResourceKey, name: &str) -> Option<ResourceKey> {
    related
        .others(key)
        .filter(|r| !r.is_deleting())
        .find(|r| match r {
            ManagedResource::Role(role) => role.spec.member_of.iter().any(|p| p == name),
            ManagedResource::Database(database) => database.spec.owner == name,
            ManagedResource::Grant(grant) => grant.spec.role == name,
        })
        .map(|r| r.key())
}

fn database_dependent(
    related: &RelatedResources,
    key: &ResourceKey,
    name: &str,
) -> Option<ResourceKey> {
    related
        .grants
        .iter()
        .filter(|g| g.metadata.deletion_timestamp.is_none() && g.spec.database == name)
        .map(|g| ManagedResource::Grant(g.clone()).key())
        .find(|k| k != key)
}
