//! Reconciliation entry points for PostgresRole, PostgresDatabase and PostgresGrant
//!
//! The three kinds share one skeleton: deletion and finalizer handling, the
//! retry gate, a cycle against PostgreSQL and a single status write with the
//! phase the cycle settled in.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType};
use kube::{Api, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::controller::context::Context;
use crate::controller::cycle::{
    CycleFailure, CycleServices, PlannedCycle, plan_cycle, run_resolved, run_teardown,
};
use crate::controller::error::{Error, Result};
use crate::controller::state_machine::{
    ResourceEvent, ResourceStateMachine, TransitionContext, outcome_event,
};
use crate::controller::status::{StatusUpdate, next_status, patch_status, spec_changed};
use crate::credentials::secret_store::FIELD_MANAGER;
use crate::crd::{
    ManagedResource, PostgresDatabase, PostgresGrant, PostgresRole, ReclaimPolicy,
    RelatedResources, ResourceKind, ResourcePhase, ResourceStatus,
};
use crate::engine::OwnedObject;
use crate::postgres::{PgCatalog, PgExecutor, PoolError};
use crate::scoped_api;

/// Finalizer that keeps a resource until its PostgreSQL objects are released
pub const FINALIZER: &str = "postgres-operator.smoketurner.com/finalizer";

/// Resync interval for converged resources
pub const READY_REQUEUE: Duration = Duration::from_secs(300);

/// Reconcile a PostgresRole
#[instrument(skip(role, ctx), fields(kind = "PostgresRole", name = %role.name_any(), namespace = role.namespace().unwrap_or_default()))]
pub async fn reconcile_role(role: Arc<PostgresRole>, ctx: Arc<Context>) -> Result<Action> {
    reconcile_managed(ManagedResource::Role(role), &ctx).await
}

/// Reconcile a PostgresDatabase
#[instrument(skip(database, ctx), fields(kind = "PostgresDatabase", name = %database.name_any(), namespace = database.namespace().unwrap_or_default()))]
pub async fn reconcile_database(
    database: Arc<PostgresDatabase>,
    ctx: Arc<Context>,
) -> Result<Action> {
    reconcile_managed(ManagedResource::Database(database), &ctx).await
}

/// Reconcile a PostgresGrant
#[instrument(skip(grant, ctx), fields(kind = "PostgresGrant", name = %grant.name_any(), namespace = grant.namespace().unwrap_or_default()))]
pub async fn reconcile_grant(grant: Arc<PostgresGrant>, ctx: Arc<Context>) -> Result<Action> {
    reconcile_managed(ManagedResource::Grant(grant), &ctx).await
}

/// Error policy shared by the three controllers
///
/// Cycle failures are recorded in status and requeued by the reconciler
/// itself; this only sees Kubernetes API failures around it.
pub fn error_policy<K>(resource: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    let name = resource.name_any();
    let kind = K::kind(&());
    let delay = ctx.backoff.delay_for_attempt(0);

    if error.is_retryable() {
        warn!(kind = %kind, name = %name, error = %error, "Retryable error, requeuing in {:?}", delay);
        Action::requeue(delay)
    } else {
        error!(kind = %kind, name = %name, error = %error, "Non-retryable error, waiting for a change");
        Action::await_change()
    }
}

async fn reconcile_managed(resource: ManagedResource, ctx: &Context) -> Result<Action> {
    let started = Instant::now();
    let kind = resource.kind();
    let result = reconcile_inner(&resource, ctx).await;

    if let Some(state) = &ctx.health_state {
        state
            .metrics
            .record_reconcile(kind, started.elapsed().as_secs_f64());
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        state.touch(now);
        if let Err(e) = &result {
            state.metrics.record_error(kind, e.reason());
        }
    }
    result
}

async fn reconcile_inner(resource: &ManagedResource, ctx: &Context) -> Result<Action> {
    let key = resource.key();
    let generation = resource.generation();

    let deleting = resource.is_deleting();
    if let Some(wait) = ctx.retry_gate.remaining(&key, generation, deleting) {
        debug!(wait = ?wait, "Backing off");
        return Ok(Action::requeue(wait));
    }

    if deleting {
        return handle_deletion(resource, ctx).await;
    }

    if !resource.has_finalizer(FINALIZER) {
        add_finalizer(resource, ctx).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let prev = resource.status();
    let current_phase = resource.phase();
    let transition = TransitionContext::new(generation, prev.and_then(|s| s.failed_generation));
    if current_phase == ResourcePhase::Error && transition.is_terminal_failure() {
        debug!(generation = ?generation, "Spec failed terminally, waiting for a change");
        return Ok(Action::await_change());
    }
    if spec_changed(resource) {
        info!(
            observed = ?prev.and_then(|s| s.observed_generation),
            generation = ?generation,
            "Spec changed, reconciling"
        );
    }

    let related = list_related(ctx).await?;
    if let Some(state) = &ctx.health_state {
        state.metrics.set_resources_by_phase(&related);
    }

    evict_reclaimed_pools(resource, ctx);
    let timeout = ctx.pools.operation_timeout();
    let outcome = match plan_cycle(resource, &related, ctx.pools.maintenance_database()) {
        Ok(PlannedCycle { desired, database }) => match ctx.pools.connection(&database).await {
            Ok(conn) => {
                let catalog = PgCatalog::new(&conn, &database, timeout);
                let executor = PgExecutor::new(&conn, timeout);
                let services = CycleServices {
                    catalog: &catalog,
                    executor: &executor,
                    secrets: ctx.secrets.as_ref(),
                };
                run_resolved(resource, desired, services, Utc::now()).await
            }
            Err(e) => Err(CycleFailure::before_apply(e)),
        },
        Err(failure) => Err(failure),
    };

    let machine = ResourceStateMachine::new();
    let now = Utc::now();
    match outcome {
        Ok(report) => {
            let phase = machine.settle(current_phase, ResourceEvent::Converged, &transition);
            let status = next_status(
                prev,
                phase,
                generation,
                StatusUpdate::Converged {
                    owned_objects: report.owned_objects,
                    applied: report.applied,
                    credential: report.credential,
                },
                now,
            );
            write_status(ctx, resource, prev, &status).await?;
            ctx.retry_gate.clear(&key);

            if let Some(state) = &ctx.health_state {
                state
                    .metrics
                    .record_sql_operations(resource.kind(), report.applied);
            }
            if report.applied > 0 {
                publish(
                    ctx,
                    resource,
                    EventType::Normal,
                    "Reconciled",
                    format!("Applied {} operations", report.applied),
                )
                .await;
            }
            Ok(Action::requeue(READY_REQUEUE))
        }
        Err(failure) => {
            let error = &failure.error;
            let phase = machine.settle(current_phase, outcome_event(Some(error)), &transition);
            let status = next_status(
                prev,
                phase,
                generation,
                StatusUpdate::Failed {
                    error,
                    owned_objects: failure.owned_objects.clone(),
                    credential: failure.credential.clone(),
                },
                now,
            );
            write_status(ctx, resource, prev, &status).await?;

            if let Some(state) = &ctx.health_state {
                state
                    .metrics
                    .record_error(resource.kind(), error.reason());
                state
                    .metrics
                    .record_sql_operations(resource.kind(), failure.applied);
            }
            publish(ctx, resource, EventType::Warning, error.reason(), error.to_string()).await;

            if !error.is_retryable() {
                error!(error = %error, "Reconciliation failed, waiting for a spec change");
                ctx.retry_gate.clear(&key);
                return Ok(Action::await_change());
            }

            let backoff = if error.is_pending() {
                &ctx.pending_backoff
            } else {
                &ctx.backoff
            };
            let delay = backoff.delay_for_attempt(status.retry_count.saturating_sub(1));
            if error.is_pending() {
                info!(error = %error, "Waiting for dependency, requeuing in {:?}", delay);
            } else {
                warn!(error = %error, "Reconciliation failed, requeuing in {:?}", delay);
            }
            ctx.retry_gate.hold(&key, generation, false, delay);
            Ok(Action::requeue(delay))
        }
    }
}

/// Release owned objects, then let Kubernetes delete the resource
async fn handle_deletion(resource: &ManagedResource, ctx: &Context) -> Result<Action> {
    let key = resource.key();
    if !resource.has_finalizer(FINALIZER) {
        return Ok(Action::await_change());
    }
    info!("Releasing PostgreSQL objects");

    let related = list_related(ctx).await?;
    evict_reclaimed_pools(resource, ctx);
    let database = match resource {
        ManagedResource::Grant(grant) => grant.spec.database.clone(),
        _ => ctx.pools.maintenance_database().to_string(),
    };
    let timeout = ctx.pools.operation_timeout();

    let result = match ctx.pools.connection(&database).await {
        Ok(conn) => {
            let catalog = PgCatalog::new(&conn, &database, timeout);
            let executor = PgExecutor::new(&conn, timeout);
            let services = CycleServices {
                catalog: &catalog,
                executor: &executor,
                secrets: ctx.secrets.as_ref(),
            };
            run_teardown(resource, &related, services).await
        }
        // Nothing left to revoke inside a database that is gone
        Err(PoolError::DatabaseMissing(name)) if resource.kind() == ResourceKind::Grant => {
            info!(database = %name, "Database no longer exists");
            Ok(0)
        }
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(applied) => {
            if let Some(state) = &ctx.health_state {
                state.metrics.record_sql_operations(resource.kind(), applied);
            }
            remove_finalizer(resource, ctx).await?;
            ctx.retry_gate.clear(&key);
            Ok(Action::await_change())
        }
        Err(error) => {
            let prev = resource.status();
            let machine = ResourceStateMachine::new();
            let transition = TransitionContext::new(
                resource.generation(),
                prev.and_then(|s| s.failed_generation),
            );
            let phase = machine.settle(
                resource.phase(),
                ResourceEvent::DeletionRequested,
                &transition,
            );
            let status = next_status(
                prev,
                phase,
                resource.generation(),
                StatusUpdate::Terminating {
                    deferred: Some(&error),
                },
                Utc::now(),
            );
            write_status(ctx, resource, prev, &status).await?;

            if let Some(state) = &ctx.health_state {
                state.metrics.record_error(resource.kind(), error.reason());
            }
            publish(ctx, resource, EventType::Warning, error.reason(), error.to_string()).await;

            let delay = ctx
                .backoff
                .delay_for_attempt(status.retry_count.saturating_sub(1));
            warn!(error = %error, "Deletion deferred, requeuing in {:?}", delay);
            ctx.retry_gate.hold(&key, resource.generation(), true, delay);
            Ok(Action::requeue(delay))
        }
    }
}

/// Close pools to owned databases this cycle may drop
fn evict_reclaimed_pools(resource: &ManagedResource, ctx: &Context) {
    let ManagedResource::Database(database) = resource else {
        return;
    };
    if database.spec.reclaim_policy != ReclaimPolicy::Delete {
        return;
    }
    let dropped = resource
        .owned_objects()
        .iter()
        .filter_map(|key| match key.parse::<OwnedObject>() {
            Ok(OwnedObject::Database(name)) => Some(name),
            _ => None,
        })
        .filter(|name| resource.is_deleting() || *name != database.spec.name);
    for name in dropped {
        ctx.pools.evict(&name);
    }
}

/// Every managed resource the operator can see
async fn list_related(ctx: &Context) -> Result<RelatedResources> {
    let ns = ctx.watch_namespace.as_deref();
    let params = ListParams::default();
    let roles = scoped_api::<PostgresRole>(ctx.client.clone(), ns)
        .list(&params)
        .await?;
    let databases = scoped_api::<PostgresDatabase>(ctx.client.clone(), ns)
        .list(&params)
        .await?;
    let grants = scoped_api::<PostgresGrant>(ctx.client.clone(), ns)
        .list(&params)
        .await?;

    Ok(RelatedResources {
        roles: roles.items.into_iter().map(Arc::new).collect(),
        databases: databases.items.into_iter().map(Arc::new).collect(),
        grants: grants.items.into_iter().map(Arc::new).collect(),
    })
}

async fn write_status(
    ctx: &Context,
    resource: &ManagedResource,
    prev: Option<&ResourceStatus>,
    status: &ResourceStatus,
) -> Result<()> {
    let ns = resource.namespace();
    let name = resource.name();
    let written = match resource {
        ManagedResource::Role(_) => {
            let api: Api<PostgresRole> = Api::namespaced(ctx.client.clone(), &ns);
            patch_status(&api, &name, prev, status).await?
        }
        ManagedResource::Database(_) => {
            let api: Api<PostgresDatabase> = Api::namespaced(ctx.client.clone(), &ns);
            patch_status(&api, &name, prev, status).await?
        }
        ManagedResource::Grant(_) => {
            let api: Api<PostgresGrant> = Api::namespaced(ctx.client.clone(), &ns);
            patch_status(&api, &name, prev, status).await?
        }
    };
    if written {
        debug!(phase = %status.phase, "Updated status");
    }
    Ok(())
}

/// Replace the finalizer list with `finalizers`
async fn patch_finalizers(
    resource: &ManagedResource,
    ctx: &Context,
    finalizers: Vec<String>,
) -> Result<()> {
    let ns = resource.namespace();
    let name = resource.name();
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    let params = PatchParams::apply(FIELD_MANAGER);
    let patch = Patch::Merge(&patch);

    match resource {
        ManagedResource::Role(_) => {
            let api: Api<PostgresRole> = Api::namespaced(ctx.client.clone(), &ns);
            api.patch(&name, &params, &patch).await?;
        }
        ManagedResource::Database(_) => {
            let api: Api<PostgresDatabase> = Api::namespaced(ctx.client.clone(), &ns);
            api.patch(&name, &params, &patch).await?;
        }
        ManagedResource::Grant(_) => {
            let api: Api<PostgresGrant> = Api::namespaced(ctx.client.clone(), &ns);
            api.patch(&name, &params, &patch).await?;
        }
    }
    Ok(())
}

async fn add_finalizer(resource: &ManagedResource, ctx: &Context) -> Result<()> {
    let mut finalizers = resource.meta().finalizers.clone().unwrap_or_default();
    finalizers.push(FINALIZER.to_string());
    patch_finalizers(resource, ctx, finalizers).await?;
    info!("Added finalizer");
    Ok(())
}

async fn remove_finalizer(resource: &ManagedResource, ctx: &Context) -> Result<()> {
    let finalizers: Vec<String> = resource
        .meta()
        .finalizers
        .iter()
        .flatten()
        .filter(|f| f.as_str() != FINALIZER)
        .cloned()
        .collect();
    patch_finalizers(resource, ctx, finalizers).await?;
    info!("Removed finalizer");
    Ok(())
}

/// Publish an event on the resource; failures are only logged
async fn publish(
    ctx: &Context,
    resource: &ManagedResource,
    type_: EventType,
    reason: &str,
    note: String,
) {
    let event = Event {
        type_,
        reason: reason.to_string(),
        note: Some(note),
        action: "Reconcile".to_string(),
        secondary: None,
    };
    if let Err(e) = ctx.recorder.publish(&event, &resource.object_ref()).await {
        warn!(error = %e, reason = %reason, "Failed to publish event");
    }
}
