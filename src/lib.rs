pub mod controller;
pub mod credentials;
pub mod crd;
pub mod engine;
pub mod health;
pub mod postgres;

pub use controller::{
    BackoffConfig, Context, Error, FINALIZER, Result, error_policy, reconcile_database,
    reconcile_grant, reconcile_role,
};
pub use crd::{PostgresDatabase, PostgresGrant, PostgresRole};
pub use health::{HealthState, Metrics};

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::Controller;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;

/// Helper to create a namespaced or cluster-wide API based on scope.
pub(crate) fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Log the outcome of one controller step
async fn log_result<K, E>(
    kind: &'static str,
    result: std::result::Result<(ObjectRef<K>, kube::runtime::controller::Action), E>,
) where
    K: Resource,
    E: std::fmt::Debug,
{
    match result {
        Ok((obj, _action)) => {
            tracing::debug!(kind, name = %obj.name, "Reconciled");
        }
        Err(e) => {
            // Watch events for objects that were just deleted end up here
            let rendered = format!("{:?}", e);
            if rendered.contains("NotFound") {
                tracing::debug!(kind, "Object no longer exists: {}", rendered);
            } else {
                tracing::error!(kind, "Reconciliation error: {}", rendered);
            }
        }
    }
}

/// Run the PostgresRole controller
///
/// Secrets are watched as well so that editing a role's password Secret
/// re-applies the password without waiting for the next resync.
pub async fn run_role_controller(ctx: Arc<Context>) {
    let namespace = ctx.watch_namespace.clone();
    tracing::info!(
        scope = namespace.as_deref().unwrap_or("cluster-wide"),
        "Starting controller for PostgresRole resources"
    );

    let roles: Api<PostgresRole> = scoped_api(ctx.client.clone(), namespace.as_deref());
    let secrets: Api<Secret> = scoped_api(ctx.client.clone(), namespace.as_deref());

    // Use any_semantic() for more reliable resource discovery in test environments
    let watcher_config = WatcherConfig::default().any_semantic();

    let controller = Controller::new(roles, watcher_config.clone());
    let store = controller.store();
    controller
        .watches(secrets, watcher_config, move |secret: Secret| {
            let namespace = secret.namespace().unwrap_or_default();
            let name = secret.name_any();
            store
                .state()
                .into_iter()
                .filter(|role| role.uses_secret(&namespace, &name))
                .map(|role| ObjectRef::from_obj(role.as_ref()))
                .collect::<Vec<_>>()
        })
        .run(reconcile_role, error_policy, ctx)
        .for_each(|result| log_result("PostgresRole", result))
        .await;

    // This should never complete in normal operation
    tracing::error!("PostgresRole controller stream ended unexpectedly");
}

/// Run the PostgresDatabase controller
pub async fn run_database_controller(ctx: Arc<Context>) {
    let namespace = ctx.watch_namespace.clone();
    tracing::info!(
        scope = namespace.as_deref().unwrap_or("cluster-wide"),
        "Starting controller for PostgresDatabase resources"
    );

    let databases: Api<PostgresDatabase> = scoped_api(ctx.client.clone(), namespace.as_deref());
    Controller::new(databases, WatcherConfig::default().any_semantic())
        .run(reconcile_database, error_policy, ctx)
        .for_each(|result| log_result("PostgresDatabase", result))
        .await;

    tracing::error!("PostgresDatabase controller stream ended unexpectedly");
}

/// Run the PostgresGrant controller
pub async fn run_grant_controller(ctx: Arc<Context>) {
    let namespace = ctx.watch_namespace.clone();
    tracing::info!(
        scope = namespace.as_deref().unwrap_or("cluster-wide"),
        "Starting controller for PostgresGrant resources"
    );

    let grants: Api<PostgresGrant> = scoped_api(ctx.client.clone(), namespace.as_deref());
    Controller::new(grants, WatcherConfig::default().any_semantic())
        .run(reconcile_grant, error_policy, ctx)
        .for_each(|result| log_result("PostgresGrant", result))
        .await;

    tracing::error!("PostgresGrant controller stream ended unexpectedly");
}
