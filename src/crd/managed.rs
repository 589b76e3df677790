//! Uniform view over the three managed resource kinds

use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};

use super::common::{ResourcePhase, ResourceStatus};
use super::{PostgresDatabase, PostgresGrant, PostgresRole};

/// Kind of a managed resource
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Role,
    Database,
    Grant,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Role => "PostgresRole",
            ResourceKind::Database => "PostgresDatabase",
            ResourceKind::Grant => "PostgresGrant",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a managed resource
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// One of the reconciled resource kinds
#[derive(Clone, Debug)]
pub enum ManagedResource {
    Role(Arc<PostgresRole>),
    Database(Arc<PostgresDatabase>),
    Grant(Arc<PostgresGrant>),
}

impl ManagedResource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ManagedResource::Role(_) => ResourceKind::Role,
            ManagedResource::Database(_) => ResourceKind::Database,
            ManagedResource::Grant(_) => ResourceKind::Grant,
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            kind: self.kind(),
            namespace: self.namespace(),
            name: self.name(),
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            ManagedResource::Role(r) => &r.metadata,
            ManagedResource::Database(d) => &d.metadata,
            ManagedResource::Grant(g) => &g.metadata,
        }
    }

    /// Reference used when publishing events
    pub fn object_ref(&self) -> ObjectReference {
        match self {
            ManagedResource::Role(r) => r.object_ref(&()),
            ManagedResource::Database(d) => d.object_ref(&()),
            ManagedResource::Grant(g) => g.object_ref(&()),
        }
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.meta()
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|x| x == finalizer))
    }

    pub fn name(&self) -> String {
        match self {
            ManagedResource::Role(r) => r.name_any(),
            ManagedResource::Database(d) => d.name_any(),
            ManagedResource::Grant(g) => g.name_any(),
        }
    }

    pub fn namespace(&self) -> String {
        match self {
            ManagedResource::Role(r) => r.namespace(),
            ManagedResource::Database(d) => d.namespace(),
            ManagedResource::Grant(g) => g.namespace(),
        }
        .unwrap_or_default()
    }

    pub fn generation(&self) -> Option<i64> {
        self.meta().generation
    }

    pub fn status(&self) -> Option<&ResourceStatus> {
        match self {
            ManagedResource::Role(r) => r.status.as_ref(),
            ManagedResource::Database(d) => d.status.as_ref(),
            ManagedResource::Grant(g) => g.status.as_ref(),
        }
    }

    pub fn phase(&self) -> ResourcePhase {
        self.status().map(|s| s.phase).unwrap_or_default()
    }

    pub fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    /// Object keys recorded in status by the last successful apply
    pub fn owned_objects(&self) -> &[String] {
        self.status()
            .map(|s| s.owned_objects.as_slice())
            .unwrap_or_default()
    }
}

/// Every managed resource visible to the operator, used for claims and dependencies
#[derive(Clone, Debug, Default)]
pub struct RelatedResources {
    pub roles: Vec<Arc<PostgresRole>>,
    pub databases: Vec<Arc<PostgresDatabase>>,
    pub grants: Vec<Arc<PostgresGrant>>,
}

impl RelatedResources {
    /// All resources as the uniform variant
    pub fn iter(&self) -> impl Iterator<Item = ManagedResource> + '_ {
        self.roles
            .iter()
            .cloned()
            .map(ManagedResource::Role)
            .chain(self.databases.iter().cloned().map(ManagedResource::Database))
            .chain(self.grants.iter().cloned().map(ManagedResource::Grant))
    }

    /// Resources other than `key`
    pub fn others<'a>(
        &'a self,
        key: &'a ResourceKey,
    ) -> impl Iterator<Item = ManagedResource> + 'a {
        self.iter().filter(move |r| r.key() != *key)
    }

    /// Role resources declaring `role_name`, excluding `key`
    pub fn roles_named<'a>(
        &'a self,
        role_name: &'a str,
        key: &'a ResourceKey,
    ) -> impl Iterator<Item = &'a Arc<PostgresRole>> + 'a {
        self.roles.iter().filter(move |r| {
            r.spec.name == role_name
                && !(key.kind == ResourceKind::Role
                    && r.name_any() == key.name
                    && r.namespace().unwrap_or_default() == key.namespace)
        })
    }

    /// Database resources declaring `database_name`, excluding `key`
    pub fn databases_named<'a>(
        &'a self,
        database_name: &'a str,
        key: &'a ResourceKey,
    ) -> impl Iterator<Item = &'a Arc<PostgresDatabase>> + 'a {
        self.databases.iter().filter(move |d| {
            d.spec.name == database_name
                && !(key.kind == ResourceKind::Database
                    && d.name_any() == key.name
                    && d.namespace().unwrap_or_default() == key.namespace)
        })
    }
}
