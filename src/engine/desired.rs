//! Normalized desired state of one managed resource

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use crate::crd::{GrantObjectType, Privilege, ResourceKey};
use crate::postgres::sql::matches_pattern;

use super::object::{Membership, ObjectRef, OwnedObject};
use super::operation::RoleFlags;
use super::snapshot::{ActualState, ReadScope};
use super::ResolveError;

/// A role with every attribute resolved
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredRole {
    pub name: String,
    pub flags: RoleFlags,
    pub comment: Option<String>,
    pub settings: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredDatabase {
    pub name: String,
    pub owner: String,
    pub connection_limit: i32,
}

/// Which tables or sequences of a schema a grant covers
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObjectSelector {
    /// Every object of the type in the schema
    All,
    /// Names, each optionally containing `*` wildcards
    Patterns(Vec<String>),
}

impl ObjectSelector {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            ObjectSelector::All => true,
            ObjectSelector::Patterns(patterns) => {
                patterns.iter().any(|pattern| matches_pattern(pattern, name))
            }
        }
    }
}

/// Privileges one role should hold on a set of objects
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredGrant {
    pub grantee: String,
    pub database: String,
    pub object_type: GrantObjectType,
    /// Set for every type except `database`
    pub schema: Option<String>,
    pub selector: ObjectSelector,
    pub privileges: BTreeSet<Privilege>,
    pub with_grant_option: bool,
}

impl DesiredGrant {
    /// Objects this grant applies to
    ///
    /// Tables and sequences are expanded against `actual`. Objects owned by
    /// the grantee are skipped: the owner's privileges are implicit and
    /// revoking them would strip the owner.
    pub fn targets(&self, actual: &ActualState) -> Vec<ObjectRef> {
        let schema = self.schema.as_deref().unwrap_or_default();
        match self.object_type {
            GrantObjectType::Database | GrantObjectType::Schema => {
                let object = ObjectRef::new(self.object_type, &self.database, schema, "");
                if actual.object_owner(&object) == Some(self.grantee.as_str()) {
                    return Vec::new();
                }
                vec![object]
            }
            GrantObjectType::Table | GrantObjectType::Sequence => actual
                .objects
                .iter()
                .filter(|(object, owner)| {
                    object.object_type() == self.object_type
                        && object.database() == self.database
                        && object.schema() == schema
                        && self.selector.matches(object.relation())
                        && **owner != self.grantee
                })
                .map(|(object, _)| object.clone())
                .collect(),
        }
    }
}

/// Password management for a role
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredCredential {
    pub role: String,
    pub secret_namespace: String,
    pub secret_name: String,
    pub rotation: Option<Duration>,
}

/// A reference that must already exist in PostgreSQL
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExternalRef {
    Role(String),
    Database(String),
    Object(ObjectRef),
}

impl fmt::Display for ExternalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternalRef::Role(name) => write!(f, "role {}", name),
            ExternalRef::Database(name) => write!(f, "database {}", name),
            ExternalRef::Object(object) => write!(f, "{}", object),
        }
    }
}

/// Desired state of one resource, merged with its resolved dependencies
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredState {
    /// Resource this state belongs to
    pub key: ResourceKey,
    pub roles: Vec<DesiredRole>,
    /// Roles declared by other resources that are created bare when absent
    pub ensure_roles: BTreeSet<String>,
    pub memberships: BTreeSet<Membership>,
    pub databases: Vec<DesiredDatabase>,
    pub grants: Vec<DesiredGrant>,
    pub credential: Option<DesiredCredential>,
    /// References declared by no resource; checked against the catalog
    pub external_refs: BTreeSet<ExternalRef>,
    /// Objects recorded in this resource's status by the last apply
    pub previously_owned: BTreeSet<OwnedObject>,
    /// Objects claimed by other resources
    pub foreign_claims: BTreeMap<OwnedObject, ResourceKey>,
    /// Drop owned databases that are no longer desired
    pub reclaim_databases: bool,
    pub scope: ReadScope,
}

impl DesiredState {
    /// Empty state for `key`
    pub fn new(key: ResourceKey) -> Self {
        Self {
            key,
            roles: Vec::new(),
            ensure_roles: BTreeSet::new(),
            memberships: BTreeSet::new(),
            databases: Vec::new(),
            grants: Vec::new(),
            credential: None,
            external_refs: BTreeSet::new(),
            previously_owned: BTreeSet::new(),
            foreign_claims: BTreeMap::new(),
            reclaim_databases: false,
            scope: ReadScope::default(),
        }
    }

    /// State that desires nothing, used to release everything `owned`
    pub fn release(
        key: ResourceKey,
        owned: BTreeSet<OwnedObject>,
        foreign_claims: BTreeMap<OwnedObject, ResourceKey>,
        reclaim_databases: bool,
    ) -> Self {
        let schemas = owned
            .iter()
            .filter_map(|o| match o {
                OwnedObject::Acl { object, .. } if !object.schema().is_empty() => {
                    Some(object.schema().to_string())
                }
                _ => None,
            })
            .collect();
        Self {
            previously_owned: owned,
            foreign_claims,
            reclaim_databases,
            scope: ReadScope { schemas },
            ..Self::new(key)
        }
    }

    pub fn is_claimed_by_other(&self, object: &OwnedObject) -> bool {
        self.foreign_claims.contains_key(object)
    }

    /// Fail with the first external reference missing from `actual`
    pub fn check_external(&self, actual: &ActualState) -> Result<(), ResolveError> {
        for reference in &self.external_refs {
            let present = match reference {
                ExternalRef::Role(name) => actual.has_role(name),
                ExternalRef::Database(name) => actual.has_database(name),
                ExternalRef::Object(object) => actual.has_object(object),
            };
            if !present {
                return Err(ResolveError::Unresolved {
                    missing_ref: reference.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Objects this resource owns once `actual` has converged
    pub fn owned_objects(&self, actual: &ActualState) -> BTreeSet<OwnedObject> {
        let mut owned = BTreeSet::new();
        for role in &self.roles {
            owned.insert(OwnedObject::Role(role.name.clone()));
        }
        for membership in &self.memberships {
            owned.insert(OwnedObject::Membership(membership.clone()));
        }
        for database in &self.databases {
            owned.insert(OwnedObject::Database(database.name.clone()));
        }
        for grant in &self.grants {
            for object in grant.targets(actual) {
                owned.insert(OwnedObject::acl(grant.grantee.clone(), object));
            }
        }
        // Schema-level entries in another database cannot be read or revoked
        // through this connection, so they stay recorded
        owned.extend(
            self.previously_owned
                .iter()
                .filter(|o| match o {
                    OwnedObject::Acl { object, .. } => {
                        !matches!(object, ObjectRef::Database { .. })
                            && !self.grants.is_empty()
                            && self.grants.iter().all(|g| g.database != object.database())
                    }
                    _ => false,
                })
                .cloned(),
        );
        owned
    }

    /// Objects this resource wants that another resource already owns
    pub fn conflicts(&self, actual: &ActualState) -> Vec<(OwnedObject, ResourceKey)> {
        self.owned_objects(actual)
            .into_iter()
            .filter_map(|object| {
                self.foreign_claims
                    .get(&object)
                    .map(|owner| (object.clone(), owner.clone()))
            })
            .collect()
    }
}
